//! Typed business records and the lookups the engine makes against the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::types::Collection;

/// Proposal status that makes pendency notes meaningful.
pub const STATUS_WITH_PENDENCIES: &str = "with_pendencies";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub ddi: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Partner who owns the client.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pipeline_status: Option<String>,
    #[serde(default)]
    pub credit_type: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub bank: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub pendency_text: Option<String>,
    #[serde(default)]
    pub pendency_created_at: Option<Value>,
    #[serde(default)]
    pub pendency_created_by: Option<String>,
    #[serde(default)]
    pub pendencies: Vec<Value>,
    #[serde(default)]
    pub observations: Option<String>,
    #[serde(default)]
    pub observations_timeline: Vec<Value>,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Latest pendency note attached to a proposal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendencyNote {
    pub text: Option<String>,
    pub created_at: Option<Value>,
    pub created_by: Option<String>,
}

/// Proposal fields that count for a generic "updated" event.
///
/// Everything except the pendency sub-record, the pendency list, the
/// observation timeline, observations and `updatedAt`.
#[derive(Debug, PartialEq)]
pub struct ProposalSignificant<'a> {
    pub id: &'a str,
    pub client_id: Option<&'a str>,
    pub client_name: Option<&'a str>,
    pub status: Option<&'a str>,
    pub pipeline_status: Option<&'a str>,
    pub credit_type: Option<&'a str>,
    pub amount: Option<&'a Value>,
    pub bank: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub created_at: Option<&'a Value>,
    pub extra: &'a BTreeMap<String, Value>,
}

impl ProposalRecord {
    pub fn latest_pendency(&self) -> PendencyNote {
        PendencyNote {
            text: self.pendency_text.clone(),
            created_at: self.pendency_created_at.clone(),
            created_by: self.pendency_created_by.clone(),
        }
    }

    pub fn has_pendencies_status(&self) -> bool {
        self.status.as_deref() == Some(STATUS_WITH_PENDENCIES)
    }

    pub fn significant(&self) -> ProposalSignificant<'_> {
        ProposalSignificant {
            id: &self.id,
            client_id: self.client_id.as_deref(),
            client_name: self.client_name.as_deref(),
            status: self.status.as_deref(),
            pipeline_status: self.pipeline_status.as_deref(),
            credit_type: self.credit_type.as_deref(),
            amount: self.amount.as_ref(),
            bank: self.bank.as_deref(),
            user_id: self.user_id.as_deref(),
            created_at: self.created_at.as_ref(),
            extra: &self.extra,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Parse a raw store document, forcing `id` to the document id.
pub fn parse_record<T>(id: &str, raw: Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + HasId,
{
    let mut record: T = serde_json::from_value(raw)
        .map_err(|e| EngineError::record(format!("malformed record {id}: {e}")))?;
    record.set_id(id);
    Ok(record)
}

pub trait HasId {
    fn set_id(&mut self, id: &str);
}

impl HasId for ClientRecord {
    fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }
}

impl HasId for ProposalRecord {
    fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }
}

impl HasId for UserRecord {
    fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }
}

// ─── Record lookups ─────────────────────────────────────────────────────────

/// Read access to the backing document store.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_client(&self, id: &str) -> Result<Option<ClientRecord>>;
    async fn fetch_proposal(&self, id: &str) -> Result<Option<ProposalRecord>>;
    async fn fetch_user(&self, id: &str) -> Result<Option<UserRecord>>;
}

/// In-process record store kept current by the host.
#[derive(Default)]
pub struct MemoryRecordSource {
    clients: RwLock<HashMap<String, ClientRecord>>,
    proposals: RwLock<HashMap<String, ProposalRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_client(&self, record: ClientRecord) {
        if let Ok(mut map) = self.clients.write() {
            map.insert(record.id.clone(), record);
        }
    }

    pub fn upsert_proposal(&self, record: ProposalRecord) {
        if let Ok(mut map) = self.proposals.write() {
            map.insert(record.id.clone(), record);
        }
    }

    pub fn upsert_user(&self, record: UserRecord) {
        if let Ok(mut map) = self.users.write() {
            map.insert(record.id.clone(), record);
        }
    }

    /// Store a raw document from a feed or the host.
    pub fn upsert_raw(&self, collection: &str, id: &str, raw: Value) -> Result<()> {
        match collection {
            "clients" => self.upsert_client(parse_record(id, raw)?),
            "proposals" => self.upsert_proposal(parse_record(id, raw)?),
            "users" => self.upsert_user(parse_record(id, raw)?),
            other => return Err(EngineError::record(format!("unknown collection: {other}"))),
        }
        Ok(())
    }

    pub fn remove(&self, collection: Collection, id: &str) {
        match collection {
            Collection::Clients => {
                if let Ok(mut map) = self.clients.write() {
                    map.remove(id);
                }
            }
            Collection::Proposals => {
                if let Ok(mut map) = self.proposals.write() {
                    map.remove(id);
                }
            }
        }
    }
}

fn poisoned(what: &str) -> EngineError {
    EngineError::record(format!("{what} lock poisoned"))
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn fetch_client(&self, id: &str) -> Result<Option<ClientRecord>> {
        let map = self.clients.read().map_err(|_| poisoned("clients"))?;
        Ok(map.get(id).cloned())
    }

    async fn fetch_proposal(&self, id: &str) -> Result<Option<ProposalRecord>> {
        let map = self.proposals.read().map_err(|_| poisoned("proposals"))?;
        Ok(map.get(id).cloned())
    }

    async fn fetch_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let map = self.users.read().map_err(|_| poisoned("users"))?;
        Ok(map.get(id).cloned())
    }
}
