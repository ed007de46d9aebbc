//! Contact enrichment for outgoing payloads.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::records::{ClientRecord, RecordSource};
use crate::types::{Collection, ContactInfo, EntitySnapshot};

/// Looks up contact fields for the entity an event is about.
#[async_trait]
pub trait ContactInfoResolver: Send + Sync {
    /// `hint` is the record the caller already holds, if any.
    async fn resolve(
        &self,
        entity_id: &str,
        collection: Collection,
        hint: Option<&EntitySnapshot>,
    ) -> Result<ContactInfo>;
}

/// Resolver that walks client and user records from a [`RecordSource`].
pub struct RecordContactResolver {
    records: Arc<dyn RecordSource>,
}

impl RecordContactResolver {
    pub fn new(records: Arc<dyn RecordSource>) -> Self {
        Self { records }
    }

    async fn from_client(
        &self,
        client: &ClientRecord,
        partner_id: Option<&str>,
    ) -> Result<ContactInfo> {
        let mut info = ContactInfo {
            client_email: client.email.clone(),
            client_phone: client.phone.clone(),
            ddi: client.ddi.clone(),
            ..Default::default()
        };

        if let Some(partner_id) = partner_id.or(client.user_id.as_deref()) {
            if let Some(partner) = self.records.fetch_user(partner_id).await? {
                info.partner_email = partner.email;
                info.phone = partner.phone;
            }
        }
        Ok(info)
    }
}

#[async_trait]
impl ContactInfoResolver for RecordContactResolver {
    async fn resolve(
        &self,
        entity_id: &str,
        collection: Collection,
        hint: Option<&EntitySnapshot>,
    ) -> Result<ContactInfo> {
        match collection {
            Collection::Clients => {
                let client = match hint.and_then(EntitySnapshot::as_client) {
                    Some(c) => Some(c.clone()),
                    None => self.records.fetch_client(entity_id).await?,
                };
                match client {
                    Some(client) => self.from_client(&client, None).await,
                    None => Ok(ContactInfo::default()),
                }
            }
            Collection::Proposals => {
                let proposal = match hint.and_then(EntitySnapshot::as_proposal) {
                    Some(p) => Some(p.clone()),
                    None => self.records.fetch_proposal(entity_id).await?,
                };
                let Some(proposal) = proposal else {
                    return Ok(ContactInfo::default());
                };
                let client = match proposal.client_id.as_deref() {
                    Some(client_id) => self.records.fetch_client(client_id).await?,
                    None => None,
                };
                match client {
                    Some(client) => self.from_client(&client, proposal.user_id.as_deref()).await,
                    None => Ok(ContactInfo::default()),
                }
            }
        }
    }
}
