use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::records::{ClientRecord, ProposalRecord};

// ─── Collections and changes ────────────────────────────────────────────────

/// A watched entity collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Clients,
    Proposals,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Clients => "clients",
            Collection::Proposals => "proposals",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change reported by a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ClientCreated,
    ClientUpdated,
    ClientStatusChanged,
    ProposalCreated,
    ProposalUpdated,
    ProposalStatusChanged,
    PipelineStatusChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::ClientCreated,
        EventKind::ClientUpdated,
        EventKind::ClientStatusChanged,
        EventKind::ProposalCreated,
        EventKind::ProposalUpdated,
        EventKind::ProposalStatusChanged,
        EventKind::PipelineStatusChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ClientCreated => "client_created",
            EventKind::ClientUpdated => "client_updated",
            EventKind::ClientStatusChanged => "client_status_changed",
            EventKind::ProposalCreated => "proposal_created",
            EventKind::ProposalUpdated => "proposal_updated",
            EventKind::ProposalStatusChanged => "proposal_status_changed",
            EventKind::PipelineStatusChanged => "pipeline_status_changed",
        }
    }

    /// Collection the event's entity lives in.
    pub fn collection(&self) -> Collection {
        match self {
            EventKind::ClientCreated
            | EventKind::ClientUpdated
            | EventKind::ClientStatusChanged => Collection::Clients,
            _ => Collection::Proposals,
        }
    }

    /// Pipeline stage changes are never throttled.
    pub fn is_throttle_exempt(&self) -> bool {
        matches!(self, EventKind::PipelineStatusChanged)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full record observed for an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntitySnapshot {
    Client(ClientRecord),
    Proposal(ProposalRecord),
}

impl EntitySnapshot {
    pub fn collection(&self) -> Collection {
        match self {
            EntitySnapshot::Client(_) => Collection::Clients,
            EntitySnapshot::Proposal(_) => Collection::Proposals,
        }
    }

    pub fn status(&self) -> Option<&str> {
        match self {
            EntitySnapshot::Client(c) => c.status.as_deref(),
            EntitySnapshot::Proposal(p) => p.status.as_deref(),
        }
    }

    pub fn as_client(&self) -> Option<&ClientRecord> {
        match self {
            EntitySnapshot::Client(c) => Some(c),
            EntitySnapshot::Proposal(_) => None,
        }
    }

    pub fn as_proposal(&self) -> Option<&ProposalRecord> {
        match self {
            EntitySnapshot::Proposal(p) => Some(p),
            EntitySnapshot::Client(_) => None,
        }
    }
}

/// Unit handed from the differ to the dispatcher.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub entity_id: String,
    pub previous: Option<EntitySnapshot>,
    pub current: EntitySnapshot,
    /// Acting user, stamped on pipeline stage changes.
    pub actor: Option<SessionUser>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        entity_id: impl Into<String>,
        previous: Option<EntitySnapshot>,
        current: EntitySnapshot,
    ) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            previous,
            current,
            actor: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: SessionUser) -> Self {
        self.actor = Some(actor);
        self
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

/// Dashboard role. Roles this engine has no rule for keep their raw name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Manager,
    Partner,
    Analyst,
    Other(String),
}

impl Role {
    /// Only back-office roles run the change feed listeners.
    pub fn watches_feeds(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Partner => "partner",
            Role::Analyst => "analyst",
            Role::Other(raw) => raw,
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "admin" => Role::Admin,
            "manager" => Role::Manager,
            "partner" => Role::Partner,
            "analyst" => Role::Analyst,
            _ => Role::Other(raw),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// Signed-in user of the hosting session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub email: Option<String>,
}

// ─── Subscribers ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityEvents {
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub updated: bool,
    #[serde(default)]
    pub status_changed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvents {
    #[serde(default)]
    pub status_changed: bool,
}

/// Which event kinds a subscriber wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMatrix {
    #[serde(default)]
    pub clients: EntityEvents,
    #[serde(default)]
    pub proposals: EntityEvents,
    #[serde(default)]
    pub pipeline: PipelineEvents,
}

impl EventMatrix {
    pub fn all() -> Self {
        let every = EntityEvents {
            created: true,
            updated: true,
            status_changed: true,
        };
        Self {
            clients: every,
            proposals: every,
            pipeline: PipelineEvents {
                status_changed: true,
            },
        }
    }

    pub fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::ClientCreated => self.clients.created,
            EventKind::ClientUpdated => self.clients.updated,
            EventKind::ClientStatusChanged => self.clients.status_changed,
            EventKind::ProposalCreated => self.proposals.created,
            EventKind::ProposalUpdated => self.proposals.updated,
            EventKind::ProposalStatusChanged => self.proposals.status_changed,
            EventKind::PipelineStatusChanged => self.pipeline.status_changed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_seconds: u64,
}

/// One configured HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscriber {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub event_matrix: EventMatrix,
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl WebhookSubscriber {
    /// Enabled, has a URL, and opted into `kind`.
    pub fn accepts(&self, kind: EventKind) -> bool {
        self.enabled && !self.url.trim().is_empty() && self.event_matrix.allows(kind)
    }
}

/// Single-endpoint record that predates per-subscriber configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyWebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub events: Option<EventMatrix>,
}

pub const LEGACY_SUBSCRIBER_ID: &str = "legacy";

impl From<LegacyWebhookConfig> for WebhookSubscriber {
    fn from(legacy: LegacyWebhookConfig) -> Self {
        Self {
            id: LEGACY_SUBSCRIBER_ID.to_string(),
            name: "Legacy webhook".to_string(),
            url: legacy.url,
            secret: legacy.secret,
            enabled: legacy.enabled,
            event_matrix: legacy.events.unwrap_or_else(EventMatrix::all),
            throttle: ThrottleConfig::default(),
        }
    }
}

// ─── Contact enrichment ─────────────────────────────────────────────────────

/// Contact fields merged into every outgoing payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub ddi: Option<String>,
    pub partner_email: Option<String>,
    pub phone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_event_kind_serializes_to_snake_case_names() {
        for kind in EventKind::ALL {
            let value = serde_json::to_value(kind).unwrap();
            assert_eq!(value, json!(kind.as_str()));
        }
    }

    #[test]
    fn unit_subscriber_deserializes_camel_case_matrix() {
        let sub: WebhookSubscriber = serde_json::from_value(json!({
            "id": "s1",
            "name": "CRM",
            "url": "https://crm.example/hook",
            "secret": "shh",
            "enabled": true,
            "eventMatrix": {
                "clients": { "created": true, "statusChanged": true },
                "pipeline": { "statusChanged": true }
            },
            "throttle": { "enabled": true, "intervalSeconds": 60 }
        }))
        .unwrap();

        assert!(sub.accepts(EventKind::ClientCreated));
        assert!(sub.accepts(EventKind::ClientStatusChanged));
        assert!(sub.accepts(EventKind::PipelineStatusChanged));
        assert!(!sub.accepts(EventKind::ClientUpdated));
        assert!(!sub.accepts(EventKind::ProposalCreated));
        assert_eq!(sub.throttle.interval_seconds, 60);
    }

    #[test]
    fn unit_subscriber_without_url_accepts_nothing() {
        let sub = WebhookSubscriber {
            id: "s1".into(),
            name: String::new(),
            url: "   ".into(),
            secret: String::new(),
            enabled: true,
            event_matrix: EventMatrix::all(),
            throttle: ThrottleConfig::default(),
        };
        assert!(EventKind::ALL.iter().all(|k| !sub.accepts(*k)));
    }

    #[test]
    fn unit_legacy_config_without_events_enables_everything() {
        let legacy: LegacyWebhookConfig = serde_json::from_value(json!({
            "url": "https://old.example/hook",
            "secret": "s",
            "enabled": true
        }))
        .unwrap();
        let sub = WebhookSubscriber::from(legacy);
        assert_eq!(sub.id, LEGACY_SUBSCRIBER_ID);
        assert!(EventKind::ALL.iter().all(|k| sub.accepts(*k)));
        assert!(!sub.throttle.enabled);
    }

    #[test]
    fn regression_unknown_role_keeps_its_raw_name() {
        let user: SessionUser =
            serde_json::from_value(json!({ "id": "u", "name": "N", "role": "intern" })).unwrap();
        assert_eq!(user.role, Role::Other("intern".into()));
        assert_eq!(user.role.as_str(), "intern");
        assert!(!user.role.watches_feeds());
        assert_eq!(serde_json::to_value(&user).unwrap()["role"], "intern");

        let manager: SessionUser =
            serde_json::from_value(json!({ "id": "m", "name": "M", "role": "manager" })).unwrap();
        assert_eq!(manager.role, Role::Manager);
        assert!(manager.role.watches_feeds());
    }
}
