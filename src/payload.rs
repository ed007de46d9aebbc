//! Outgoing webhook body.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::labels::{pipeline_label, status_label};
use crate::types::{ContactInfo, EntitySnapshot, Event, EventKind};

/// Fields that never leave the engine.
const INTERNAL_FIELDS: &[&str] = &["pendencies", "observationsTimeline"];

/// `{ "event", "timestamp", "data" }` as posted to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEnvelope {
    pub event: EventKind,
    pub timestamp: String,
    pub data: Map<String, Value>,
}

/// Values recovered by the dispatcher for pipeline events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineBackfill {
    pub client_id: Option<String>,
    pub actor_email: Option<String>,
}

pub fn build_payload(
    event: &Event,
    contact: &ContactInfo,
    backfill: &PipelineBackfill,
) -> WebhookEnvelope {
    let mut data = match serde_json::to_value(&event.current) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for field in INTERNAL_FIELDS {
        data.remove(*field);
    }
    data.insert("id".into(), json!(event.entity_id));

    let collection = event.current.collection();
    let status = event.current.status();
    data.insert("statusCode".into(), json!(status.unwrap_or_default()));
    data.insert("status".into(), json!(status_label(collection, status)));

    if let EntitySnapshot::Proposal(proposal) = &event.current {
        let stage = proposal.pipeline_status.as_deref();
        data.insert("pipelineStatusCode".into(), json!(stage.unwrap_or_default()));
        data.insert("pipelineStatus".into(), json!(pipeline_label(stage)));
    }

    match event.kind {
        EventKind::ClientStatusChanged | EventKind::ProposalStatusChanged => {
            let old = event.previous.as_ref().and_then(EntitySnapshot::status);
            data.insert("oldStatus".into(), json!(status_label(collection, old)));
            data.insert("newStatus".into(), json!(status_label(collection, status)));
            data.insert("oldStatusCode".into(), json!(old.unwrap_or_default()));
            data.insert("newStatusCode".into(), json!(status.unwrap_or_default()));

            if let Some(proposal) = event.current.as_proposal() {
                if proposal.has_pendencies_status() {
                    data.insert("pendency".into(), json!(proposal.latest_pendency()));
                }
            }
        }
        EventKind::PipelineStatusChanged => {
            let old_stage = event
                .previous
                .as_ref()
                .and_then(EntitySnapshot::as_proposal)
                .and_then(|p| p.pipeline_status.as_deref());
            data.insert("oldPipelineStatus".into(), json!(pipeline_label(old_stage)));
            data.insert(
                "oldPipelineStatusCode".into(),
                json!(old_stage.unwrap_or_default()),
            );

            let client_id = event
                .current
                .as_proposal()
                .and_then(|p| p.client_id.clone())
                .or_else(|| backfill.client_id.clone())
                .unwrap_or_default();
            data.insert("clientId".into(), json!(client_id));

            let changed_by = match &event.actor {
                Some(actor) => json!({
                    "id": actor.id,
                    "name": actor.name,
                    "role": actor.role.as_str(),
                    "email": actor
                        .email
                        .clone()
                        .or_else(|| backfill.actor_email.clone())
                        .unwrap_or_default(),
                }),
                None => json!({
                    "id": "",
                    "name": "",
                    "role": "",
                    "email": backfill.actor_email.clone().unwrap_or_default(),
                }),
            };
            data.insert("changedBy".into(), changed_by);
        }
        _ => {}
    }

    let contact_fields = [
        ("clientEmail", &contact.client_email),
        ("clientPhone", &contact.client_phone),
        ("ddi", &contact.ddi),
        ("partnerEmail", &contact.partner_email),
        ("phone", &contact.phone),
    ];
    for (key, value) in contact_fields {
        data.insert(key.into(), json!(value.clone().unwrap_or_default()));
    }

    WebhookEnvelope {
        event: event.kind,
        timestamp: event.timestamp.to_rfc3339(),
        data,
    }
}
