//! Subscriber fan-out.
//!
//! Delivery is best-effort and at-most-once: every surviving subscriber gets
//! one concurrent POST, failures are logged and recorded, nothing is retried.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::contact::ContactInfoResolver;
use crate::error::Result;
use crate::listener::EventSink;
use crate::payload::{build_payload, PipelineBackfill, WebhookEnvelope};
use crate::records::RecordSource;
use crate::registry::WebhookRegistry;
use crate::store::{DeliveryLog, DeliveryRecord, DeliveryStatus};
use crate::throttle::ThrottleGate;
use crate::types::{ContactInfo, EntitySnapshot, Event, EventKind, WebhookSubscriber};

/// What happened to one dispatched event.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event: EventKind,
    pub entity_id: String,
    /// Subscribers enabled for the event kind.
    pub candidates: usize,
    /// Candidates dropped by the throttle gate.
    pub suppressed: usize,
    pub outcomes: Vec<DeliveryRecord>,
}

impl DispatchReport {
    fn empty(event: &Event) -> Self {
        Self {
            event: event.kind,
            entity_id: event.entity_id.clone(),
            candidates: 0,
            suppressed: 0,
            outcomes: Vec::new(),
        }
    }

    /// At least one subscriber accepted the delivery.
    pub fn delivered(&self) -> bool {
        self.outcomes.iter().any(DeliveryRecord::succeeded)
    }
}

pub struct Dispatcher {
    registry: Arc<WebhookRegistry>,
    throttle: Arc<ThrottleGate>,
    contacts: Arc<dyn ContactInfoResolver>,
    records: Arc<dyn RecordSource>,
    deliveries: Arc<DeliveryLog>,
    client: reqwest::Client,
    secret_header: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        throttle: Arc<ThrottleGate>,
        contacts: Arc<dyn ContactInfoResolver>,
        records: Arc<dyn RecordSource>,
        deliveries: Arc<DeliveryLog>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            registry,
            throttle,
            contacts,
            records,
            deliveries,
            client,
            secret_header: config.secret_header.clone(),
        })
    }

    #[tracing::instrument(skip_all, fields(event = %event.kind, entity_id = %event.entity_id))]
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::empty(event);

        let candidates = self.registry.enabled_subscribers(event.kind).await;
        report.candidates = candidates.len();
        if candidates.is_empty() {
            debug!("no subscribers enabled for event");
            return report;
        }

        let targets: Vec<WebhookSubscriber> = candidates
            .into_iter()
            .filter(|s| {
                let suppress = self.throttle.should_suppress(s, event.kind, &event.entity_id);
                if suppress {
                    debug!(subscriber_id = %s.id, "throttled");
                }
                !suppress
            })
            .collect();
        report.suppressed = report.candidates - targets.len();
        if targets.is_empty() {
            return report;
        }

        let backfill = if event.kind == EventKind::PipelineStatusChanged {
            self.backfill_pipeline(event).await
        } else {
            PipelineBackfill::default()
        };
        let contact = self.resolve_contact(event, &backfill).await;
        let envelope = build_payload(event, &contact, &backfill);

        let sends = targets.iter().map(|s| self.send(s, event, &envelope));
        report.outcomes = join_all(sends).await;

        for outcome in &report.outcomes {
            self.deliveries.record(outcome.clone());
        }

        let succeeded = report.outcomes.iter().filter(|o| o.succeeded()).count();
        if succeeded > 0 {
            info!(
                succeeded,
                failed = report.outcomes.len() - succeeded,
                "webhook dispatched"
            );
        } else {
            warn!(attempted = report.outcomes.len(), "webhook dispatch failed for every subscriber");
        }
        report
    }

    async fn resolve_contact(&self, event: &Event, backfill: &PipelineBackfill) -> ContactInfo {
        // Resolve against the backfilled client when the snapshot lacks one.
        let patched = match (event.current.as_proposal(), backfill.client_id.as_ref()) {
            (Some(proposal), Some(client_id)) if proposal.client_id.is_none() => {
                let mut proposal = proposal.clone();
                proposal.client_id = Some(client_id.clone());
                Some(EntitySnapshot::Proposal(proposal))
            }
            _ => None,
        };
        let hint = patched.as_ref().unwrap_or(&event.current);

        match self
            .contacts
            .resolve(&event.entity_id, event.kind.collection(), Some(hint))
            .await
        {
            Ok(contact) => contact,
            Err(e) => {
                warn!(error = %e, "contact resolution failed, sending without contact fields");
                ContactInfo::default()
            }
        }
    }

    /// Best-effort: a failed lookup leaves the field empty.
    async fn backfill_pipeline(&self, event: &Event) -> PipelineBackfill {
        let mut backfill = PipelineBackfill::default();

        let mut client_id = event.current.as_proposal().and_then(|p| p.client_id.clone());
        if client_id.is_none() {
            match self.records.fetch_proposal(&event.entity_id).await {
                Ok(Some(proposal)) => {
                    client_id = proposal.client_id;
                    backfill.client_id = client_id.clone();
                }
                Ok(None) => debug!("proposal not found for client id backfill"),
                Err(e) => warn!(error = %e, "client id backfill failed"),
            }
        }

        let has_email = event.actor.as_ref().and_then(|a| a.email.as_ref()).is_some();
        if !has_email {
            if let Some(client_id) = client_id.as_deref() {
                backfill.actor_email = self.owner_email(client_id).await;
            }
        }
        backfill
    }

    async fn owner_email(&self, client_id: &str) -> Option<String> {
        let client = match self.records.fetch_client(client_id).await {
            Ok(client) => client?,
            Err(e) => {
                warn!(error = %e, "user email backfill failed");
                return None;
            }
        };
        match self.records.fetch_user(client.user_id.as_deref()?).await {
            Ok(user) => user?.email,
            Err(e) => {
                warn!(error = %e, "user email backfill failed");
                None
            }
        }
    }

    async fn send(
        &self,
        subscriber: &WebhookSubscriber,
        event: &Event,
        envelope: &WebhookEnvelope,
    ) -> DeliveryRecord {
        let mut record = DeliveryRecord {
            id: Uuid::new_v4().to_string(),
            subscriber_id: subscriber.id.clone(),
            event: event.kind,
            entity_id: event.entity_id.clone(),
            sent_at: Utc::now(),
            status: DeliveryStatus::Failed,
            http_status: None,
            error: None,
        };

        let result = self
            .client
            .post(&subscriber.url)
            .header(self.secret_header.as_str(), subscriber.secret.as_str())
            .json(envelope)
            .send()
            .await;

        match result {
            Ok(resp) => {
                let status = resp.status();
                record.http_status = Some(status.as_u16());
                if status.is_success() {
                    record.status = DeliveryStatus::Success;
                    debug!(subscriber_id = %subscriber.id, status = status.as_u16(), "delivered");
                } else {
                    warn!(subscriber_id = %subscriber.id, status = status.as_u16(), "subscriber rejected webhook");
                    record.error = Some(format!("HTTP {status}"));
                }
            }
            Err(e) => {
                warn!(subscriber_id = %subscriber.id, error = %e, "webhook request failed");
                record.error = Some(e.to_string());
            }
        }
        record
    }
}

/// [`EventSink`] that dispatches each event on its own task, so listener
/// teardown never cancels a fan-out already under way.
pub struct SpawnDispatch(pub Arc<Dispatcher>);

impl EventSink for SpawnDispatch {
    fn emit(&self, event: Event) {
        let dispatcher = self.0.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&event).await;
        });
    }
}
