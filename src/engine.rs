//! Long-lived service that owns all engine state.

use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::contact::ContactInfoResolver;
use crate::differ::{ClientDiffer, ProposalDiffer};
use crate::dispatcher::{Dispatcher, SpawnDispatch};
use crate::error::Result;
use crate::listener::{spawn_listener, ChangeFeed, CollectionDiffer, ListenerContext, ListenerHandle};
use crate::records::RecordSource;
use crate::registry::{ConfigStore, WebhookRegistry};
use crate::store::DeliveryLog;
use crate::throttle::ThrottleGate;
use crate::types::{Collection, SessionUser};

pub struct WebhookEngine {
    registry: Arc<WebhookRegistry>,
    throttle: Arc<ThrottleGate>,
    clients: Arc<ClientDiffer>,
    proposals: Arc<ProposalDiffer>,
    records: Arc<dyn RecordSource>,
    deliveries: Arc<DeliveryLog>,
    dispatcher: Arc<Dispatcher>,
}

impl WebhookEngine {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn ConfigStore>,
        records: Arc<dyn RecordSource>,
        contacts: Arc<dyn ContactInfoResolver>,
        deliveries: Arc<DeliveryLog>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(WebhookRegistry::new(store, config.cache_ttl()));
        let throttle = Arc::new(ThrottleGate::new(config.throttle_max_entries));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            throttle.clone(),
            contacts,
            records.clone(),
            deliveries.clone(),
            config,
        )?);

        Ok(Self {
            registry,
            throttle,
            clients: Arc::new(ClientDiffer::new()),
            proposals: Arc::new(ProposalDiffer::new()),
            records,
            deliveries,
            dispatcher,
        })
    }

    /// Start one listener per collection for `session`.
    ///
    /// Returns `None` without subscribing when the session's role does not
    /// watch feeds.
    pub fn start(&self, session: &SessionUser, feed: Arc<dyn ChangeFeed>) -> Option<EngineHandle> {
        if !session.role.watches_feeds() {
            info!(role = session.role.as_str(), "session role does not watch change feeds");
            return None;
        }

        let sink = Arc::new(SpawnDispatch(self.dispatcher.clone()));
        let differs = [
            CollectionDiffer::Clients(self.clients.clone()),
            CollectionDiffer::Proposals(self.proposals.clone()),
        ];
        let listeners = differs
            .into_iter()
            .map(|differ| {
                spawn_listener(
                    feed.clone(),
                    ListenerContext {
                        differ,
                        records: self.records.clone(),
                        sink: sink.clone(),
                        actor: session.clone(),
                    },
                )
            })
            .collect();

        info!(user_id = %session.id, "webhook engine started");
        Some(EngineHandle { listeners })
    }

    /// Forget throttle history, entity snapshots and cached subscriber configs.
    pub fn reset(&self) {
        self.throttle.reset();
        self.clients.reset();
        self.proposals.reset();
        self.registry.invalidate();
    }

    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn deliveries(&self) -> &Arc<DeliveryLog> {
        &self.deliveries
    }

    pub fn tracked_entities(&self, collection: Collection) -> usize {
        match collection {
            Collection::Clients => self.clients.tracked(),
            Collection::Proposals => self.proposals.tracked(),
        }
    }
}

/// Running listeners for one session.
pub struct EngineHandle {
    listeners: Vec<ListenerHandle>,
}

impl EngineHandle {
    pub fn collections(&self) -> Vec<Collection> {
        self.listeners.iter().map(ListenerHandle::collection).collect()
    }

    /// Stop every listener and wait for it to unsubscribe.
    pub async fn stop(self) {
        for listener in self.listeners {
            listener.stop().await;
        }
        info!("webhook engine stopped");
    }
}
