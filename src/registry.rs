//! Subscriber configuration cache.
//!
//! Configs are read from a [`ConfigStore`] and kept for a bounded window.
//! Concurrent callers that find the cache cold share a single in-flight
//! load. A failed load is logged and reported as "no subscribers"; it is
//! not cached, so the next call tries again.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{EventKind, LegacyWebhookConfig, WebhookSubscriber};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Where subscriber configs live.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_subscribers(&self) -> Result<Vec<WebhookSubscriber>>;

    /// Single-endpoint record from before per-subscriber configuration.
    async fn load_legacy(&self) -> Result<Option<LegacyWebhookConfig>>;
}

type Subscribers = Arc<Vec<WebhookSubscriber>>;
type LoadFuture = Shared<BoxFuture<'static, std::result::Result<Subscribers, String>>>;

struct Cached {
    loaded_at: Instant,
    subscribers: Subscribers,
}

#[derive(Default)]
struct RegistryState {
    cache: Option<Cached>,
    in_flight: Option<LoadFuture>,
    /// Bumped by `invalidate` so a load started earlier cannot repopulate.
    generation: u64,
}

pub struct WebhookRegistry {
    store: Arc<dyn ConfigStore>,
    ttl: Duration,
    state: Arc<Mutex<RegistryState>>,
}

impl WebhookRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    /// Subscribers that are enabled, have a URL, and opted into `kind`.
    pub async fn enabled_subscribers(&self, kind: EventKind) -> Vec<WebhookSubscriber> {
        self.all_subscribers()
            .await
            .iter()
            .filter(|s| s.accepts(kind))
            .cloned()
            .collect()
    }

    /// Every configured subscriber, loading or refreshing the cache as needed.
    pub async fn all_subscribers(&self) -> Subscribers {
        let load = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = &state.cache {
                if cached.loaded_at.elapsed() < self.ttl {
                    return cached.subscribers.clone();
                }
            }
            match &state.in_flight {
                Some(load) => load.clone(),
                None => {
                    let load = Self::load(self.store.clone(), self.state.clone(), state.generation)
                        .boxed()
                        .shared();
                    state.in_flight = Some(load.clone());
                    load
                }
            }
        };

        load.await.unwrap_or_default()
    }

    /// Drop the cached configs; the next lookup reloads.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cache = None;
        state.in_flight = None;
        state.generation += 1;
    }

    async fn load(
        store: Arc<dyn ConfigStore>,
        state: Arc<Mutex<RegistryState>>,
        generation: u64,
    ) -> std::result::Result<Subscribers, String> {
        let outcome = Self::fetch(store.as_ref()).await.map(Arc::new);

        let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
        if st.generation == generation {
            st.in_flight = None;
            if let Ok(subscribers) = &outcome {
                st.cache = Some(Cached {
                    loaded_at: Instant::now(),
                    subscribers: subscribers.clone(),
                });
            }
        }

        outcome.map_err(|e| {
            warn!(error = %e, "failed to load webhook subscribers");
            e.to_string()
        })
    }

    async fn fetch(store: &dyn ConfigStore) -> Result<Vec<WebhookSubscriber>> {
        let subscribers = store.load_subscribers().await?;
        if !subscribers.is_empty() {
            debug!(count = subscribers.len(), "loaded webhook subscribers");
            return Ok(subscribers);
        }

        match store.load_legacy().await? {
            Some(legacy) => {
                debug!("no subscribers configured, using legacy webhook config");
                Ok(vec![WebhookSubscriber::from(legacy)])
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::types::{EventMatrix, ThrottleConfig, LEGACY_SUBSCRIBER_ID};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        subscribers: Vec<WebhookSubscriber>,
        legacy: Option<LegacyWebhookConfig>,
        loads: AtomicUsize,
        fail_first: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ConfigStore for CountingStore {
        async fn load_subscribers(&self) -> Result<Vec<WebhookSubscriber>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_first && n == 0 {
                return Err(EngineError::store("connection reset"));
            }
            Ok(self.subscribers.clone())
        }

        async fn load_legacy(&self) -> Result<Option<LegacyWebhookConfig>> {
            Ok(self.legacy.clone())
        }
    }

    fn sub(id: &str, enabled: bool, url: &str, matrix: EventMatrix) -> WebhookSubscriber {
        WebhookSubscriber {
            id: id.into(),
            name: id.into(),
            url: url.into(),
            secret: String::new(),
            enabled,
            event_matrix: matrix,
            throttle: ThrottleConfig::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn functional_concurrent_cold_calls_share_one_load() {
        let store = Arc::new(CountingStore {
            subscribers: vec![sub("s1", true, "http://a", EventMatrix::all())],
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let registry = WebhookRegistry::new(store.clone(), DEFAULT_CACHE_TTL);

        let (a, b) = tokio::join!(
            registry.enabled_subscribers(EventKind::ClientCreated),
            registry.enabled_subscribers(EventKind::ClientUpdated),
        );
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_cache_expires_after_ttl() {
        let store = Arc::new(CountingStore {
            subscribers: vec![sub("s1", true, "http://a", EventMatrix::all())],
            ..Default::default()
        });
        let registry = WebhookRegistry::new(store.clone(), DEFAULT_CACHE_TTL);

        registry.all_subscribers().await;
        tokio::time::advance(Duration::from_secs(299)).await;
        registry.all_subscribers().await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        registry.all_subscribers().await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unit_filters_disabled_urlless_and_unsubscribed() {
        let mut clients_only = EventMatrix::default();
        clients_only.clients.created = true;
        let store = Arc::new(CountingStore {
            subscribers: vec![
                sub("on", true, "http://a", clients_only),
                sub("off", false, "http://b", EventMatrix::all()),
                sub("no-url", true, "", EventMatrix::all()),
                sub("proposals", true, "http://c", EventMatrix::default()),
            ],
            ..Default::default()
        });
        let registry = WebhookRegistry::new(store, DEFAULT_CACHE_TTL);

        let ids: Vec<String> = registry
            .enabled_subscribers(EventKind::ClientCreated)
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["on".to_string()]);
        assert!(registry
            .enabled_subscribers(EventKind::ProposalCreated)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn functional_legacy_config_used_when_no_subscribers() {
        let store = Arc::new(CountingStore {
            legacy: Some(LegacyWebhookConfig {
                url: "http://legacy".into(),
                secret: "old".into(),
                enabled: true,
                events: None,
            }),
            ..Default::default()
        });
        let registry = WebhookRegistry::new(store, DEFAULT_CACHE_TTL);
        let subs = registry
            .enabled_subscribers(EventKind::PipelineStatusChanged)
            .await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, LEGACY_SUBSCRIBER_ID);
        assert_eq!(subs[0].secret, "old");
    }

    #[tokio::test]
    async fn regression_failed_load_degrades_to_empty_and_retries() {
        let store = Arc::new(CountingStore {
            subscribers: vec![sub("s1", true, "http://a", EventMatrix::all())],
            fail_first: true,
            ..Default::default()
        });
        let registry = WebhookRegistry::new(store.clone(), DEFAULT_CACHE_TTL);

        assert!(registry.enabled_subscribers(EventKind::ClientCreated).await.is_empty());
        assert_eq!(registry.enabled_subscribers(EventKind::ClientCreated).await.len(), 1);
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unit_invalidate_forces_reload() {
        let store = Arc::new(CountingStore::default());
        let registry = WebhookRegistry::new(store.clone(), DEFAULT_CACHE_TTL);
        registry.all_subscribers().await;
        registry.invalidate();
        registry.all_subscribers().await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }
}
