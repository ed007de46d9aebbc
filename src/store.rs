use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::registry::ConfigStore;
use crate::types::{EventKind, LegacyWebhookConfig, WebhookSubscriber};

pub const DEFAULT_DELIVERY_HISTORY: usize = 50;

const SUBSCRIBERS_FILE: &str = "webhooks.json";
const LEGACY_FILE: &str = "webhook_config.json";
const DELIVERIES_DIR: &str = "deliveries";

// ─── Subscriber configs on disk ─────────────────────────────────────────────

/// Reads `webhooks.json` and the legacy `webhook_config.json` from a data dir.
pub struct FileConfigStore {
    data_dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    async fn read_optional(&self, name: &str) -> Result<Option<String>> {
        let path = self.data_dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::store(format!("failed to read {name}: {e}"))),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load_subscribers(&self) -> Result<Vec<WebhookSubscriber>> {
        match self.read_optional(SUBSCRIBERS_FILE).await? {
            Some(content) => serde_json::from_str(&content)
                .map_err(|e| EngineError::store(format!("failed to parse {SUBSCRIBERS_FILE}: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    async fn load_legacy(&self) -> Result<Option<LegacyWebhookConfig>> {
        match self.read_optional(LEGACY_FILE).await? {
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| EngineError::store(format!("failed to parse {LEGACY_FILE}: {e}"))),
            None => Ok(None),
        }
    }
}

// ─── Delivery history ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

/// Outcome of one POST to one subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub subscriber_id: String,
    pub event: EventKind,
    pub entity_id: String,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub http_status: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryRecord {
    pub fn succeeded(&self) -> bool {
        self.status == DeliveryStatus::Success
    }
}

/// Bounded per-subscriber history of delivery attempts.
///
/// Observability only: nothing here is ever redelivered.
pub struct DeliveryLog {
    deliveries: Mutex<HashMap<String, VecDeque<DeliveryRecord>>>,
    capacity: usize,
    data_dir: Option<PathBuf>,
}

impl DeliveryLog {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            deliveries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            data_dir: None,
        }
    }

    /// History that can be persisted under `<data_dir>/deliveries/`.
    pub fn persistent(data_dir: PathBuf, capacity: usize) -> Self {
        Self {
            data_dir: Some(data_dir),
            ..Self::in_memory(capacity)
        }
    }

    pub fn record(&self, delivery: DeliveryRecord) {
        let mut map = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        let queue = map.entry(delivery.subscriber_id.clone()).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(delivery);
    }

    /// Newest first.
    pub fn recent(&self, subscriber_id: &str) -> Vec<DeliveryRecord> {
        let map = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        map.get(subscriber_id)
            .map(|q| q.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        let map = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Restore history written by [`DeliveryLog::save`]. Unreadable files are skipped.
    pub fn load(&self) -> Result<()> {
        let Some(dir) = self.data_dir.as_ref().map(|d| d.join(DELIVERIES_DIR)) else {
            return Ok(());
        };
        if !dir.exists() {
            return Ok(());
        }

        let mut map = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let parsed = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<Vec<DeliveryRecord>>(&content).ok());
            match parsed {
                Some(mut items) => {
                    let excess = items.len().saturating_sub(self.capacity);
                    items.drain(..excess);
                    map.insert(id, VecDeque::from(items));
                }
                None => warn!(path = %path.display(), "skipping unreadable delivery history"),
            }
        }
        Ok(())
    }

    /// Write every subscriber's history to disk. No-op for in-memory logs.
    pub fn save(&self) -> Result<()> {
        let Some(dir) = self.data_dir.as_ref().map(|d| d.join(DELIVERIES_DIR)) else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir)?;

        let map = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        for (id, queue) in map.iter() {
            if !is_safe_file_stem(id) {
                warn!(subscriber_id = %id, "not persisting history for unsafe subscriber id");
                continue;
            }
            let items: Vec<&DeliveryRecord> = queue.iter().collect();
            let content = serde_json::to_string_pretty(&items)?;
            let path = dir.join(format!("{id}.json"));
            if let Err(e) = std::fs::write(&path, content) {
                warn!(path = %path.display(), error = %e, "failed to write delivery history");
            }
        }
        Ok(())
    }
}

/// Subscriber ids come from `webhooks.json` and must stay inside `deliveries/`.
fn is_safe_file_stem(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::in_memory(DEFAULT_DELIVERY_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(subscriber: &str, n: usize) -> DeliveryRecord {
        DeliveryRecord {
            id: format!("d{n}"),
            subscriber_id: subscriber.into(),
            event: EventKind::ClientCreated,
            entity_id: "c1".into(),
            sent_at: Utc::now(),
            status: DeliveryStatus::Success,
            http_status: Some(200),
            error: None,
        }
    }

    #[tokio::test]
    async fn functional_file_store_reads_subscribers_and_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().to_path_buf());
        assert!(store.load_subscribers().await.unwrap().is_empty());
        assert!(store.load_legacy().await.unwrap().is_none());

        std::fs::write(
            dir.path().join(SUBSCRIBERS_FILE),
            json!([{ "id": "s1", "url": "http://a", "enabled": true }]).to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(LEGACY_FILE),
            json!({ "url": "http://legacy", "enabled": true }).to_string(),
        )
        .unwrap();

        let subs = store.load_subscribers().await.unwrap();
        assert_eq!(subs[0].id, "s1");
        assert!(!subs[0].throttle.enabled);
        let legacy = store.load_legacy().await.unwrap().unwrap();
        assert_eq!(legacy.url, "http://legacy");
    }

    #[tokio::test]
    async fn regression_malformed_subscribers_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SUBSCRIBERS_FILE), "{not json").unwrap();
        let store = FileConfigStore::new(dir.path().to_path_buf());
        assert!(matches!(
            store.load_subscribers().await,
            Err(EngineError::Store(_))
        ));
    }

    #[test]
    fn unit_delivery_log_is_bounded_and_newest_first() {
        let log = DeliveryLog::in_memory(3);
        for n in 0..5 {
            log.record(delivery("s1", n));
        }
        let ids: Vec<String> = log.recent("s1").into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["d4", "d3", "d2"]);
        assert!(log.recent("unknown").is_empty());
    }

    #[test]
    fn functional_delivery_log_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeliveryLog::persistent(dir.path().to_path_buf(), 10);
        log.record(delivery("s1", 1));
        log.record(delivery("s2", 2));
        log.save().unwrap();

        let reloaded = DeliveryLog::persistent(dir.path().to_path_buf(), 10);
        reloaded.load().unwrap();
        assert_eq!(reloaded.subscriber_ids(), vec!["s1", "s2"]);
        assert_eq!(reloaded.recent("s2")[0].id, "d2");
    }

    #[test]
    fn regression_save_skips_ids_that_escape_the_deliveries_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let log = DeliveryLog::persistent(data_dir.clone(), 10);
        log.record(delivery("../escape", 1));
        log.record(delivery("s1", 2));
        log.save().unwrap();

        assert!(!data_dir.join("escape.json").exists());
        assert!(!dir.path().join("escape.json").exists());
        assert!(data_dir.join(DELIVERIES_DIR).join("s1.json").exists());
    }

    #[test]
    fn regression_one_failed_write_does_not_abort_the_save() {
        let dir = tempfile::tempdir().unwrap();
        let deliveries = dir.path().join(DELIVERIES_DIR);
        // A directory where s1.json should go makes that one write fail.
        std::fs::create_dir_all(deliveries.join("s1.json")).unwrap();

        let log = DeliveryLog::persistent(dir.path().to_path_buf(), 10);
        log.record(delivery("s1", 1));
        log.record(delivery("s2", 2));
        log.save().unwrap();

        assert!(deliveries.join("s1.json").is_dir());
        assert!(deliveries.join("s2.json").is_file());
    }

    #[test]
    fn unit_safe_file_stems() {
        assert!(is_safe_file_stem("crm-01"));
        assert!(!is_safe_file_stem(""));
        assert!(!is_safe_file_stem(".."));
        assert!(!is_safe_file_stem("a/b"));
        assert!(!is_safe_file_stem("a\\b"));
    }
}
