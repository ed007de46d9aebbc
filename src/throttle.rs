use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{EventKind, WebhookSubscriber};

pub const DEFAULT_MAX_ENTRIES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub subscriber_id: String,
    pub kind: EventKind,
    pub entity_id: String,
}

#[derive(Debug, Clone, Copy)]
struct Fired {
    at: Instant,
    window: Duration,
}

/// Per (subscriber, event kind, entity) rate limiter.
pub struct ThrottleGate {
    fired: Mutex<HashMap<ThrottleKey, Fired>>,
    max_entries: usize,
}

impl ThrottleGate {
    pub fn new(max_entries: usize) -> Self {
        Self {
            fired: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn should_suppress(
        &self,
        subscriber: &WebhookSubscriber,
        kind: EventKind,
        entity_id: &str,
    ) -> bool {
        self.should_suppress_at(subscriber, kind, entity_id, Instant::now())
    }

    /// A suppressed call leaves the recorded timestamp untouched; a passing
    /// call records `now` as the new firing time.
    pub fn should_suppress_at(
        &self,
        subscriber: &WebhookSubscriber,
        kind: EventKind,
        entity_id: &str,
        now: Instant,
    ) -> bool {
        if kind.is_throttle_exempt() || !subscriber.throttle.enabled {
            return false;
        }

        let window = Duration::from_secs(subscriber.throttle.interval_seconds);
        let key = ThrottleKey {
            subscriber_id: subscriber.id.clone(),
            kind,
            entity_id: entity_id.to_string(),
        };

        let mut fired = self.fired.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = fired.get(&key) {
            if now.saturating_duration_since(last.at) < window {
                return true;
            }
        } else if fired.len() >= self.max_entries {
            // Entries past their own window cannot suppress anything any more.
            fired.retain(|_, f| now.saturating_duration_since(f.at) < f.window);
        }

        fired.insert(key, Fired { at: now, window });
        false
    }

    pub fn len(&self) -> usize {
        self.fired.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.fired.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
