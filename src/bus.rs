use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// One key/value update on the telemetry bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub key: String,
    pub value: Value,
}

/// In-process publish/subscribe surface for UI and automation consumers.
///
/// A key is re-published only when its value changes, and publications are
/// ordered per key: a subscriber always observes a monotone value sequence
/// for any single key.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    last: Mutex<HashMap<String, Value>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `value` under `key` if it differs from the last published
    /// value. Returns whether an event went out.
    pub fn publish(&self, key: &str, value: impl Serialize) -> bool {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return false,
        };

        {
            let mut last = self.last.lock().expect("bus cache poisoned");
            if last.get(key) == Some(&value) {
                return false;
            }
            last.insert(key.to_string(), value.clone());
        }

        trace!(key, %value, "publish");
        // Send failures just mean nobody is subscribed.
        let _ = self.tx.send(Event {
            key: key.to_string(),
            value,
        });
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Last published value per key, for late subscribers.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.last.lock().expect("bus cache poisoned").clone()
    }

    pub fn last_value(&self, key: &str) -> Option<Value> {
        self.last.lock().expect("bus cache poisoned").get(key).cloned()
    }
}
