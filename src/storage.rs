//! Key-value storage tiers
//!
//! Identity resolution needs two storage tiers: a tab-scoped store cleared
//! when the tab closes and a device-scoped store that survives across
//! sessions. The embedder supplies both (in a browser these map to session
//! and local storage); the engine only sees the `KeyValueStore` capability.
//!
//! Storage access is allowed to fail. Instead of sprinkling try/catch through
//! call sites, each tier carries a volatile in-memory fallback: a failed
//! write lands in the fallback, and reads consult the fallback when the
//! primary has nothing. Identity resolution therefore degrades rather than
//! crashes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::TelemetryError;

/// Minimal string key-value capability the engine requires from storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), TelemetryError>;
    fn remove(&self, key: &str);
}

/// Volatile in-memory store. Always succeeds; used standalone for tests and
/// as the fallback behind every real tier.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TelemetryError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// A storage tier with its in-memory fallback.
struct Tier {
    primary: Arc<dyn KeyValueStore>,
    fallback: MemoryStore,
}

impl Tier {
    fn new(primary: Arc<dyn KeyValueStore>) -> Self {
        Self {
            primary,
            fallback: MemoryStore::new(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.primary.get(key).or_else(|| self.fallback.get(key))
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(err) = self.primary.set(key, value) {
            warn!(error = %err, key, "Storage write failed, using in-memory fallback");
            let _ = self.fallback.set(key, value);
        }
    }

    fn remove(&self, key: &str) {
        self.primary.remove(key);
        self.fallback.remove(key);
    }
}

/// The two storage tiers identity resolution reads and writes.
pub struct StorageTiers {
    tab: Tier,
    device: Tier,
}

impl StorageTiers {
    /// Wrap host-supplied tab- and device-scoped stores.
    pub fn new(tab: Arc<dyn KeyValueStore>, device: Arc<dyn KeyValueStore>) -> Self {
        Self {
            tab: Tier::new(tab),
            device: Tier::new(device),
        }
    }

    /// Purely volatile tiers. Identity will not survive the instance, but
    /// the engine stays functional.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn tab_get(&self, key: &str) -> Option<String> {
        self.tab.get(key)
    }

    pub fn tab_set(&self, key: &str, value: &str) {
        self.tab.set(key, value);
    }

    pub fn device_get(&self, key: &str) -> Option<String> {
        self.device.get(key)
    }

    pub fn device_set(&self, key: &str, value: &str) {
        self.device.set(key, value);
    }

    pub fn device_remove(&self, key: &str) {
        self.device.remove(key);
    }

    pub fn tab_remove(&self, key: &str) {
        self.tab.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A store whose writes always fail, e.g. storage quota exhausted or
    /// privacy mode.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Option<String> {
            None
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), TelemetryError> {
            Err(TelemetryError::Storage("quota exceeded".to_string()))
        }

        fn remove(&self, _key: &str) {}
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get("k").is_none());
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.remove("k");
        assert!(store.get("k").is_none());
    }

    #[test]
    fn failed_write_lands_in_fallback() {
        let tiers = StorageTiers::new(Arc::new(BrokenStore), Arc::new(BrokenStore));
        tiers.device_set("visitor", "abc");
        // The primary rejected the write but the value is still readable.
        assert_eq!(tiers.device_get("visitor").as_deref(), Some("abc"));
    }

    #[test]
    fn tiers_are_independent() {
        let tiers = StorageTiers::in_memory();
        tiers.tab_set("session", "s-1");
        assert!(tiers.device_get("session").is_none());
        assert_eq!(tiers.tab_get("session").as_deref(), Some("s-1"));
    }
}
