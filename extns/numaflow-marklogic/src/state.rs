//! Cluster-scoped storage of the query watermark.
//!
//! The source persists a single value, the highest watermark seen by the last successful run,
//! under [STATE_KEY]. Writes replace the previous value.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Result;

/// JetStream KV backed state.
pub mod jetstream;

/// Key of the persisted watermark.
pub const STATE_KEY: &str = "queryState";

#[trait_variant::make(StateStore: Send)]
pub trait LocalStateStore {
    /// Get the value of `key`, `None` if it was never written or was deleted.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace the value of `key`.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`, deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process local state, for tests and single-replica deployments. Clones share the same values.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryStateStore, STATE_KEY, StateStore};

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.get(STATE_KEY).await.unwrap(), None);

        store.put(STATE_KEY, "2000-01-01T00:00:00").await.unwrap();
        let shared = store.clone();
        assert_eq!(
            shared.get(STATE_KEY).await.unwrap().as_deref(),
            Some("2000-01-01T00:00:00")
        );

        store.put(STATE_KEY, "1999-01-01T00:00:00").await.unwrap();
        assert_eq!(
            shared.get(STATE_KEY).await.unwrap().as_deref(),
            Some("1999-01-01T00:00:00")
        );

        shared.delete(STATE_KEY).await.unwrap();
        shared.delete(STATE_KEY).await.unwrap();
        assert_eq!(store.get(STATE_KEY).await.unwrap(), None);
    }
}
