use async_nats::jetstream::Context;
use async_nats::jetstream::kv::{Config, Store};
use bytes::Bytes;
use tracing::info;

use super::StateStore;
use crate::{Error, Result};

/// [StateStore] over a JetStream KV bucket, shared by every replica connected to the same
/// JetStream cluster.
#[derive(Clone)]
pub struct JetstreamStateStore {
    store: Store,
    bucket: String,
}

impl JetstreamStateStore {
    pub fn new(store: Store, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Opens `bucket`, creating it when it does not exist yet.
    pub async fn connect(context: &Context, bucket: &str) -> Result<Self> {
        let store = match context.get_key_value(bucket).await {
            Ok(store) => store,
            Err(e) => {
                info!(bucket, ?e, "State bucket not found, creating it");
                context
                    .create_key_value(Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        Error::State(format!("Failed to create kv bucket {bucket}: {e}"))
                    })?
            }
        };
        Ok(Self::new(store, bucket))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl StateStore for JetstreamStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.store.get(key).await.map_err(|e| {
            Error::State(format!("Failed to get {key} from {}: {e}", self.bucket))
        })?;
        value
            .map(|bytes| {
                String::from_utf8(bytes.to_vec()).map_err(|e| {
                    Error::State(format!("Value of {key} in {} is not UTF-8: {e}", self.bucket))
                })
            })
            .transpose()
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.store
            .put(key, Bytes::from(value.to_string()))
            .await
            .map_err(|e| Error::State(format!("Failed to put {key} to {}: {e}", self.bucket)))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await.map_err(|e| {
            Error::State(format!("Failed to delete {key} from {}: {e}", self.bucket))
        })
    }
}
