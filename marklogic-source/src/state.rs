use std::time::Duration;

use async_nats::jetstream::Context;
use async_nats::{ConnectOptions, jetstream};
use numaflow_marklogic::state::jetstream::JetstreamStateStore;
use numaflow_marklogic::{InMemoryStateStore, StateStore};
use tracing::{info, warn};

use crate::config::JetstreamConfig;
use crate::error::{Error, Result};

/// State backend selected at startup.
#[derive(Clone)]
pub(crate) enum StateBackend {
    Memory(InMemoryStateStore),
    Jetstream(JetstreamStateStore),
}

impl StateBackend {
    pub(crate) async fn new(config: Option<&JetstreamConfig>) -> Result<Self> {
        let Some(config) = config else {
            warn!("JetStream is not configured, the query state will not survive a restart");
            return Ok(StateBackend::Memory(InMemoryStateStore::new()));
        };
        let context = create_js_context(config).await?;
        let store = JetstreamStateStore::connect(&context, &config.bucket).await?;
        info!(bucket = store.bucket(), "Using JetStream KV for the query state");
        Ok(StateBackend::Jetstream(store))
    }
}

impl StateStore for StateBackend {
    async fn get(&self, key: &str) -> numaflow_marklogic::Result<Option<String>> {
        match self {
            StateBackend::Memory(store) => store.get(key).await,
            StateBackend::Jetstream(store) => store.get(key).await,
        }
    }

    async fn put(&self, key: &str, value: &str) -> numaflow_marklogic::Result<()> {
        match self {
            StateBackend::Memory(store) => store.put(key, value).await,
            StateBackend::Jetstream(store) => store.put(key, value).await,
        }
    }

    async fn delete(&self, key: &str) -> numaflow_marklogic::Result<()> {
        match self {
            StateBackend::Memory(store) => store.delete(key).await,
            StateBackend::Jetstream(store) => store.delete(key).await,
        }
    }
}

async fn create_js_context(config: &JetstreamConfig) -> Result<Context> {
    let mut opts = ConnectOptions::new()
        .max_reconnects(None)
        .ping_interval(Duration::from_secs(3))
        .retry_on_initial_connect();

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        opts = opts.user_and_password(user.clone(), password.clone());
    }

    let client = async_nats::connect_with_options(&config.url, opts)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;

    Ok(jetstream::new(client))
}
