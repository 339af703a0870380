use std::collections::HashMap;

use marklogic_client::{BasicAuth, ClientConfig, RetryConfig, Scheme};
use numaflow_marklogic::QueryConfig;

use crate::error::{Error, Result};

const ENV_QUERY_OBJECT: &str = "MARKLOGIC_QUERY_OBJECT";

const ENV_HOST: &str = "MARKLOGIC_HOST";
const ENV_PORT: &str = "MARKLOGIC_PORT";
const ENV_SCHEME: &str = "MARKLOGIC_SCHEME";
const ENV_DATABASE: &str = "MARKLOGIC_DATABASE";
const ENV_USERNAME: &str = "MARKLOGIC_USERNAME";
const ENV_PASSWORD: &str = "MARKLOGIC_PASSWORD";
const ENV_REQUEST_TIMEOUT_MS: &str = "MARKLOGIC_REQUEST_TIMEOUT_MS";
const ENV_MAX_RETRIES: &str = "MARKLOGIC_MAX_RETRIES";

const ENV_JETSTREAM_URL: &str = "NUMAFLOW_ISBSVC_JETSTREAM_URL";
const ENV_JETSTREAM_USER: &str = "NUMAFLOW_ISBSVC_JETSTREAM_USER";
const ENV_JETSTREAM_PASSWORD: &str = "NUMAFLOW_ISBSVC_JETSTREAM_PASSWORD";
const ENV_STATE_BUCKET: &str = "MARKLOGIC_STATE_BUCKET";
const DEFAULT_STATE_BUCKET: &str = "marklogic-query-state";

const ENV_SCHEDULE: &str = "MARKLOGIC_SCHEDULE";
const ENV_TIMEZONE: &str = "MARKLOGIC_TIMEZONE";
/// Every minute, at second zero.
const DEFAULT_SCHEDULE: &str = "0 * * * * *";

/// JetStream KV holding the query state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JetstreamConfig {
    pub(crate) url: String,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) bucket: String,
}

/// When the query runs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TriggerConfig {
    pub(crate) schedule: String,
    pub(crate) timezone: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) query: QueryConfig,
    pub(crate) client: ClientConfig,
    /// In-memory state is used when JetStream is not configured.
    pub(crate) jetstream: Option<JetstreamConfig>,
    pub(crate) trigger: TriggerConfig,
}

fn parse_var<T>(env_vars: &HashMap<String, String>, var: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_vars
        .get(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("Invalid value for {var}: {e}")))
        })
        .transpose()
}

impl Settings {
    pub(crate) fn load(env_vars: &HashMap<String, String>) -> Result<Self> {
        let get_var = |var: &str| -> Result<String> {
            Ok(env_vars
                .get(var)
                .ok_or_else(|| Error::Config(format!("Environment variable {var} is not set")))?
                .to_string())
        };

        let query = QueryConfig::from_encoded(&get_var(ENV_QUERY_OBJECT)?)?;
        query.validate()?;

        let scheme = match env_vars.get(ENV_SCHEME).map(|s| s.to_ascii_lowercase()) {
            None => Scheme::Http,
            Some(s) if s == "http" => Scheme::Http,
            Some(s) if s == "https" => Scheme::Https,
            Some(s) => {
                return Err(Error::Config(format!(
                    "Invalid value for {ENV_SCHEME}: {s}, expected http or https"
                )));
            }
        };
        let auth = match (get_var(ENV_USERNAME).ok(), get_var(ENV_PASSWORD).ok()) {
            (Some(username), password) => Some(BasicAuth {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, _) => None,
        };

        let defaults = ClientConfig::default();
        let mut retry = RetryConfig::default();
        if let Some(max_retries) = parse_var(env_vars, ENV_MAX_RETRIES)? {
            retry.max_retries = max_retries;
        }
        let client = ClientConfig {
            host: get_var(ENV_HOST)?,
            port: parse_var(env_vars, ENV_PORT)?.unwrap_or(defaults.port),
            scheme,
            database: get_var(ENV_DATABASE).ok(),
            auth,
            request_timeout_ms: parse_var(env_vars, ENV_REQUEST_TIMEOUT_MS)?
                .unwrap_or(defaults.request_timeout_ms),
            retry,
        };
        client.validate()?;

        let jetstream = get_var(ENV_JETSTREAM_URL).ok().map(|url| JetstreamConfig {
            url,
            user: get_var(ENV_JETSTREAM_USER).ok(),
            password: get_var(ENV_JETSTREAM_PASSWORD).ok(),
            bucket: get_var(ENV_STATE_BUCKET).unwrap_or_else(|_| DEFAULT_STATE_BUCKET.to_string()),
        });

        let trigger = TriggerConfig {
            schedule: get_var(ENV_SCHEDULE).unwrap_or_else(|_| DEFAULT_SCHEDULE.to_string()),
            timezone: get_var(ENV_TIMEZONE).ok(),
        };

        Ok(Self {
            query,
            client,
            jetstream,
            trigger,
        })
    }
}
