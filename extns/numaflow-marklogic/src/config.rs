use std::collections::BTreeMap;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use marklogic_client::{JobConfig, ReadCategories};
use serde::{Deserialize, Serialize};

use crate::watermark::StateIndex;
use crate::{Error, Result};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_THREAD_COUNT: usize = 3;
const DEFAULT_SCALAR_TYPE: &str = "dateTime";

/// How the `query` option is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryType {
    /// MarkLogic string query syntax.
    String,
    /// Combined query in JSON (`{"search": {...}}`).
    CombinedJson,
    /// Combined query in XML, or a serialized `cts:` query.
    CombinedXml,
    /// Structured query in JSON (`{"query": {...}}`).
    StructuredJson,
    /// Structured query in XML (`<query xmlns="http://marklogic.com/appservices/search">`).
    StructuredXml,
    /// Comma separated collection names.
    Collection,
}

/// What every emitted unit carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReturnType {
    #[default]
    Documents,
    Meta,
    DocumentsAndMeta,
}

impl ReturnType {
    pub fn includes_documents(&self) -> bool {
        matches!(self, ReturnType::Documents | ReturnType::DocumentsAndMeta)
    }

    pub fn includes_metadata(&self) -> bool {
        matches!(self, ReturnType::Meta | ReturnType::DocumentsAndMeta)
    }
}

/// Kind of range index backing the state index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateIndexType {
    #[default]
    JsonProperty,
    Element,
    Path,
}

/// Configuration of the query source, usually provided as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    /// Query text, may contain `${name}` placeholders.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_query_type")]
    pub query_type: QueryType,
    /// Comma separated collections, only used when `query` is not set.
    #[serde(default)]
    pub collections: Option<String>,
    #[serde(default)]
    pub return_type: ReturnType,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_true")]
    pub consistent_snapshot: bool,
    /// Range index used to track the watermark, e.g. `dateTime`, `t:dateTime` or
    /// `/root/nst:dateTime`.
    #[serde(default)]
    pub state_index: Option<String>,
    #[serde(default)]
    pub state_index_type: StateIndexType,
    /// Scalar type of the state index, `dateTime` unless set.
    #[serde(default = "default_scalar_type")]
    pub state_index_scalar_type: String,
    /// Namespace prefixes usable in the state index.
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
    /// Restrict every run to documents newer than the last watermark. Enabled whenever a state
    /// index is configured unless set explicitly.
    #[serde(default)]
    pub incremental: Option<bool>,
}

fn default_query_type() -> QueryType {
    QueryType::CombinedJson
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_thread_count() -> usize {
    DEFAULT_THREAD_COUNT
}

fn default_true() -> bool {
    true
}

fn default_scalar_type() -> String {
    DEFAULT_SCALAR_TYPE.to_string()
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            query: None,
            query_type: default_query_type(),
            collections: None,
            return_type: ReturnType::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            thread_count: DEFAULT_THREAD_COUNT,
            consistent_snapshot: true,
            state_index: None,
            state_index_type: StateIndexType::default(),
            state_index_scalar_type: default_scalar_type(),
            namespaces: BTreeMap::new(),
            incremental: None,
        }
    }
}

impl QueryConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Failed to parse query config: {e}")))
    }

    /// Parses base64 encoded JSON, the format used for configuration objects in the environment.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Configuration(format!("Failed to decode query config: {e}")))?;
        serde_json::from_slice(&decoded)
            .map_err(|e| Error::Configuration(format!("Failed to parse query config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "batchSize must be greater than 0".to_string(),
            ));
        }
        if self.thread_count == 0 {
            return Err(Error::Configuration(
                "threadCount must be greater than 0".to_string(),
            ));
        }

        let has_query = self.query.as_deref().is_some_and(|q| !q.trim().is_empty());
        let has_collections = self
            .collections
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if !has_query && !has_collections {
            return Err(Error::Configuration(
                "either query or collections must be set".to_string(),
            ));
        }

        if self.incremental == Some(true) && self.state_index.is_none() {
            return Err(Error::Configuration(
                "incremental queries require a stateIndex".to_string(),
            ));
        }
        if self.state_index_scalar_type.trim().is_empty() {
            return Err(Error::Configuration(
                "stateIndexScalarType must not be empty".to_string(),
            ));
        }

        self.state_index().map(|_| ())
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental.unwrap_or(self.state_index.is_some()) && self.state_index.is_some()
    }

    /// Query type and text after applying the legacy `collections` option.
    pub fn effective_query(&self) -> (QueryType, &str) {
        match (&self.query, &self.collections) {
            (Some(query), _) if !query.trim().is_empty() => (self.query_type, query),
            (_, Some(collections)) => (QueryType::Collection, collections),
            _ => (self.query_type, ""),
        }
    }

    /// The configured state index with its namespace prefixes resolved.
    pub fn state_index(&self) -> Result<Option<StateIndex>> {
        self.state_index
            .as_deref()
            .map(|index| StateIndex::resolve(self.state_index_type, index, &self.namespaces))
            .transpose()
    }

    /// Categories the batcher has to fetch. Document bodies are needed to extract the watermark
    /// even when only metadata is returned.
    pub fn categories(&self) -> ReadCategories {
        ReadCategories {
            content: self.return_type.includes_documents() || self.is_incremental(),
            metadata: self.return_type.includes_metadata(),
        }
    }

    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            batch_size: self.batch_size,
            thread_count: self.thread_count,
            consistent_snapshot: self.consistent_snapshot,
            categories: self.categories(),
        }
    }
}
