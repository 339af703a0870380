//! Fakes of the MarkLogic REST API ([MockMarkLogic]) and of the batch facility
//! ([InMemoryBatcher]). Both evaluate queries with [matches], which understands just enough of
//! the query languages for tests: words from string queries and `value-query`/`word-query`/
//! `cts:text`, collections from `collection-query`, and a `GT` range query. A range query only
//! matches documents holding the index it names: the `dateTime` property of JSON documents, or
//! the [TEST_NAMESPACE] `dateTime` element below `root` of XML documents.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batcher::{BatchListener, JobConfig, JobReport, QueryBatch, QueryBatcher};
use crate::client::{EFFECTIVE_TIMESTAMP_HEADER, SearchQuery};
use crate::config::ClientConfig;
use crate::document::{DocumentFormat, DocumentMetadata, DocumentRecord, ReadCategories};
use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Namespace of the `dateTime` element in [MockDocument::xml] documents.
pub const TEST_NAMESPACE: &str = "namespace-test";

#[derive(Debug, Clone, PartialEq)]
pub struct MockDocument {
    pub uri: String,
    pub content: String,
    pub content_type: &'static str,
    pub collections: Vec<String>,
    pub metadata_values: HashMap<String, String>,
    /// Value of the document's `dateTime` field, compared by range queries.
    pub date_time: Option<String>,
}

impl MockDocument {
    /// `{"sample": word, "dateTime": date_time}`
    pub fn json(uri: impl Into<String>, word: &str, date_time: Option<&str>) -> Self {
        let content = match date_time {
            Some(dt) => json!({"sample": word, "dateTime": dt}),
            None => json!({"sample": word}),
        };
        Self {
            uri: uri.into(),
            content: content.to_string(),
            content_type: "application/json",
            collections: vec![],
            metadata_values: HashMap::new(),
            date_time: date_time.map(str::to_string),
        }
    }

    /// `<root><sample>word</sample><nst:dateTime>date_time</nst:dateTime></root>` with `nst`
    /// bound to [TEST_NAMESPACE].
    pub fn xml(uri: impl Into<String>, word: &str, date_time: Option<&str>) -> Self {
        let date_element = date_time
            .map(|dt| format!("<nst:dateTime>{dt}</nst:dateTime>"))
            .unwrap_or_default();
        Self {
            uri: uri.into(),
            content: format!(
                "<root xmlns:nst=\"{TEST_NAMESPACE}\"><sample>{word}</sample>{date_element}</root>"
            ),
            content_type: "application/xml",
            collections: vec![],
            metadata_values: HashMap::new(),
            date_time: date_time.map(str::to_string),
        }
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata_value(mut self, key: &str, value: &str) -> Self {
        self.metadata_values
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn metadata(&self) -> DocumentMetadata {
        DocumentMetadata {
            collections: self.collections.clone(),
            quality: 0,
            metadata_values: self.metadata_values.clone(),
        }
    }

    pub fn record(&self, categories: ReadCategories) -> DocumentRecord {
        DocumentRecord {
            uri: self.uri.clone(),
            content: categories
                .content
                .then(|| Bytes::from(self.content.clone())),
            format: categories
                .content
                .then(|| DocumentFormat::from_content_type(self.content_type)),
            metadata: categories.metadata.then(|| self.metadata()),
        }
    }
}

/// Index named by a range query.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RangeIndex {
    JsonProperty(String),
    Element {
        namespace: String,
        name: String,
    },
    Path {
        expression: String,
        namespaces: HashMap<String, String>,
    },
}

impl RangeIndex {
    /// Whether `document` holds its `dateTime` value in this index.
    fn holds(&self, document: &MockDocument) -> bool {
        let is_json = document.content_type == "application/json";
        match self {
            RangeIndex::JsonProperty(name) => is_json && name == "dateTime",
            RangeIndex::Element { namespace, name } => {
                !is_json && namespace == TEST_NAMESPACE && name == "dateTime"
            }
            RangeIndex::Path {
                expression,
                namespaces,
            } => {
                let Some(steps) = resolve_path(expression, namespaces) else {
                    return false;
                };
                let steps: Vec<(Option<&str>, &str)> = steps
                    .iter()
                    .map(|(ns, name)| (ns.as_deref(), name.as_str()))
                    .collect();
                if is_json {
                    steps == [(None, "dateTime")]
                } else {
                    steps == [(None, "root"), (Some(TEST_NAMESPACE), "dateTime")]
                }
            }
        }
    }
}

/// `/a/p:b` as (namespace, local name) steps, `None` when a prefix is not bound.
fn resolve_path(
    expression: &str,
    namespaces: &HashMap<String, String>,
) -> Option<Vec<(Option<String>, String)>> {
    expression
        .strip_prefix('/')?
        .split('/')
        .map(|step| match step.split_once(':') {
            Some((prefix, name)) => namespaces
                .get(prefix)
                .map(|ns| (Some(ns.clone()), name.to_string())),
            None => Some((None, step.to_string())),
        })
        .collect()
}

/// Numeric when both sides parse as numbers, string order otherwise.
fn greater_than(value: &str, after: &str) -> bool {
    match (value.parse::<f64>(), after.parse::<f64>()) {
        (Ok(value), Ok(after)) => value > after,
        _ => value > after,
    }
}

#[derive(Debug, Default)]
struct Criteria {
    words: Vec<String>,
    collections: Vec<String>,
    range: Option<(RangeIndex, String)>,
    /// A range query was sent but its index could not be read.
    unreadable_range: bool,
}

impl Criteria {
    fn matches(&self, document: &MockDocument) -> bool {
        if self.unreadable_range {
            return false;
        }
        self.words.iter().all(|w| document.content.contains(w.as_str()))
            && (self.collections.is_empty()
                || self
                    .collections
                    .iter()
                    .any(|c| document.collections.contains(c)))
            && self.range.as_ref().is_none_or(|(index, after)| {
                index.holds(document)
                    && document
                        .date_time
                        .as_deref()
                        .is_some_and(|dt| greater_than(dt, after))
            })
    }

    fn set_range(&mut self, range: Option<(RangeIndex, String)>) {
        match range {
            Some(range) => self.range = Some(range),
            None => self.unreadable_range = true,
        }
    }

    fn from_json(value: &Value) -> Self {
        let mut criteria = Criteria::default();
        criteria.collect_json(value);
        criteria
    }

    fn collect_json(&mut self, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, inner) in map {
                    match key.as_str() {
                        "qtext" => self.words.extend(strings(Some(inner))),
                        "collection-query" => self.collections.extend(strings(inner.get("uri"))),
                        "value-query" | "word-query" => {
                            self.words.extend(strings(inner.get("text")))
                        }
                        "jsonPropertyValueQuery" => {
                            self.words.extend(strings(inner.get("value")))
                        }
                        "range-query" => self.set_range(json_range(inner)),
                        _ => {}
                    }
                    self.collect_json(inner);
                }
            }
            Value::Array(items) => items.iter().for_each(|item| self.collect_json(item)),
            _ => {}
        }
    }

    fn from_xml(body: &str) -> Self {
        let mut criteria = Criteria::default();
        criteria.words.extend(element_texts(body, "text"));
        criteria.words.extend(element_texts(body, "cts:text"));
        criteria.collections.extend(element_texts(body, "uri"));

        let range_tags = [
            "range-query",
            "cts:json-property-range-query",
            "cts:element-range-query",
            "cts:path-range-query",
        ];
        for tag in range_tags {
            if let Some(fragment) = fragment(body, tag) {
                criteria.set_range(xml_range(tag, fragment));
            }
        }
        criteria
    }
}

fn json_range(range: &Value) -> Option<(RangeIndex, String)> {
    let value = strings(range.get("value")).into_iter().next()?;
    let index = if let Some(property) = range.get("json-property") {
        RangeIndex::JsonProperty(strings(Some(property)).into_iter().next()?)
    } else if let Some(element) = range.get("element") {
        RangeIndex::Element {
            namespace: element.get("ns")?.as_str()?.to_string(),
            name: element.get("name")?.as_str()?.to_string(),
        }
    } else {
        let path = range.get("path-index")?;
        let namespaces = path
            .get("namespaces")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(prefix, uri)| Some((prefix.clone(), uri.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        RangeIndex::Path {
            expression: path.get("text")?.as_str()?.to_string(),
            namespaces,
        }
    };
    Some((index, value))
}

fn xml_range(tag: &str, fragment: &str) -> Option<(RangeIndex, String)> {
    let value_tag = if tag == "range-query" { "value" } else { "cts:value" };
    let value = element_texts(fragment, value_tag).into_iter().next()?;
    let index = match tag {
        "cts:json-property-range-query" => {
            RangeIndex::JsonProperty(element_texts(fragment, "cts:property").into_iter().next()?)
        }
        "cts:element-range-query" => {
            let declarations = namespace_declarations(start_tag(fragment, "cts:element")?);
            let qname = element_texts(fragment, "cts:element").into_iter().next()?;
            match qname.split_once(':') {
                Some((prefix, name)) => RangeIndex::Element {
                    namespace: declarations.get(prefix)?.clone(),
                    name: name.to_string(),
                },
                None => RangeIndex::Element {
                    namespace: String::new(),
                    name: qname,
                },
            }
        }
        "cts:path-range-query" => RangeIndex::Path {
            namespaces: namespace_declarations(start_tag(fragment, "cts:path-expression")?),
            expression: element_texts(fragment, "cts:path-expression")
                .into_iter()
                .next()?,
        },
        _ => {
            if let Some(property) = element_texts(fragment, "json-property").into_iter().next() {
                RangeIndex::JsonProperty(property)
            } else if let Some(element) = start_tag(fragment, "element") {
                RangeIndex::Element {
                    namespace: attribute(element, "ns").unwrap_or_default(),
                    name: attribute(element, "name")?,
                }
            } else {
                RangeIndex::Path {
                    namespaces: namespace_declarations(start_tag(fragment, "path-index")?),
                    expression: element_texts(fragment, "path-index").into_iter().next()?,
                }
            }
        }
    };
    Some((index, value))
}

/// Everything from `<name` up to the matching `</name>`.
fn fragment<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let start = find_tag(body, name)?;
    let close = format!("</{name}>");
    let end = body[start..].find(&close)? + start + close.len();
    Some(&body[start..end])
}

/// Position of the first `<name` that is a whole tag name.
fn find_tag(body: &str, name: &str) -> Option<usize> {
    let open = format!("<{name}");
    let mut offset = 0;
    while let Some(pos) = body[offset..].find(&open) {
        let start = offset + pos;
        let after = &body[start + open.len()..];
        if after.starts_with(|c: char| c == '>' || c == '/' || c.is_whitespace()) {
            return Some(start);
        }
        offset = start + open.len();
    }
    None
}

/// The attributes part of the first `<name ...>` start tag.
fn start_tag<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let start = find_tag(body, name)? + name.len() + 1;
    let end = body[start..].find('>')? + start;
    Some(body[start..end].trim_end_matches('/'))
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let key = format!(" {name}=\"");
    let start = tag.find(&key)? + key.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

fn namespace_declarations(tag: &str) -> HashMap<String, String> {
    let mut declarations = HashMap::new();
    let mut rest = tag;
    while let Some(pos) = rest.find(" xmlns:") {
        rest = &rest[pos + " xmlns:".len()..];
        let Some((prefix, tail)) = rest.split_once("=\"") else {
            break;
        };
        let Some(end) = tail.find('"') else {
            break;
        };
        declarations.insert(prefix.to_string(), tail[..end].to_string());
        rest = &tail[end..];
    }
    declarations
}

/// Whether the fake database considers `document` a match for `query`.
pub fn matches(document: &MockDocument, query: &SearchQuery) -> bool {
    match query {
        SearchQuery::Text(text) => document.content.contains(text.as_str()),
        SearchQuery::Collections(collections) => collections
            .iter()
            .any(|c| document.collections.contains(c)),
        SearchQuery::Json(body) => serde_json::from_str::<Value>(body)
            .map(|v| Criteria::from_json(&v).matches(document))
            .unwrap_or(false),
        SearchQuery::Xml(body) => Criteria::from_xml(body).matches(document),
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub params: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn param(&self, name: &str) -> Option<String> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn params(&self, name: &str) -> Vec<String> {
        self.params
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

struct MockState {
    documents: Mutex<Vec<MockDocument>>,
    searches: Mutex<Vec<RecordedRequest>>,
    document_reads: Mutex<Vec<RecordedRequest>>,
    failures: Mutex<VecDeque<u16>>,
    authorization: Mutex<Option<String>>,
    total_underestimate: Mutex<usize>,
    timestamp: String,
}

impl MockState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        match self.authorization.lock().as_deref() {
            None => true,
            Some(expected) => headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected),
        }
    }
}

/// An in-process HTTP server answering `/v1/search` and `/v1/documents` like MarkLogic does.
pub struct MockMarkLogic {
    addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockMarkLogic {
    pub async fn start(documents: Vec<MockDocument>) -> Self {
        let state = Arc::new(MockState {
            documents: Mutex::new(documents),
            searches: Mutex::new(vec![]),
            document_reads: Mutex::new(vec![]),
            failures: Mutex::new(VecDeque::new()),
            authorization: Mutex::new(None),
            total_underestimate: Mutex::new(0),
            timestamp: "17000000000000000".to_string(),
        });

        let router = Router::new()
            .route("/v1/search", get(search_handler).post(search_handler))
            .route("/v1/documents", get(documents_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock server failed");
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Requires basic authentication with the given credentials.
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        let token = BASE64_STANDARD.encode(format!("{username}:{password}"));
        *self.state.authorization.lock() = Some(format!("Basic {token}"));
        self
    }

    /// Reports a `total` this much lower than the real number of matches, as the estimate of a
    /// busy server may be.
    pub fn with_total_underestimate(self, by: usize) -> Self {
        *self.state.total_underestimate.lock() = by;
        self
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            request_timeout_ms: 5_000,
            retry: RetryConfig {
                max_retries: 3,
                base_interval_ms: 1,
                max_interval_ms: 2,
                factor: 2.0,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.state.timestamp
    }

    /// The next searches answer with these statuses, in order.
    pub fn fail_next_searches(&self, statuses: impl IntoIterator<Item = u16>) {
        self.state.failures.lock().extend(statuses);
    }

    pub fn search_requests(&self) -> Vec<RecordedRequest> {
        self.state.searches.lock().clone()
    }

    pub fn document_requests(&self) -> Vec<RecordedRequest> {
        self.state.document_reads.lock().clone()
    }
}

impl Drop for MockMarkLogic {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn error_response(status: u16) -> Response {
    let (code, message) = match status {
        400 => ("SEARCH-BADQUERY", "Invalid query"),
        401 | 403 => ("SEC-AUTHFAILED", "Unauthorized"),
        404 => ("RESTAPI-NODOCUMENT", "Resource or document does not exist"),
        _ => ("XDMP-UNAVAILABLE", "Service unavailable"),
    };
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "errorResponse": {
            "statusCode": status.as_u16(),
            "status": status.canonical_reason().unwrap_or_default(),
            "messageCode": code,
            "message": message,
        }
    });
    (status, axum::Json(body)).into_response()
}

async fn search_handler(
    State(state): State<Arc<MockState>>,
    method: Method,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    body: String,
) -> Response {
    if !state.authorized(&headers) {
        return error_response(401);
    }

    let request = RecordedRequest {
        method: method.to_string(),
        params,
        body,
    };
    state.searches.lock().push(request.clone());
    if let Some(status) = state.failures.lock().pop_front() {
        return error_response(status);
    }

    let query = if method == Method::POST {
        let is_xml = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("xml"));
        if is_xml {
            SearchQuery::Xml(request.body.clone())
        } else {
            SearchQuery::Json(request.body.clone())
        }
    } else if let Some(text) = request.param("q") {
        SearchQuery::Text(text)
    } else {
        SearchQuery::Collections(request.params("collection"))
    };

    let matching: Vec<String> = state
        .documents
        .lock()
        .iter()
        .filter(|d| matches(d, &query))
        .map(|d| d.uri.clone())
        .collect();

    let start: usize = request
        .param("start")
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
        .max(1);
    let page_length: usize = request
        .param("pageLength")
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let results: Vec<Value> = matching
        .iter()
        .skip(start - 1)
        .take(page_length)
        .enumerate()
        .map(|(i, uri)| json!({"index": start + i, "uri": uri}))
        .collect();

    (
        [(EFFECTIVE_TIMESTAMP_HEADER, state.timestamp.clone())],
        axum::Json(json!({
            "total": matching.len().saturating_sub(*state.total_underestimate.lock()),
            "start": start,
            "page-length": page_length,
            "results": results,
        })),
    )
        .into_response()
}

async fn documents_handler(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if !state.authorized(&headers) {
        return error_response(401);
    }

    let request = RecordedRequest {
        method: Method::GET.to_string(),
        params,
        body: String::new(),
    };
    state.document_reads.lock().push(request.clone());

    let uri = request.param("uri").unwrap_or_default();
    let Some(document) = state
        .documents
        .lock()
        .iter()
        .find(|d| d.uri == uri)
        .cloned()
    else {
        return error_response(404);
    };

    if request.param("category").as_deref() == Some("metadata") {
        let metadata = document.metadata();
        return axum::Json(json!({
            "collections": metadata.collections,
            "permissions": [],
            "properties": {},
            "quality": metadata.quality,
            "metadataValues": metadata.metadata_values,
        }))
        .into_response();
    }

    ([(CONTENT_TYPE, document.content_type)], document.content).into_response()
}

/// How an [InMemoryBatcher] job should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFailure {
    /// The query is rejected before any batch is delivered.
    Reject,
    /// Authentication fails before any batch is delivered.
    Unauthorized,
    /// The transport fails once this many batches were delivered.
    TransportAfter(u64),
}

/// A [QueryBatcher] over a list of [MockDocument]s. Batches are delivered sequentially, the
/// job settings are recorded for inspection.
#[derive(Default)]
pub struct InMemoryBatcher {
    documents: Mutex<Vec<MockDocument>>,
    jobs: Mutex<Vec<JobConfig>>,
    queries: Mutex<Vec<SearchQuery>>,
    failure: Mutex<Option<BatchFailure>>,
}

impl InMemoryBatcher {
    pub fn new(documents: Vec<MockDocument>) -> Self {
        Self {
            documents: Mutex::new(documents),
            ..Default::default()
        }
    }

    pub fn fail_with(&self, failure: Option<BatchFailure>) {
        *self.failure.lock() = failure;
    }

    pub fn jobs(&self) -> Vec<JobConfig> {
        self.jobs.lock().clone()
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().clone()
    }
}

impl QueryBatcher for InMemoryBatcher {
    async fn run<L>(
        &self,
        query: &SearchQuery,
        job: &JobConfig,
        listener: &L,
        cancel: &CancellationToken,
    ) -> Result<JobReport>
    where
        L: BatchListener + Sync,
    {
        job.validate()?;
        self.jobs.lock().push(job.clone());
        self.queries.lock().push(query.clone());

        let failure = *self.failure.lock();
        match failure {
            Some(BatchFailure::Reject) => {
                return Err(Error::Rejected {
                    status: 400,
                    message: "SEARCH-BADQUERY: Invalid query".to_string(),
                });
            }
            Some(BatchFailure::Unauthorized) => {
                return Err(Error::Unauthorized {
                    status: 401,
                    message: "SEC-AUTHFAILED: Unauthorized".to_string(),
                });
            }
            _ => {}
        }

        let matching: Vec<DocumentRecord> = self
            .documents
            .lock()
            .iter()
            .filter(|d| matches(d, query))
            .map(|d| d.record(job.categories))
            .collect();
        let total = matching.len() as u64;

        let mut batches = 0;
        for (batch_number, chunk) in matching.chunks(job.batch_size).enumerate() {
            let batch_number = batch_number as u64;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(BatchFailure::TransportAfter(limit)) = failure
                && batch_number >= limit
            {
                return Err(Error::Transport("connection reset by peer".to_string()));
            }
            listener
                .on_batch(QueryBatch {
                    job_id: "in-memory".to_string(),
                    batch_number,
                    start: batch_number * job.batch_size as u64,
                    documents: chunk.to_vec(),
                    timestamp: None,
                })
                .await?;
            batches += 1;
        }

        Ok(JobReport {
            job_id: "in-memory".to_string(),
            total,
            batches,
            documents: total,
            timestamp: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_texts() {
        let body = r#"<query><value-query><text>a</text></value-query>
            <range-query type="xs:dateTime"><value>2000</value><range-operator>GT</range-operator></range-query>
            <cts:text xml:lang="en">b</cts:text></query>"#;
        assert_eq!(element_texts(body, "text"), vec!["a"]);
        assert_eq!(element_texts(body, "value"), vec!["2000"]);
        assert_eq!(element_texts(body, "cts:text"), vec!["b"]);
    }

    #[test]
    fn test_matches_json_criteria() {
        let doc = MockDocument::json("/1.json", "jsoncontent", Some("2000-01-01T00:00:00"))
            .with_collections(["c1"]);
        let query = SearchQuery::Json(
            json!({"search": {"qtext": "jsoncontent", "query": {"queries": [
                {"collection-query": {"uri": ["c1"]}},
                {"range-query": {"json-property": "dateTime", "value": ["1999-01-01T00:00:00"], "range-operator": "GT"}}
            ]}}})
            .to_string(),
        );
        assert!(matches(&doc, &query));

        let later = SearchQuery::Json(
            json!({"query": {"queries": [
                {"range-query": {"json-property": "dateTime", "value": ["2000-01-01T00:00:00"], "range-operator": "GT"}}
            ]}})
            .to_string(),
        );
        assert!(!matches(&doc, &later));
    }

    #[test]
    fn test_range_matches_only_the_named_index() {
        let json_doc = MockDocument::json("/1.json", "jsoncontent", Some("2000-01-01T00:00:00"));
        let xml_doc = MockDocument::xml("/1.xml", "xmlcontent", Some("2000-01-01T00:00:00"));
        let range = |index: Value| {
            let mut range = json!({"value": ["1999-01-01T00:00:00"], "range-operator": "GT"});
            if let (Some(range), Some(index)) = (range.as_object_mut(), index.as_object()) {
                range.extend(index.clone());
            }
            SearchQuery::Json(json!({"query": {"queries": [{"range-query": range}]}}).to_string())
        };

        let property = range(json!({"json-property": "dateTime"}));
        assert!(matches(&json_doc, &property));
        assert!(!matches(&xml_doc, &property));

        let element = range(json!({"element": {"ns": TEST_NAMESPACE, "name": "dateTime"}}));
        assert!(matches(&xml_doc, &element));
        assert!(!matches(&json_doc, &element));
        let unqualified = range(json!({"element": {"ns": "", "name": "dateTime"}}));
        assert!(!matches(&xml_doc, &unqualified));

        let path = range(json!({"path-index": {"text": "/root/p:dateTime", "namespaces": {"p": TEST_NAMESPACE}}}));
        assert!(matches(&xml_doc, &path));
        let wrong_namespace = range(json!({"path-index": {"text": "/root/p:dateTime", "namespaces": {"p": "urn:other"}}}));
        assert!(!matches(&xml_doc, &wrong_namespace));
        let unbound = range(json!({"path-index": {"text": "/root/p:dateTime"}}));
        assert!(!matches(&xml_doc, &unbound));
    }

    #[test]
    fn test_xml_range_queries() {
        let doc = MockDocument::xml("/1.xml", "xmlcontent", Some("2000-01-01T00:00:00"));

        let cts = format!(
            r#"<cts:and-query xmlns:cts="http://marklogic.com/cts"><cts:element-value-query><cts:element>sample</cts:element><cts:text>xmlcontent</cts:text></cts:element-value-query><cts:element-range-query operator="&gt;"><cts:element xmlns:_ns="{TEST_NAMESPACE}">_ns:dateTime</cts:element><cts:value>1999-01-01T00:00:00</cts:value></cts:element-range-query></cts:and-query>"#
        );
        assert!(matches(&doc, &SearchQuery::Xml(cts.clone())));
        assert!(!matches(
            &doc,
            &SearchQuery::Xml(cts.replace("_ns:dateTime", "dateTime"))
        ));

        let structured = format!(
            r#"<query xmlns="http://marklogic.com/appservices/search"><range-query type="xs:dateTime"><path-index xmlns:nst="{TEST_NAMESPACE}">/root/nst:dateTime</path-index><value>2000-01-01T00:00:00</value><range-operator>GT</range-operator></range-query></query>"#
        );
        // not strictly greater
        assert!(!matches(&doc, &SearchQuery::Xml(structured.clone())));
        assert!(matches(
            &doc,
            &SearchQuery::Xml(structured.replace(">2000-01-01T00:00:00<", ">1999-01-01T00:00:00<"))
        ));

        let json_property = r#"<query xmlns="http://marklogic.com/appservices/search"><range-query type="xs:dateTime"><json-property>dateTime</json-property><value>1999-01-01T00:00:00</value></range-query></query>"#;
        assert!(!matches(&doc, &SearchQuery::Xml(json_property.to_string())));
    }

    #[test]
    fn test_numeric_range() {
        let doc = MockDocument::json("/seq.json", "jsoncontent", Some("10"));
        let after = |value: &str| {
            SearchQuery::Json(
                json!({"query": {"queries": [{"range-query": {"type": "xs:long", "json-property": "dateTime", "value": [value], "range-operator": "GT"}}]}})
                    .to_string(),
            )
        };
        assert!(matches(&doc, &after("9")));
        assert!(!matches(&doc, &after("10")));
    }
}
