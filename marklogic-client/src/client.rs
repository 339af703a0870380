use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::{BasicAuth, ClientConfig};
use crate::document::{DocumentFormat, DocumentMetadata, DocumentRecord, ReadCategories};
use crate::{Error, Result};

/// Header carrying the point-in-time of a search, used for consistent snapshots.
pub const EFFECTIVE_TIMESTAMP_HEADER: &str = "ML-Effective-Timestamp";

/// A query in one of the forms accepted by `/v1/search`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    /// String query, sent as the `q` parameter.
    Text(String),
    /// Documents in any of the collections, sent as `collection` parameters.
    Collections(Vec<String>),
    /// Structured, combined or serialized cts query in JSON, sent as the request body.
    Json(String),
    /// Structured, combined or serialized cts query in XML, sent as the request body.
    Xml(String),
}

/// One page of URIs matching a query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub total: u64,
    pub uris: Vec<String>,
    pub timestamp: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    uri: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error_response: ErrorDetail,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    #[serde(default)]
    message_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Thin wrapper over the MarkLogic REST API.
#[derive(Clone)]
pub struct DatabaseClient {
    http: reqwest::Client,
    base_url: String,
    database: Option<String>,
    auth: Option<BasicAuth>,
}

impl DatabaseClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to build http client: {e}")))?;

        debug!(base_url = config.base_url(), database = ?config.database, "Created MarkLogic client");

        Ok(Self {
            http,
            base_url: config.base_url(),
            database: config.database.clone(),
            auth: config.auth.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(auth) = &self.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(database) = &self.database {
            builder = builder.query(&[("database", database)]);
        }
        builder
    }

    /// Fetches the URIs of the matching documents in `[start, start + page_length)`. `start` is
    /// one-based.
    pub async fn search(
        &self,
        query: &SearchQuery,
        start: u64,
        page_length: usize,
        timestamp: Option<&str>,
    ) -> Result<SearchPage> {
        let mut params: Vec<(&str, String)> = vec![
            ("format", "json".to_string()),
            ("start", start.to_string()),
            ("pageLength", page_length.to_string()),
        ];
        if let Some(timestamp) = timestamp {
            params.push(("timestamp", timestamp.to_string()));
        }

        let builder = match query {
            SearchQuery::Text(text) => {
                params.push(("q", text.clone()));
                self.request(Method::GET, "/v1/search")
            }
            SearchQuery::Collections(collections) => {
                params.extend(collections.iter().map(|c| ("collection", c.clone())));
                self.request(Method::GET, "/v1/search")
            }
            SearchQuery::Json(body) => self
                .request(Method::POST, "/v1/search")
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone()),
            SearchQuery::Xml(body) => self
                .request(Method::POST, "/v1/search")
                .header(CONTENT_TYPE, "application/xml")
                .body(body.clone()),
        };

        let response = check_status(builder.query(&params).send().await?).await?;
        let timestamp = response
            .headers()
            .get(EFFECTIVE_TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body: SearchResponse = response.json().await?;
        trace!(start, total = body.total, count = body.results.len(), "Search page");

        Ok(SearchPage {
            total: body.total,
            uris: body.results.into_iter().map(|r| r.uri).collect(),
            timestamp,
        })
    }

    /// Reads the requested categories of a document. Returns `None` if the document no longer
    /// exists.
    pub async fn read_document(
        &self,
        uri: &str,
        categories: ReadCategories,
        timestamp: Option<&str>,
    ) -> Result<Option<DocumentRecord>> {
        let mut record = DocumentRecord::uri_only(uri);

        if categories.content {
            let Some((content, format)) = self.read_content(uri, timestamp).await? else {
                return Ok(None);
            };
            record.content = Some(content);
            record.format = Some(format);
        }

        if categories.metadata {
            let Some(metadata) = self.read_metadata(uri, timestamp).await? else {
                return Ok(None);
            };
            record.metadata = Some(metadata);
        }

        Ok(Some(record))
    }

    async fn read_content(
        &self,
        uri: &str,
        timestamp: Option<&str>,
    ) -> Result<Option<(Bytes, DocumentFormat)>> {
        let mut builder = self
            .request(Method::GET, "/v1/documents")
            .query(&[("uri", uri)]);
        if let Some(timestamp) = timestamp {
            builder = builder.query(&[("timestamp", timestamp)]);
        }

        let response = builder.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content = response.bytes().await?;
        let format = match content_type {
            Some(ct) => DocumentFormat::from_content_type(&ct),
            None => DocumentFormat::sniff(&content),
        };
        Ok(Some((content, format)))
    }

    async fn read_metadata(
        &self,
        uri: &str,
        timestamp: Option<&str>,
    ) -> Result<Option<DocumentMetadata>> {
        let mut builder = self.request(Method::GET, "/v1/documents").query(&[
            ("uri", uri),
            ("category", "metadata"),
            ("format", "json"),
        ]);
        if let Some(timestamp) = timestamp {
            builder = builder.query(&[("timestamp", timestamp)]);
        }

        let response = builder.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let metadata = check_status(response).await?.json().await?;
        Ok(Some(metadata))
    }
}

/// Maps non-success responses to errors. 5xx are transient, 401/403 are authentication
/// failures, any other 4xx means the request itself was rejected.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);
    let status = status.as_u16();
    Err(match status {
        401 | 403 => Error::Unauthorized { status, message },
        500..=599 => Error::Server { status, message },
        _ => Error::Rejected { status, message },
    })
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            error_response: detail,
        }) => match (detail.message_code, detail.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code,
            (None, Some(message)) => message,
            (None, None) => body.to_string(),
        },
        Err(_) => body.trim().to_string(),
    }
}
