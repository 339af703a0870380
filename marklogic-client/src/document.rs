use std::collections::HashMap;

use bytes::Bytes;
use serde::Deserialize;

/// Which parts of a document the batcher should fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCategories {
    pub content: bool,
    pub metadata: bool,
}

impl ReadCategories {
    pub fn uris_only() -> Self {
        Self {
            content: false,
            metadata: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Xml,
    Text,
    Binary,
}

impl DocumentFormat {
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime.ends_with("json") {
            DocumentFormat::Json
        } else if mime.ends_with("xml") {
            DocumentFormat::Xml
        } else if mime.starts_with("text/") {
            DocumentFormat::Text
        } else {
            DocumentFormat::Binary
        }
    }

    /// Best-effort guess for content without a usable content type.
    pub fn sniff(content: &[u8]) -> Self {
        match content.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => DocumentFormat::Json,
            Some(b'<') => DocumentFormat::Xml,
            _ => DocumentFormat::Binary,
        }
    }
}

/// Document metadata as returned by `GET /v1/documents?category=metadata&format=json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub quality: i64,
    #[serde(default)]
    pub metadata_values: HashMap<String, String>,
}

/// One document delivered by the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub uri: String,
    pub content: Option<Bytes>,
    pub format: Option<DocumentFormat>,
    pub metadata: Option<DocumentMetadata>,
}

impl DocumentRecord {
    pub fn uri_only(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content: None,
            format: None,
            metadata: None,
        }
    }
}
