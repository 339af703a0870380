use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use marklogic_client::DocumentRecord;

use crate::config::ReturnType;
use crate::message::FlowUnit;
use crate::watermark::StateIndex;

pub const FILENAME_ATTRIBUTE: &str = "filename";
pub const URI_ATTRIBUTE: &str = "marklogic.uri";
pub const RESULT_INDEX_ATTRIBUTE: &str = "marklogic.result.index";
pub const INGESTED_AT_ATTRIBUTE: &str = "marklogic.ingested.at";
pub const WATERMARK_ATTRIBUTE: &str = "marklogic.watermark";
pub const COLLECTIONS_ATTRIBUTE: &str = "marklogic.collections";
pub const QUALITY_ATTRIBUTE: &str = "marklogic.quality";
/// Prefix of the attributes carrying document metadata values.
pub const METADATA_VALUE_PREFIX: &str = "meta:";

/// A document converted to a flow unit, with the watermark it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapped {
    pub unit: FlowUnit,
    pub watermark: Option<String>,
}

/// Converts the documents delivered by the batcher into flow units.
#[derive(Debug, Clone)]
pub struct ResultMapper {
    return_type: ReturnType,
    state_index: Option<StateIndex>,
}

impl ResultMapper {
    pub fn new(return_type: ReturnType, state_index: Option<StateIndex>) -> Self {
        Self {
            return_type,
            state_index,
        }
    }

    /// `index` is the position of the document within the run.
    pub fn map(&self, document: DocumentRecord, index: u64) -> Mapped {
        let watermark = match (&self.state_index, &document.content) {
            (Some(state_index), Some(content)) => state_index.extract(content, document.format),
            _ => None,
        };

        let payload = if self.return_type.includes_documents() {
            document.content.unwrap_or_default()
        } else {
            Bytes::new()
        };

        let mut unit = FlowUnit::new(payload)
            .with_attribute(FILENAME_ATTRIBUTE, document.uri.clone())
            .with_attribute(URI_ATTRIBUTE, document.uri)
            .with_attribute(RESULT_INDEX_ATTRIBUTE, index.to_string())
            .with_attribute(
                INGESTED_AT_ATTRIBUTE,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        if let Some(watermark) = &watermark {
            unit = unit.with_attribute(WATERMARK_ATTRIBUTE, watermark.clone());
        }

        if self.return_type.includes_metadata()
            && let Some(metadata) = document.metadata
        {
            unit = unit
                .with_attribute(COLLECTIONS_ATTRIBUTE, metadata.collections.join(","))
                .with_attribute(QUALITY_ATTRIBUTE, metadata.quality.to_string());
            for (key, value) in metadata.metadata_values {
                unit = unit.with_attribute(format!("{METADATA_VALUE_PREFIX}{key}"), value);
            }
        }

        Mapped { unit, watermark }
    }
}
