use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use marklogic_client::DocumentFormat;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::StateIndexType;
use crate::xml::XmlDocument;
use crate::{Error, Result};

/// Watermark used when nothing was persisted yet.
pub const MIN_WATERMARK: &str = "1900-01-01T00:00:00";

/// One step of an absolute path index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub namespace: Option<String>,
    /// `*` matches any element.
    pub local_name: String,
}

/// A state index with its namespace prefixes resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateIndex {
    JsonProperty(String),
    Element {
        namespace: Option<String>,
        local_name: String,
    },
    Path {
        /// The path expression as configured.
        expression: String,
        steps: Vec<PathStep>,
        /// Bindings of the prefixes used in `expression`.
        namespaces: BTreeMap<String, String>,
    },
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn bind<'a>(prefix: &str, namespaces: &'a BTreeMap<String, String>) -> Result<&'a String> {
    namespaces.get(prefix).ok_or_else(|| {
        Error::Configuration(format!(
            "namespace prefix '{prefix}' of the state index is not bound"
        ))
    })
}

impl StateIndex {
    pub fn resolve(
        index_type: StateIndexType,
        index: &str,
        namespaces: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let index = index.trim();
        if index.is_empty() {
            return Err(Error::Configuration(
                "stateIndex must not be empty".to_string(),
            ));
        }

        match index_type {
            StateIndexType::JsonProperty => Ok(StateIndex::JsonProperty(index.to_string())),
            StateIndexType::Element => {
                let (prefix, local_name) = split_qname(index);
                let namespace = prefix.map(|p| bind(p, namespaces)).transpose()?;
                Ok(StateIndex::Element {
                    namespace: namespace.cloned(),
                    local_name: local_name.to_string(),
                })
            }
            StateIndexType::Path => {
                let Some(relative) = index.strip_prefix('/') else {
                    return Err(Error::Configuration(format!(
                        "path state index '{index}' must be absolute"
                    )));
                };

                let mut steps = Vec::new();
                let mut used = BTreeMap::new();
                for step in relative.split('/') {
                    if step.is_empty() || step.contains(['[', '(', '@']) {
                        return Err(Error::Configuration(format!(
                            "path state index '{index}' may only contain child element steps"
                        )));
                    }
                    let (prefix, local_name) = split_qname(step);
                    let namespace = match prefix {
                        Some(prefix) => {
                            let uri = bind(prefix, namespaces)?;
                            used.insert(prefix.to_string(), uri.clone());
                            Some(uri.clone())
                        }
                        None => None,
                    };
                    steps.push(PathStep {
                        namespace,
                        local_name: local_name.to_string(),
                    });
                }

                Ok(StateIndex::Path {
                    expression: index.to_string(),
                    steps,
                    namespaces: used,
                })
            }
        }
    }

    /// Reads the index value from a document body.
    pub fn extract(&self, content: &[u8], format: Option<DocumentFormat>) -> Option<String> {
        let format = match format {
            Some(DocumentFormat::Json) | Some(DocumentFormat::Xml) => format,
            _ => Some(DocumentFormat::sniff(content)),
        };
        match format {
            Some(DocumentFormat::Json) => {
                let value: Value = serde_json::from_slice(content).ok()?;
                self.extract_json(&value)
            }
            Some(DocumentFormat::Xml) => {
                let text = std::str::from_utf8(content).ok()?;
                let document = XmlDocument::parse(text).ok()?;
                self.extract_xml(&document)
            }
            _ => None,
        }
    }

    fn extract_json(&self, value: &Value) -> Option<String> {
        match self {
            StateIndex::JsonProperty(name) => find_property(value, name),
            StateIndex::Element { .. } => None,
            StateIndex::Path { steps, .. } => {
                let mut current = value;
                for step in steps {
                    if step.namespace.is_some() {
                        return None;
                    }
                    current = current.get(&step.local_name)?;
                }
                scalar(current)
            }
        }
    }

    fn extract_xml(&self, document: &XmlDocument) -> Option<String> {
        let found = match self {
            StateIndex::JsonProperty(_) => None,
            StateIndex::Element {
                namespace,
                local_name,
            } => document
                .elements()
                .iter()
                .find(|e| e.is(namespace.as_deref(), local_name) && !e.text.trim().is_empty()),
            StateIndex::Path { steps, .. } => document
                .elements()
                .iter()
                .enumerate()
                .filter(|(index, _)| {
                    let chain = document.ancestry(*index);
                    chain.len() == steps.len()
                        && chain.iter().zip(steps).all(|(element, step)| {
                            (step.local_name == "*" || element.local_name == step.local_name)
                                && element.namespace == step.namespace
                        })
                })
                .map(|(_, element)| element)
                .find(|e| !e.text.trim().is_empty()),
        };
        found.map(|e| e.text.trim().to_string())
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First occurrence of `name`, depth-first.
fn find_property(value: &Value, name: &str) -> Option<String> {
    match value {
        Value::Object(map) => map.iter().find_map(|(key, inner)| {
            if key == name {
                scalar(inner)
            } else {
                find_property(inner, name)
            }
        }),
        Value::Array(items) => items.iter().find_map(|item| find_property(item, name)),
        _ => None,
    }
}

fn parse_date_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Ordering of watermark values, derived from the scalar type of the state index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScalarOrder {
    /// `dateTime` and `date`, compared as instants.
    #[default]
    Temporal,
    /// Integer and floating point types.
    Numeric,
    /// Everything else, compared as strings.
    Lexical,
}

impl ScalarOrder {
    /// Accepts the type with or without the `xs:` prefix.
    pub fn for_scalar_type(scalar_type: &str) -> Self {
        let local = scalar_type
            .trim()
            .rsplit_once(':')
            .map_or(scalar_type.trim(), |(_, local)| local);
        match local {
            "dateTime" | "date" => ScalarOrder::Temporal,
            "int" | "long" | "integer" | "short" | "byte" | "unsignedInt" | "unsignedLong"
            | "unsignedShort" | "unsignedByte" | "nonNegativeInteger" | "positiveInteger"
            | "nonPositiveInteger" | "negativeInteger" | "decimal" | "double" | "float" => {
                ScalarOrder::Numeric
            }
            _ => ScalarOrder::Lexical,
        }
    }

    /// Falls back to string ordering when either value does not parse as the scalar type.
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        let parsed = match self {
            ScalarOrder::Temporal => match (parse_date_time(a), parse_date_time(b)) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
            ScalarOrder::Numeric => compare_numbers(a, b),
            ScalarOrder::Lexical => None,
        };
        parsed.unwrap_or_else(|| a.cmp(b))
    }
}

fn compare_numbers(a: &str, b: &str) -> Option<Ordering> {
    let (a, b) = (a.trim(), b.trim());
    if let (Ok(a), Ok(b)) = (a.parse::<i128>(), b.parse::<i128>()) {
        return Some(a.cmp(&b));
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => None,
    }
}

/// Keeps the highest watermark observed during a run. Shared by the batches delivered
/// concurrently.
#[derive(Debug, Default)]
pub struct WatermarkTracker {
    order: ScalarOrder,
    max: Mutex<Option<String>>,
}

impl WatermarkTracker {
    pub fn new(order: ScalarOrder) -> Self {
        Self {
            order,
            max: Mutex::new(None),
        }
    }

    pub fn observe(&self, candidate: &str) {
        let mut max = self.max.lock();
        let replace = max
            .as_deref()
            .is_none_or(|current| self.order.compare(candidate, current) == Ordering::Greater);
        if replace {
            *max = Some(candidate.to_string());
        }
    }

    pub fn max(&self) -> Option<String> {
        self.max.lock().clone()
    }
}
