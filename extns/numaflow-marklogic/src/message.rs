use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

/// A unit of data emitted by the source: an opaque payload and string attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowUnit {
    pub payload: Bytes,
    pub attributes: HashMap<String, String>,
}

impl FlowUnit {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Output channel a unit is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relationship {
    /// A document returned by the query.
    Success,
    /// The incoming unit of a run that completed.
    Original,
    /// The incoming unit of a run that failed.
    Failure,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::Success => "success",
            Relationship::Original => "original",
            Relationship::Failure => "failure",
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub relationship: Relationship,
    pub unit: FlowUnit,
}

impl Routed {
    pub fn new(relationship: Relationship, unit: FlowUnit) -> Self {
        Self { relationship, unit }
    }
}
