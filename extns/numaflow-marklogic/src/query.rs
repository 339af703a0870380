use std::collections::HashMap;

use marklogic_client::SearchQuery;
use quick_xml::escape::escape;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::{QueryConfig, QueryType};
use crate::watermark::{MIN_WATERMARK, ScalarOrder, StateIndex};
use crate::xml::{XmlDocument, append_child, without_declaration};
use crate::{Error, Result};

/// `${name}` placeholders in query text.
pub mod template;

use template::Template;

/// Template variable holding the current watermark.
pub const WATERMARK_VARIABLE: &str = "watermark";

const SEARCH_NAMESPACE: &str = "http://marklogic.com/appservices/search";
const CTS_NAMESPACE: &str = "http://marklogic.com/cts";

/// A query after placeholder substitution, checked for well-formedness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySpec {
    String(String),
    CombinedJson(String),
    CombinedXml(String),
    StructuredJson(String),
    StructuredXml(String),
    Collection(Vec<String>),
}

impl QuerySpec {
    pub fn new(query_type: QueryType, text: String) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(Error::Configuration("query must not be empty".to_string()));
        }

        let spec = match query_type {
            QueryType::String => QuerySpec::String(text),
            QueryType::Collection => {
                let collections: Vec<String> = text
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                if collections.is_empty() {
                    return Err(Error::Configuration(
                        "collection query names no collection".to_string(),
                    ));
                }
                QuerySpec::Collection(collections)
            }
            QueryType::CombinedJson | QueryType::StructuredJson => {
                let value: Value = serde_json::from_str(&text).map_err(|e| {
                    Error::Configuration(format!("query is not valid JSON: {e}"))
                })?;
                if !value.is_object() {
                    return Err(Error::Configuration(
                        "JSON query must be an object".to_string(),
                    ));
                }
                if query_type == QueryType::CombinedJson {
                    QuerySpec::CombinedJson(text)
                } else {
                    QuerySpec::StructuredJson(text)
                }
            }
            QueryType::CombinedXml | QueryType::StructuredXml => {
                XmlDocument::parse(&text)
                    .map_err(|e| Error::Configuration(format!("query is not valid XML: {e}")))?;
                if query_type == QueryType::CombinedXml {
                    QuerySpec::CombinedXml(text)
                } else {
                    QuerySpec::StructuredXml(text)
                }
            }
        };
        Ok(spec)
    }

    pub fn query_type(&self) -> QueryType {
        match self {
            QuerySpec::String(_) => QueryType::String,
            QuerySpec::CombinedJson(_) => QueryType::CombinedJson,
            QuerySpec::CombinedXml(_) => QueryType::CombinedXml,
            QuerySpec::StructuredJson(_) => QueryType::StructuredJson,
            QuerySpec::StructuredXml(_) => QueryType::StructuredXml,
            QuerySpec::Collection(_) => QueryType::Collection,
        }
    }

    fn to_search_query(&self) -> SearchQuery {
        match self {
            QuerySpec::String(text) => SearchQuery::Text(text.clone()),
            QuerySpec::Collection(collections) => SearchQuery::Collections(collections.clone()),
            QuerySpec::CombinedJson(text) | QuerySpec::StructuredJson(text) => {
                SearchQuery::Json(text.clone())
            }
            QuerySpec::CombinedXml(text) | QuerySpec::StructuredXml(text) => {
                SearchQuery::Xml(text.clone())
            }
        }
    }

    /// The query restricted to documents matching `range` as well.
    fn with_range(&self, range: &RangeCondition) -> Result<SearchQuery> {
        let query = match self {
            QuerySpec::String(text) => SearchQuery::Json(
                json!({"search": {"qtext": text, "query": {"queries": [range.to_json()]}}})
                    .to_string(),
            ),
            QuerySpec::Collection(collections) => SearchQuery::Json(
                json!({"query": {"queries": [
                    {"collection-query": {"uri": collections}},
                    range.to_json(),
                ]}})
                .to_string(),
            ),
            QuerySpec::StructuredJson(text) => {
                let mut value: Value = serde_json::from_str(text)
                    .map_err(|e| Error::Configuration(format!("query is not valid JSON: {e}")))?;
                let query = value
                    .get_mut("query")
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| {
                        Error::Configuration(
                            "structured JSON query must have a 'query' object".to_string(),
                        )
                    })?;
                push_query(query, range.to_json());
                SearchQuery::Json(value.to_string())
            }
            QuerySpec::CombinedJson(text) => {
                let mut value: Value = serde_json::from_str(text)
                    .map_err(|e| Error::Configuration(format!("query is not valid JSON: {e}")))?;
                let query = value
                    .get_mut("search")
                    .and_then(Value::as_object_mut)
                    .map(|search| search.entry("query").or_insert_with(|| json!({})))
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| {
                        Error::Configuration(
                            "combined JSON query must have a 'search' object".to_string(),
                        )
                    })?;
                push_query(query, range.to_json());
                SearchQuery::Json(value.to_string())
            }
            QuerySpec::StructuredXml(text) => {
                let document = parse_xml(text)?;
                let root = document
                    .root()
                    .filter(|root| root.is(Some(SEARCH_NAMESPACE), "query"))
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "structured XML query must have a <query xmlns=\"{SEARCH_NAMESPACE}\"> root"
                        ))
                    })?;
                SearchQuery::Xml(append_child(text, root, &range.to_search_xml()))
            }
            QuerySpec::CombinedXml(text) => {
                let document = parse_xml(text)?;
                let root = document
                    .root()
                    .ok_or_else(|| Error::Configuration("XML query has no root".to_string()))?;

                if root.is(Some(SEARCH_NAMESPACE), "search") {
                    let xml = match document
                        .root_children()
                        .find(|e| e.is(Some(SEARCH_NAMESPACE), "query"))
                    {
                        Some(query) => append_child(text, query, &range.to_search_xml()),
                        None => append_child(
                            text,
                            root,
                            &format!(
                                "<query xmlns=\"{SEARCH_NAMESPACE}\">{}</query>",
                                range.to_search_xml()
                            ),
                        ),
                    };
                    SearchQuery::Xml(xml)
                } else if root.is(Some(SEARCH_NAMESPACE), "query") {
                    SearchQuery::Xml(append_child(text, root, &range.to_search_xml()))
                } else if root.namespace.as_deref() == Some(CTS_NAMESPACE) {
                    SearchQuery::Xml(format!(
                        "<cts:and-query xmlns:cts=\"{CTS_NAMESPACE}\">{}{}</cts:and-query>",
                        without_declaration(text),
                        range.to_cts_xml()
                    ))
                } else {
                    return Err(Error::Configuration(format!(
                        "combined XML query must be a <search>, <query> or cts query, found <{}>",
                        root.name
                    )));
                }
            }
        };
        Ok(query)
    }
}

fn parse_xml(text: &str) -> Result<XmlDocument> {
    XmlDocument::parse(text)
        .map_err(|e| Error::Configuration(format!("query is not valid XML: {e}")))
}

fn push_query(query: &mut Map<String, Value>, item: Value) {
    let queries = query
        .entry("queries")
        .or_insert_with(|| Value::Array(vec![]));
    match queries {
        Value::Array(items) => items.push(item),
        other => {
            let existing = other.take();
            *other = Value::Array(vec![existing, item]);
        }
    }
}

/// `index > value` on the state index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCondition {
    pub index: StateIndex,
    pub scalar_type: String,
    pub value: String,
}

impl RangeCondition {
    fn xs_type(&self) -> String {
        if self.scalar_type.contains(':') {
            self.scalar_type.clone()
        } else {
            format!("xs:{}", self.scalar_type)
        }
    }

    /// Structured query in JSON.
    pub fn to_json(&self) -> Value {
        let mut range = Map::new();
        range.insert("type".to_string(), json!(self.xs_type()));
        match &self.index {
            StateIndex::JsonProperty(name) => {
                range.insert("json-property".to_string(), json!(name));
            }
            StateIndex::Element {
                namespace,
                local_name,
            } => {
                range.insert(
                    "element".to_string(),
                    json!({"ns": namespace.as_deref().unwrap_or_default(), "name": local_name}),
                );
            }
            StateIndex::Path {
                expression,
                namespaces,
                ..
            } => {
                range.insert(
                    "path-index".to_string(),
                    json!({"text": expression, "namespaces": namespaces}),
                );
            }
        }
        range.insert("value".to_string(), json!([self.value]));
        range.insert("range-operator".to_string(), json!("GT"));
        json!({ "range-query": range })
    }

    /// Structured query in XML, in the search namespace.
    pub fn to_search_xml(&self) -> String {
        let index = match &self.index {
            StateIndex::JsonProperty(name) => {
                format!("<json-property>{}</json-property>", escape(name))
            }
            StateIndex::Element {
                namespace,
                local_name,
            } => format!(
                "<element ns=\"{}\" name=\"{}\"/>",
                escape(namespace.as_deref().unwrap_or_default()),
                escape(local_name)
            ),
            StateIndex::Path {
                expression,
                namespaces,
                ..
            } => format!(
                "<path-index{}>{}</path-index>",
                namespace_declarations(namespaces),
                escape(expression)
            ),
        };
        format!(
            "<range-query xmlns=\"{SEARCH_NAMESPACE}\" type=\"{}\">{index}<value>{}</value><range-operator>GT</range-operator></range-query>",
            escape(&self.xs_type()),
            escape(&self.value)
        )
    }

    /// Serialized cts query, using the `cts` prefix.
    pub fn to_cts_xml(&self) -> String {
        let value = format!(
            "<cts:value xsi:type=\"{}\" xmlns:xs=\"http://www.w3.org/2001/XMLSchema\" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">{}</cts:value>",
            escape(&self.xs_type()),
            escape(&self.value)
        );
        match &self.index {
            StateIndex::JsonProperty(name) => format!(
                "<cts:json-property-range-query operator=\"&gt;\"><cts:property>{}</cts:property>{value}</cts:json-property-range-query>",
                escape(name)
            ),
            StateIndex::Element {
                namespace: Some(namespace),
                local_name,
            } => format!(
                "<cts:element-range-query operator=\"&gt;\"><cts:element xmlns:_ns=\"{}\">_ns:{}</cts:element>{value}</cts:element-range-query>",
                escape(namespace),
                escape(local_name)
            ),
            StateIndex::Element {
                namespace: None,
                local_name,
            } => format!(
                "<cts:element-range-query operator=\"&gt;\"><cts:element>{}</cts:element>{value}</cts:element-range-query>",
                escape(local_name)
            ),
            StateIndex::Path {
                expression,
                namespaces,
                ..
            } => format!(
                "<cts:path-range-query operator=\"&gt;\"><cts:path-expression{}>{}</cts:path-expression>{value}</cts:path-range-query>",
                namespace_declarations(namespaces),
                escape(expression)
            ),
        }
    }
}

fn namespace_declarations<'a>(namespaces: impl IntoIterator<Item = (&'a String, &'a String)>) -> String {
    namespaces
        .into_iter()
        .map(|(prefix, uri)| format!(" xmlns:{prefix}=\"{}\"", escape(uri)))
        .collect()
}

/// The query of one run, ready to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    pub spec: QuerySpec,
    /// Range condition added for incremental runs.
    pub range: Option<RangeCondition>,
    pub search: SearchQuery,
}

/// Builds the query of every run from the configured template.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    query_type: QueryType,
    template: Template,
    state_index: Option<StateIndex>,
    scalar_type: String,
}

impl QueryBuilder {
    pub fn new(config: &QueryConfig) -> Result<Self> {
        let (query_type, text) = config.effective_query();
        let template = Template::parse(text)?;
        let state_index = if config.is_incremental() {
            config.state_index()?
        } else {
            None
        };

        Ok(Self {
            query_type,
            template,
            state_index,
            scalar_type: config.state_index_scalar_type.clone(),
        })
    }

    pub fn is_incremental(&self) -> bool {
        self.state_index.is_some()
    }

    /// Resolves the query for the given watermark, [MIN_WATERMARK] when there is none, and the
    /// attributes of the incoming unit. Without a watermark, indexes that are not dates get no
    /// range condition since the sentinel is not a value of their type.
    pub fn build(
        &self,
        watermark: Option<&str>,
        attributes: &HashMap<String, String>,
    ) -> Result<ResolvedQuery> {
        let ranged = watermark.is_some()
            || ScalarOrder::for_scalar_type(&self.scalar_type) == ScalarOrder::Temporal;
        let watermark = watermark.unwrap_or(MIN_WATERMARK);
        let text = self.template.render(|name| {
            if name == WATERMARK_VARIABLE {
                Some(watermark)
            } else {
                attributes.get(name).map(String::as_str)
            }
        });

        let spec = QuerySpec::new(self.query_type, text)?;
        let range = self.state_index.as_ref().filter(|_| ranged).map(|index| RangeCondition {
            index: index.clone(),
            scalar_type: self.scalar_type.clone(),
            value: watermark.to_string(),
        });
        let search = match &range {
            Some(range) => spec.with_range(range)?,
            None => spec.to_search_query(),
        };

        debug!(
            query_type = ?self.query_type,
            incremental = range.is_some(),
            watermark,
            "Built query"
        );
        Ok(ResolvedQuery {
            spec,
            range,
            search,
        })
    }
}
