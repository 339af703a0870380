use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use marklogic_client::{BatchListener, JobConfig, QueryBatch, QueryBatcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueryConfig;
use crate::mapper::ResultMapper;
use crate::message::{FlowUnit, Relationship, Routed};
use crate::query::QueryBuilder;
use crate::state::{STATE_KEY, StateStore};
use crate::watermark::{ScalarOrder, WatermarkTracker};
use crate::{Error, Result};

/// Attribute set on an incoming unit routed to [Relationship::Failure].
pub const ERROR_ATTRIBUTE: &str = "marklogic.error";

/// Everything a single run needs from the host.
pub struct RunContext {
    /// Unit that triggered the run. Its attributes are available to the query template and it
    /// is routed to `original` or `failure` once the run is over.
    pub incoming: Option<FlowUnit>,
    pub output: mpsc::Sender<Routed>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub job_id: String,
    /// Number of units routed to `success`.
    pub emitted: u64,
    /// Watermark the query was built with.
    pub previous_watermark: Option<String>,
    /// Watermark persisted by this run, `None` if the state was left unchanged.
    pub watermark: Option<String>,
}

/// Maps every delivered document and sends it downstream while tracking the watermark.
struct EmittingListener<'a> {
    mapper: &'a ResultMapper,
    output: &'a mpsc::Sender<Routed>,
    tracker: WatermarkTracker,
    emitted: AtomicU64,
}

impl BatchListener for EmittingListener<'_> {
    async fn on_batch(&self, batch: QueryBatch) -> marklogic_client::Result<()> {
        debug!(
            job_id = batch.job_id,
            batch_number = batch.batch_number,
            count = batch.documents.len(),
            "Mapping batch"
        );
        for (offset, document) in batch.documents.into_iter().enumerate() {
            let mapped = self.mapper.map(document, batch.start + offset as u64);
            if let Some(watermark) = &mapped.watermark {
                self.tracker.observe(watermark);
            }
            self.output
                .send(Routed::new(Relationship::Success, mapped.unit))
                .await
                .map_err(|_| {
                    marklogic_client::Error::Listener("output channel is closed".to_string())
                })?;
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Queries MarkLogic and emits the matching documents. With a state index configured, every
/// run only returns documents newer than the watermark persisted by the previous successful run.
pub struct QueryMarkLogic<B, S> {
    config: QueryConfig,
    builder: QueryBuilder,
    mapper: ResultMapper,
    order: ScalarOrder,
    batcher: B,
    state: S,
}

impl<B, S> QueryMarkLogic<B, S>
where
    B: QueryBatcher,
    S: StateStore,
{
    pub fn new(config: QueryConfig, batcher: B, state: S) -> Result<Self> {
        config.validate()?;
        let builder = QueryBuilder::new(&config)?;
        let state_index = if config.is_incremental() {
            config.state_index()?
        } else {
            None
        };
        let mapper = ResultMapper::new(config.return_type, state_index);
        let order = ScalarOrder::for_scalar_type(&config.state_index_scalar_type);

        Ok(Self {
            config,
            builder,
            mapper,
            order,
            batcher,
            state,
        })
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Settings handed to the batcher on every run.
    pub fn job_config(&self) -> JobConfig {
        self.config.job_config()
    }

    pub fn batcher(&self) -> &B {
        &self.batcher
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Runs the query once. Returns after the job completed and the watermark was persisted.
    pub async fn run(&self, context: RunContext) -> Result<RunOutcome> {
        let RunContext {
            incoming,
            output,
            cancel,
        } = context;

        match self.execute(incoming.as_ref(), &output, &cancel).await {
            Ok(outcome) => {
                if let Some(unit) = incoming {
                    send(&output, Routed::new(Relationship::Original, unit)).await?;
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(?e, "Query run failed");
                // cancellation and a closed output mean the host is going away
                if !matches!(e, Error::Cancelled | Error::Output(_))
                    && let Some(unit) = incoming
                {
                    let unit = unit.with_attribute(ERROR_ATTRIBUTE, e.to_string());
                    if let Err(send_err) =
                        send(&output, Routed::new(Relationship::Failure, unit)).await
                    {
                        warn!(?send_err, "Failed to route incoming unit to failure");
                    }
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        incoming: Option<&FlowUnit>,
        output: &mpsc::Sender<Routed>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let incremental = self.builder.is_incremental();
        let previous = if incremental {
            self.state.get(STATE_KEY).await?
        } else {
            None
        };

        let no_attributes = HashMap::new();
        let attributes = incoming.map_or(&no_attributes, |unit| &unit.attributes);
        let query = self.builder.build(previous.as_deref(), attributes)?;

        let job = self.config.job_config();
        let listener = EmittingListener {
            mapper: &self.mapper,
            output,
            tracker: WatermarkTracker::new(self.order),
            emitted: AtomicU64::new(0),
        };
        info!(
            query_type = ?query.spec.query_type(),
            incremental,
            previous_watermark = ?previous,
            batch_size = job.batch_size,
            thread_count = job.thread_count,
            "Starting query run"
        );

        let report = self
            .batcher
            .run(&query.search, &job, &listener, cancel)
            .await?;
        let emitted = listener.emitted.load(Ordering::Relaxed);

        let watermark = if incremental {
            listener.tracker.max()
        } else {
            None
        };
        match &watermark {
            Some(watermark) => {
                self.state.put(STATE_KEY, watermark).await?;
                info!(watermark, "Persisted query state");
            }
            None => debug!("No watermark observed, query state unchanged"),
        }

        info!(
            job_id = report.job_id,
            emitted,
            time_taken_ms = started.elapsed().as_millis(),
            "Query run completed"
        );
        Ok(RunOutcome {
            job_id: report.job_id,
            emitted,
            previous_watermark: previous,
            watermark,
        })
    }
}

async fn send(output: &mpsc::Sender<Routed>, routed: Routed) -> Result<()> {
    output
        .send(routed)
        .await
        .map_err(|_| Error::Output("output channel is closed".to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use marklogic_client::test_utils::{BatchFailure, InMemoryBatcher, MockDocument, MockMarkLogic};
    use marklogic_client::{DatabaseClient, HttpQueryBatcher, SearchQuery};

    use super::*;
    use crate::config::{QueryType, ReturnType, StateIndexType};
    use crate::mapper::{COLLECTIONS_ATTRIBUTE, FILENAME_ATTRIBUTE};
    use crate::state::InMemoryStateStore;

    const COLLECTION: &str = "QueryMarkLogicTest";
    const NUM_DOCS: usize = 10;
    const EXPECTED_JSON: usize = 5;
    const EXPECTED_XML: usize = 5;
    const DATE_TIME: &str = "2000-01-01T00:00:00";

    fn documents() -> Vec<MockDocument> {
        (0..NUM_DOCS)
            .map(|i| {
                let document = if i % 2 == 0 {
                    MockDocument::json(
                        format!("/PutMarkLogicTest/{i}.json"),
                        "jsoncontent",
                        Some(DATE_TIME),
                    )
                } else {
                    MockDocument::xml(
                        format!("/PutMarkLogicTest/{i}.xml"),
                        "xmlcontent",
                        Some(DATE_TIME),
                    )
                };
                document.with_collections([COLLECTION])
            })
            .collect()
    }

    fn http_batcher(server: &MockMarkLogic) -> HttpQueryBatcher {
        let config = server.client_config();
        HttpQueryBatcher::new(DatabaseClient::new(&config).unwrap(), config.retry)
    }

    fn config(query: &str, query_type: QueryType) -> QueryConfig {
        QueryConfig {
            query: Some(query.to_string()),
            query_type,
            batch_size: 3,
            thread_count: 2,
            ..Default::default()
        }
    }

    async fn run_once<B, S>(
        processor: &QueryMarkLogic<B, S>,
        incoming: Option<FlowUnit>,
    ) -> (Result<RunOutcome>, Vec<Routed>)
    where
        B: QueryBatcher,
        S: StateStore,
    {
        let (tx, mut rx) = mpsc::channel(1000);
        let result = processor
            .run(RunContext {
                incoming,
                output: tx,
                cancel: CancellationToken::new(),
            })
            .await;
        let mut routed = vec![];
        while let Some(r) = rx.recv().await {
            routed.push(r);
        }
        (result, routed)
    }

    fn units(routed: &[Routed], relationship: Relationship) -> Vec<&FlowUnit> {
        routed
            .iter()
            .filter(|r| r.relationship == relationship)
            .map(|r| &r.unit)
            .collect()
    }

    fn assert_success(routed: &[Routed], expected: usize) {
        let success = units(routed, Relationship::Success);
        assert_eq!(success.len(), expected);
        assert!(
            success
                .iter()
                .all(|u| u.attribute(FILENAME_ATTRIBUTE).is_some_and(|f| !f.is_empty()))
        );
    }

    #[tokio::test]
    async fn test_collection_query_routes_original() {
        let docs = documents();
        let server = MockMarkLogic::start(docs.clone()).await;
        let processor = QueryMarkLogic::new(
            config(COLLECTION, QueryType::Collection),
            http_batcher(&server),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let incoming = FlowUnit::new("token").with_attribute("id", "12345");
        let (result, routed) = run_once(&processor, Some(incoming.clone())).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.emitted, NUM_DOCS as u64);
        assert_eq!(outcome.watermark, None);

        assert_success(&routed, NUM_DOCS);
        let original = units(&routed, Relationship::Original);
        assert_eq!(original, vec![&incoming]);
        assert!(units(&routed, Relationship::Failure).is_empty());
        // the incoming unit comes after every result
        assert_eq!(
            routed.last().map(|r| r.relationship),
            Some(Relationship::Original)
        );

        let json_doc = units(&routed, Relationship::Success)
            .into_iter()
            .find(|u| u.attribute(FILENAME_ATTRIBUTE) == Some("/PutMarkLogicTest/0.json"))
            .unwrap();
        assert_eq!(json_doc.payload.as_ref(), docs[0].content.as_bytes());
    }

    #[tokio::test]
    async fn test_legacy_collections_option() {
        let server = MockMarkLogic::start(documents()).await;
        let processor = QueryMarkLogic::new(
            QueryConfig {
                collections: Some(COLLECTION.to_string()),
                ..Default::default()
            },
            http_batcher(&server),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (result, routed) = run_once(&processor, None).await;
        result.unwrap();
        assert_success(&routed, NUM_DOCS);
        assert!(units(&routed, Relationship::Original).is_empty());
    }

    #[tokio::test]
    async fn test_every_query_type() {
        let cases = [
            ("jsoncontent", QueryType::String, EXPECTED_JSON),
            ("xmlcontent", QueryType::String, EXPECTED_XML),
            (
                r#"{"search": {"ctsquery": {"jsonPropertyValueQuery": {"property": ["sample"], "value": ["jsoncontent"]}}}}"#,
                QueryType::CombinedJson,
                EXPECTED_JSON,
            ),
            (
                r#"<cts:element-value-query xmlns:cts="http://marklogic.com/cts">
  <cts:element>sample</cts:element>
  <cts:text xml:lang="en">xmlcontent</cts:text>
</cts:element-value-query>"#,
                QueryType::CombinedXml,
                EXPECTED_XML,
            ),
            (
                r#"{"query": {"queries": [{"value-query": {"type": "string", "json-property": ["sample"], "text": ["jsoncontent"]}}]}}"#,
                QueryType::StructuredJson,
                EXPECTED_JSON,
            ),
            (
                r#"<query xmlns="http://marklogic.com/appservices/search">
  <word-query>
    <element name="sample" ns="" />
    <text>xmlcontent</text>
  </word-query>
</query>"#,
                QueryType::StructuredXml,
                EXPECTED_XML,
            ),
            (COLLECTION, QueryType::Collection, NUM_DOCS),
        ];

        let server = MockMarkLogic::start(documents()).await;
        for (query, query_type, expected) in cases {
            let processor = QueryMarkLogic::new(
                config(query, query_type),
                http_batcher(&server),
                InMemoryStateStore::new(),
            )
            .unwrap();
            let (result, routed) = run_once(&processor, None).await;
            assert_eq!(result.unwrap().emitted, expected as u64, "{query_type:?}");
            assert_success(&routed, expected);
        }
    }

    #[tokio::test]
    async fn test_templated_query_uses_incoming_attributes() {
        let server = MockMarkLogic::start(documents()).await;
        let processor = QueryMarkLogic::new(
            config(
                r#"<query xmlns="http://marklogic.com/appservices/search">
  <word-query>
    <element name="sample" ns="" />
    <text>${word}</text>
  </word-query>
</query>"#,
                QueryType::StructuredXml,
            ),
            http_batcher(&server),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let incoming = FlowUnit::new("").with_attribute("word", "xmlcontent");
        let (result, routed) = run_once(&processor, Some(incoming)).await;
        result.unwrap();
        assert_success(&routed, EXPECTED_XML);
        assert_eq!(units(&routed, Relationship::Original).len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_only_units_are_empty() {
        let server = MockMarkLogic::start(documents()).await;
        let processor = QueryMarkLogic::new(
            QueryConfig {
                return_type: ReturnType::Meta,
                ..config("xmlcontent", QueryType::String)
            },
            http_batcher(&server),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (result, routed) = run_once(&processor, None).await;
        result.unwrap();
        assert_success(&routed, EXPECTED_XML);
        for unit in units(&routed, Relationship::Success) {
            assert!(unit.payload.is_empty());
            assert_eq!(unit.attribute(COLLECTIONS_ATTRIBUTE), Some(COLLECTION));
        }
    }

    /// Runs the incremental round trip: the first run returns everything and stores the max
    /// watermark, the second returns nothing, and moving the state back returns everything again.
    async fn assert_watermark_round_trip(config: QueryConfig, expected: usize) {
        let server = MockMarkLogic::start(documents()).await;
        let processor =
            QueryMarkLogic::new(config, http_batcher(&server), InMemoryStateStore::new())
                .unwrap();

        let (result, routed) = run_once(&processor, None).await;
        let outcome = result.unwrap();
        assert_success(&routed, expected);
        assert_eq!(outcome.previous_watermark, None);
        assert_eq!(outcome.watermark.as_deref(), Some(DATE_TIME));
        assert_eq!(
            processor.state().get(STATE_KEY).await.unwrap().as_deref(),
            Some(DATE_TIME)
        );

        let (result, routed) = run_once(&processor, None).await;
        let outcome = result.unwrap();
        assert_success(&routed, 0);
        assert_eq!(outcome.watermark, None);
        assert_eq!(
            processor.state().get(STATE_KEY).await.unwrap().as_deref(),
            Some(DATE_TIME)
        );

        processor
            .state()
            .put(STATE_KEY, "1999-01-01T00:00:00")
            .await
            .unwrap();
        let (result, routed) = run_once(&processor, None).await;
        result.unwrap();
        assert_success(&routed, expected);
        assert_eq!(
            processor.state().get(STATE_KEY).await.unwrap().as_deref(),
            Some(DATE_TIME)
        );
    }

    fn json_state(config: QueryConfig) -> QueryConfig {
        QueryConfig {
            state_index: Some("dateTime".to_string()),
            state_index_type: StateIndexType::JsonProperty,
            ..config
        }
    }

    fn path_state(config: QueryConfig) -> QueryConfig {
        QueryConfig {
            state_index: Some("/root/nst:dateTime".to_string()),
            state_index_type: StateIndexType::Path,
            namespaces: BTreeMap::from([("nst".to_string(), "namespace-test".to_string())]),
            ..config
        }
    }

    fn element_state(config: QueryConfig) -> QueryConfig {
        QueryConfig {
            state_index: Some("t:dateTime".to_string()),
            state_index_type: StateIndexType::Element,
            namespaces: BTreeMap::from([("t".to_string(), "namespace-test".to_string())]),
            ..config
        }
    }

    #[tokio::test]
    async fn test_watermark_with_string_query() {
        assert_watermark_round_trip(
            json_state(config("jsoncontent", QueryType::String)),
            EXPECTED_JSON,
        )
        .await;
        assert_watermark_round_trip(
            path_state(config("xmlcontent", QueryType::String)),
            EXPECTED_XML,
        )
        .await;
    }

    #[tokio::test]
    async fn test_watermark_with_combined_query() {
        assert_watermark_round_trip(
            QueryConfig {
                return_type: ReturnType::DocumentsAndMeta,
                ..json_state(config(
                    r#"{"search": {"ctsquery": {"jsonPropertyValueQuery": {"property": ["sample"], "value": ["jsoncontent"]}}}}"#,
                    QueryType::CombinedJson,
                ))
            },
            EXPECTED_JSON,
        )
        .await;

        let cts = r#"<cts:element-value-query xmlns:cts="http://marklogic.com/cts">
  <cts:element>sample</cts:element>
  <cts:text xml:lang="en">xmlcontent</cts:text>
</cts:element-value-query>"#;
        assert_watermark_round_trip(
            path_state(config(cts, QueryType::CombinedXml)),
            EXPECTED_XML,
        )
        .await;
        assert_watermark_round_trip(
            element_state(config(cts, QueryType::CombinedXml)),
            EXPECTED_XML,
        )
        .await;
    }

    #[tokio::test]
    async fn test_watermark_with_structured_query() {
        assert_watermark_round_trip(
            json_state(config(
                r#"{"query": {"queries": [{"value-query": {"type": "string", "json-property": ["sample"], "text": ["jsoncontent"]}}]}}"#,
                QueryType::StructuredJson,
            )),
            EXPECTED_JSON,
        )
        .await;

        let structured = r#"<query xmlns="http://marklogic.com/appservices/search">
  <word-query>
    <element name="sample" ns="" />
    <text>xmlcontent</text>
  </word-query>
</query>"#;
        assert_watermark_round_trip(
            path_state(config(structured, QueryType::StructuredXml)),
            EXPECTED_XML,
        )
        .await;
        assert_watermark_round_trip(
            element_state(config(structured, QueryType::StructuredXml)),
            EXPECTED_XML,
        )
        .await;
    }

    #[tokio::test]
    async fn test_watermark_with_metadata_only() {
        assert_watermark_round_trip(
            QueryConfig {
                return_type: ReturnType::Meta,
                ..json_state(config("jsoncontent", QueryType::String))
            },
            EXPECTED_JSON,
        )
        .await;
    }

    #[tokio::test]
    async fn test_watermark_with_numeric_index() {
        let docs = ["9", "10", "2"]
            .into_iter()
            .enumerate()
            .map(|(i, seq)| {
                MockDocument::json(format!("/seq/{i}.json"), "jsoncontent", Some(seq))
                    .with_collections([COLLECTION])
            })
            .collect();
        let processor = QueryMarkLogic::new(
            QueryConfig {
                state_index_scalar_type: "long".to_string(),
                ..json_state(config(COLLECTION, QueryType::Collection))
            },
            InMemoryBatcher::new(docs),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (result, routed) = run_once(&processor, None).await;
        let outcome = result.unwrap();
        assert_success(&routed, 3);
        assert_eq!(outcome.watermark.as_deref(), Some("10"));

        let (result, routed) = run_once(&processor, None).await;
        result.unwrap();
        assert_success(&routed, 0);

        processor.state().put(STATE_KEY, "5").await.unwrap();
        let (result, routed) = run_once(&processor, None).await;
        result.unwrap();
        assert_success(&routed, 2);
        assert_eq!(
            processor.state().get(STATE_KEY).await.unwrap().as_deref(),
            Some("10")
        );

        // no date sentinel on the first run, the stored value afterwards
        let queries = processor.batcher().queries();
        assert_eq!(
            queries[0],
            SearchQuery::Collections(vec![COLLECTION.to_string()])
        );
        let SearchQuery::Json(second) = &queries[1] else {
            panic!("expected a JSON query, got {:?}", queries[1]);
        };
        assert!(second.contains("xs:long") && second.contains("\"10\""));
    }

    #[tokio::test]
    async fn test_metadata_values_become_attributes() {
        let docs = documents()
            .into_iter()
            .map(|doc| doc.with_metadata_value("source", "ingest"))
            .collect();
        let server = MockMarkLogic::start(docs).await;
        let processor = QueryMarkLogic::new(
            QueryConfig {
                return_type: ReturnType::DocumentsAndMeta,
                ..config("jsoncontent", QueryType::String)
            },
            http_batcher(&server),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (result, routed) = run_once(&processor, None).await;
        result.unwrap();
        assert_success(&routed, EXPECTED_JSON);
        for unit in units(&routed, Relationship::Success) {
            assert!(!unit.payload.is_empty());
            assert_eq!(unit.attribute("meta:source"), Some("ingest"));
        }
    }

    #[tokio::test]
    async fn test_unauthorized_routes_to_failure() {
        let batcher = InMemoryBatcher::new(documents());
        batcher.fail_with(Some(BatchFailure::Unauthorized));
        let state = InMemoryStateStore::new();
        state.put(STATE_KEY, DATE_TIME).await.unwrap();
        let processor = QueryMarkLogic::new(
            json_state(config(COLLECTION, QueryType::Collection)),
            batcher,
            state,
        )
        .unwrap();

        let (result, routed) = run_once(&processor, Some(FlowUnit::new("token"))).await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert!(!err.is_retriable());

        assert_success(&routed, 0);
        let failure = units(&routed, Relationship::Failure);
        assert_eq!(failure.len(), 1);
        assert_eq!(failure[0].payload.as_ref(), b"token");
        assert!(
            failure[0]
                .attribute(ERROR_ATTRIBUTE)
                .is_some_and(|e| e.contains("SEC-AUTHFAILED"))
        );
        assert_eq!(
            processor.state().get(STATE_KEY).await.unwrap().as_deref(),
            Some(DATE_TIME)
        );
    }

    #[tokio::test]
    async fn test_job_properties_reach_batcher() {
        let processor = QueryMarkLogic::new(
            QueryConfig {
                batch_size: 7,
                thread_count: 4,
                consistent_snapshot: false,
                ..config(COLLECTION, QueryType::Collection)
            },
            InMemoryBatcher::new(documents()),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (result, _) = run_once(&processor, None).await;
        result.unwrap();

        let jobs = processor.batcher().jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0], processor.job_config());
        assert_eq!(jobs[0].batch_size, 7);
        assert_eq!(jobs[0].thread_count, 4);
        assert!(!jobs[0].consistent_snapshot);
    }

    #[tokio::test]
    async fn test_fatal_job_routes_to_failure() {
        let batcher = InMemoryBatcher::new(documents());
        batcher.fail_with(Some(BatchFailure::Reject));
        let state = InMemoryStateStore::new();
        state.put(STATE_KEY, "1999-01-01T00:00:00").await.unwrap();
        let processor = QueryMarkLogic::new(
            json_state(config("jsoncontent", QueryType::String)),
            batcher,
            state,
        )
        .unwrap();

        let (result, routed) = run_once(&processor, Some(FlowUnit::new("token"))).await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert!(!err.is_retriable());

        assert_success(&routed, 0);
        assert!(units(&routed, Relationship::Original).is_empty());
        let failure = units(&routed, Relationship::Failure);
        assert_eq!(failure.len(), 1);
        assert!(
            failure[0]
                .attribute(ERROR_ATTRIBUTE)
                .is_some_and(|e| e.contains("SEARCH-BADQUERY"))
        );
        assert_eq!(
            processor.state().get(STATE_KEY).await.unwrap().as_deref(),
            Some("1999-01-01T00:00:00")
        );
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_watermark() {
        let batcher = InMemoryBatcher::new(documents());
        batcher.fail_with(Some(BatchFailure::TransportAfter(1)));
        let processor = QueryMarkLogic::new(
            QueryConfig {
                batch_size: 2,
                ..json_state(config("jsoncontent", QueryType::String))
            },
            batcher,
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (result, routed) = run_once(&processor, Some(FlowUnit::new("token"))).await;
        let err = result.unwrap_err();
        assert!(err.is_retriable());
        // the first batch stays emitted
        assert_success(&routed, 2);
        assert_eq!(units(&routed, Relationship::Failure).len(), 1);
        assert_eq!(processor.state().get(STATE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_query_fails_before_job() {
        let processor = QueryMarkLogic::new(
            config("{\"search\": ", QueryType::CombinedJson),
            InMemoryBatcher::new(documents()),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (result, routed) = run_once(&processor, Some(FlowUnit::new("token"))).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_success(&routed, 0);
        assert_eq!(units(&routed, Relationship::Failure).len(), 1);
        assert!(processor.batcher().jobs().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = QueryMarkLogic::new(
            QueryConfig {
                thread_count: 0,
                ..config(COLLECTION, QueryType::Collection)
            },
            InMemoryBatcher::default(),
            InMemoryStateStore::new(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let processor = QueryMarkLogic::new(
            json_state(config(COLLECTION, QueryType::Collection)),
            InMemoryBatcher::new(documents()),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = processor
            .run(RunContext {
                incoming: Some(FlowUnit::new("token")),
                output: tx,
                cancel,
            })
            .await;
        assert_eq!(result, Err(Error::Cancelled));
        assert!(rx.recv().await.is_none());
        assert_eq!(processor.state().get(STATE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_output() {
        let processor = QueryMarkLogic::new(
            config(COLLECTION, QueryType::Collection),
            InMemoryBatcher::new(documents()),
            InMemoryStateStore::new(),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel(100);
        drop(rx);
        let result = processor
            .run(RunContext {
                incoming: None,
                output: tx,
                cancel: CancellationToken::new(),
            })
            .await;
        assert!(matches!(result, Err(Error::Output(_))));
    }
}
