use std::time::Instant;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{DatabaseClient, SearchQuery};
use crate::document::{DocumentRecord, ReadCategories};
use crate::retry::{RetryConfig, with_retry};
use crate::{Error, Result};

/// Settings of one batched query job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Number of URIs per batch.
    pub batch_size: usize,
    /// Number of batches fetched concurrently.
    pub thread_count: usize,
    /// Pin every request of the job to the point-in-time of the first search.
    pub consistent_snapshot: bool,
    pub categories: ReadCategories,
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.thread_count == 0 {
            return Err(Error::InvalidConfig(
                "thread count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A batch of documents delivered to the [BatchListener].
#[derive(Debug, Clone)]
pub struct QueryBatch {
    pub job_id: String,
    /// Zero-based batch number within the job.
    pub batch_number: u64,
    /// Zero-based position of the first document of this batch in the result set.
    pub start: u64,
    pub documents: Vec<DocumentRecord>,
    /// Server timestamp the batch was read at, set for consistent snapshots.
    pub timestamp: Option<String>,
}

/// Summary of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: String,
    /// Size of the result set as estimated by the first search.
    pub total: u64,
    pub batches: u64,
    pub documents: u64,
    pub timestamp: Option<String>,
}

/// Receives the batches of a running job. An error aborts the job.
#[trait_variant::make(BatchListener: Send)]
pub trait LocalBatchListener {
    async fn on_batch(&self, batch: QueryBatch) -> Result<()>;
}

/// Runs a query as a batched job. `run` returns once every batch was delivered or the job
/// failed; a failed job may already have delivered some of its batches.
#[trait_variant::make(QueryBatcher: Send)]
pub trait LocalQueryBatcher {
    async fn run<L>(
        &self,
        query: &SearchQuery,
        job: &JobConfig,
        listener: &L,
        cancel: &CancellationToken,
    ) -> Result<JobReport>
    where
        L: BatchListener + Sync;
}

/// [QueryBatcher] backed by the REST API. URIs are paged through `/v1/search` with a page
/// length of `batch_size`, up to `thread_count` pages are in flight at a time and every
/// document of a page is read before the page is handed to the listener. The `total` reported
/// by the server is an estimate, so paging goes on until a page comes back short.
/// What a single batch found.
struct PageOutcome {
    batch_number: u64,
    /// URIs on the search page, a page shorter than the batch size is the last one.
    uris: usize,
    documents: u64,
}

#[derive(Clone)]
pub struct HttpQueryBatcher {
    client: DatabaseClient,
    retry: RetryConfig,
}

impl HttpQueryBatcher {
    pub fn new(client: DatabaseClient, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    async fn search_page(
        &self,
        query: &SearchQuery,
        batch_number: u64,
        batch_size: usize,
        timestamp: Option<&str>,
    ) -> Result<crate::client::SearchPage> {
        let start = batch_number * batch_size as u64 + 1;
        with_retry(&self.retry, "search", || {
            self.client.search(query, start, batch_size, timestamp)
        })
        .await
    }

    async fn read_batch(
        &self,
        uris: Vec<String>,
        categories: ReadCategories,
        timestamp: Option<&str>,
    ) -> Result<Vec<DocumentRecord>> {
        if categories == ReadCategories::uris_only() {
            return Ok(uris.into_iter().map(DocumentRecord::uri_only).collect());
        }

        let mut documents = Vec::with_capacity(uris.len());
        for uri in uris {
            let document = with_retry(&self.retry, "read document", || {
                self.client.read_document(&uri, categories, timestamp)
            })
            .await?;
            match document {
                Some(document) => documents.push(document),
                None => warn!(uri, "Document disappeared before it could be read, skipping"),
            }
        }
        Ok(documents)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_batch<L>(
        &self,
        job_id: &str,
        query: &SearchQuery,
        job: &JobConfig,
        batch_number: u64,
        prefetched: Option<Vec<String>>,
        timestamp: Option<&str>,
        listener: &L,
    ) -> Result<PageOutcome>
    where
        L: BatchListener + Sync,
    {
        let uris = match prefetched {
            Some(uris) => uris,
            None => {
                self.search_page(query, batch_number, job.batch_size, timestamp)
                    .await?
                    .uris
            }
        };
        let page_len = uris.len();
        if uris.is_empty() {
            return Ok(PageOutcome {
                batch_number,
                uris: 0,
                documents: 0,
            });
        }

        let documents = self.read_batch(uris, job.categories, timestamp).await?;
        let count = documents.len() as u64;
        debug!(job_id, batch_number, count, "Delivering batch");

        listener
            .on_batch(QueryBatch {
                job_id: job_id.to_string(),
                batch_number,
                start: batch_number * job.batch_size as u64,
                documents,
                timestamp: timestamp.map(str::to_string),
            })
            .await?;
        Ok(PageOutcome {
            batch_number,
            uris: page_len,
            documents: count,
        })
    }
}

impl QueryBatcher for HttpQueryBatcher {
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
        let job_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        // the first page carries the snapshot timestamp
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            page = self.search_page(query, 0, job.batch_size, None) => page?,
        };
        let timestamp = if job.consistent_snapshot {
            first.timestamp.clone()
        } else {
            None
        };
        // batch number of the first short page, nothing is scheduled past it
        let mut last_batch = (first.uris.len() < job.batch_size).then_some(0);
        info!(
            job_id,
            total = first.total,
            batch_size = job.batch_size,
            thread_count = job.thread_count,
            ?timestamp,
            "Starting query job"
        );

        let mut prefetched = Some(first.uris);
        let mut in_flight = FuturesUnordered::new();
        let mut next_batch = 0;
        let mut delivered_batches = 0;
        let mut documents = 0;

        loop {
            while in_flight.len() < job.thread_count
                && last_batch.is_none_or(|last| next_batch <= last)
            {
                let uris = if next_batch == 0 {
                    prefetched.take()
                } else {
                    None
                };
                in_flight.push(self.process_batch(
                    &job_id,
                    query,
                    job,
                    next_batch,
                    uris,
                    timestamp.as_deref(),
                    listener,
                ));
                next_batch += 1;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(job_id, delivered_batches, "Query job cancelled");
                    return Err(Error::Cancelled);
                }
                next = in_flight.next() => next,
            };
            match next {
                Some(Ok(page)) => {
                    if page.uris < job.batch_size {
                        last_batch = Some(last_batch.map_or(page.batch_number, |last| {
                            last.min(page.batch_number)
                        }));
                    }
                    if page.uris > 0 {
                        delivered_batches += 1;
                        documents += page.documents;
                    }
                }
                Some(Err(e)) => {
                    warn!(job_id, error = %e, delivered_batches, "Query job failed");
                    return Err(e);
                }
                None => break,
            }
        }
        drop(in_flight);

        let report = JobReport {
            job_id,
            total: first.total,
            batches: delivered_batches,
            documents,
            timestamp,
        };
        info!(
            job_id = report.job_id,
            batches = report.batches,
            documents = report.documents,
            time_taken_ms = started.elapsed().as_millis(),
            "Query job completed"
        );
        Ok(report)
    }
}
