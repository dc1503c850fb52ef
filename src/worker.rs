//! The search worker: a single-consumer actor owning the embedded database.
//!
//! The worker runs as one task draining one queue; every message is
//! processed to completion before the next is picked up, so the database
//! and the memoized extractor are never touched concurrently. Failures are
//! never propagated across the worker boundary: each handler catches its
//! own errors and converts them into `Error` messages, and the worker keeps
//! running afterwards.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SearchTuning;
use crate::db::{DbError, Page, PageMatch, PageSection, SearchDb};
use crate::embedding::{Embedder, EmbedderFactory, EmbeddingError};
use crate::protocol::{Checkpoint, EventSink, HostMessage, WorkerMessage};
use crate::remote::{RemoteError, RemoteFactory};
use crate::replicate::{self, ReplicateError};

/// Columns replicated from the remote `page` table.
const PAGE_COLUMNS: &str = "id,path,meta,type,source";
/// Columns replicated from the remote `page_section` table.
const SECTION_COLUMNS: &str = "id,page_id,slug,heading,rag_ignore,hf_embedding";

/// Initialization lifecycle of the worker's database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Errors surfaced through the worker's error channel.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("replication failed: {0}")]
    Replicate(#[from] ReplicateError),

    #[error("remote connection failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("search database is not initialized")]
    DbUnavailable,
}

/// Everything the worker needs injected: tuning plus the factories for its
/// two external collaborators, so tests can drive it with fakes.
#[derive(Clone)]
pub struct WorkerDeps {
    pub tuning: SearchTuning,
    /// Embedding dimension of the corpus; the store validates against it.
    pub dimensions: usize,
    pub connect: RemoteFactory,
    pub embedder: EmbedderFactory,
}

/// Handle owned by the host: the inbound queue plus the task handle.
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<HostMessage>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Post a message to the worker. Returns false once the worker is gone.
    pub fn send(&self, msg: HostMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Graceful teardown: drain up to the shutdown message, then join.
    pub async fn shutdown(self) {
        let _ = self.tx.send(HostMessage::Shutdown);
        let _ = self.join.await;
    }

    /// Hard teardown for drop paths.
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawn the worker task. Returns the handle and the event stream.
pub fn spawn(deps: WorkerDeps) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerMessage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let join = tokio::spawn(async move {
        let sink = EventSink::new(event_tx);
        let mut state = WorkerState::new(deps);

        while let Some(msg) = rx.recv().await {
            match msg {
                HostMessage::Init { url, anon_key } => {
                    state.handle_init(&sink, &url, &anon_key).await;
                }
                HostMessage::Search { request_id, query } => {
                    state.handle_search(&sink, request_id, &query).await;
                }
                HostMessage::Shutdown => break,
            }
        }

        log::debug!("search worker stopped");
    });

    (WorkerHandle { tx, join }, event_rx)
}

/// A row that could not be decoded or inserted during replication.
struct RowFailure {
    table: &'static str,
    params: Value,
    reason: String,
}

/// The worker's single mutable state cell.
struct WorkerState {
    deps: WorkerDeps,
    lifecycle: Lifecycle,
    db: Option<SearchDb>,
    /// Lazily constructed on first search and memoized for the worker's
    /// lifetime; reset only when the worker itself is recreated.
    extractor: Option<Arc<dyn Embedder>>,
}

impl WorkerState {
    fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            lifecycle: Lifecycle::Uninitialized,
            db: None,
            extractor: None,
        }
    }

    /// Bootstrap the database and replicate both tables.
    ///
    /// Any error leaves the database unavailable and is reported through
    /// the error channel; the anon key is never attached to the context.
    async fn handle_init(&mut self, sink: &EventSink, url: &str, anon_key: &str) {
        self.lifecycle = Lifecycle::Initializing;

        match self.bootstrap(sink, url, anon_key).await {
            Ok((pages, sections)) => {
                self.lifecycle = Lifecycle::Ready;
                log::info!("local search ready: {pages} pages, {sections} sections");
                sink.checkpoint(Checkpoint::DbReady { pages, sections });
            }
            Err(err) => {
                self.lifecycle = Lifecycle::Failed;
                log::error!("local search bootstrap failed: {err}");
                sink.error(
                    err.to_string(),
                    Some(json!({ "stage": "init", "url": url })),
                );
            }
        }
    }

    async fn bootstrap(
        &mut self,
        sink: &EventSink,
        url: &str,
        anon_key: &str,
    ) -> Result<(usize, usize), WorkerError> {
        // created fresh on every bootstrap; the local copy is never persisted
        let mut db = SearchDb::new(self.deps.dimensions);
        let remote = (self.deps.connect)(url, anon_key)?;
        let mut failures: Vec<RowFailure> = Vec::new();

        // pages before sections: section rows reference page ids
        replicate::page_through(remote.as_ref(), "page", PAGE_COLUMNS, "id", |rows| {
            ingest_pages(&mut db, rows, &mut failures);
        })
        .await?;

        replicate::page_through(
            remote.as_ref(),
            "page_section",
            SECTION_COLUMNS,
            "id",
            |rows| {
                ingest_sections(&mut db, rows, &mut failures);
            },
        )
        .await?;

        for failure in &failures {
            sink.error(
                failure.reason.clone(),
                Some(json!({ "table": failure.table, "params": failure.params })),
            );
        }

        let counts = (db.page_count(), db.section_count());
        self.db = Some(db);
        Ok(counts)
    }

    /// Answer one search request.
    ///
    /// Not-ready is reported but does not stop the attempt: with no
    /// database the access step fails and is caught below, and with a
    /// half-replicated database the query runs and yields sparse results.
    async fn handle_search(&mut self, sink: &EventSink, request_id: u64, query: &str) {
        sink.checkpoint(Checkpoint::ReceivedSearchQuery);

        if self.lifecycle != Lifecycle::Ready {
            sink.checkpoint(Checkpoint::DbNotReady);
        }

        match self.run_search(query) {
            Ok((matches, feature)) => sink.results(request_id, matches, feature),
            Err(err) => {
                log::error!("search failed: {err}");
                sink.error(
                    err.to_string(),
                    Some(json!({ "request_id": request_id, "query": query })),
                );
            }
        }
    }

    fn run_search(&mut self, query: &str) -> Result<(Vec<PageMatch>, Vec<f32>), WorkerError> {
        let extractor = match &self.extractor {
            Some(extractor) => extractor.clone(),
            None => {
                let extractor = (self.deps.embedder)()?;
                self.extractor = Some(extractor.clone());
                extractor
            }
        };

        let feature = extractor.embed(query)?;

        let db = self.db.as_ref().ok_or(WorkerError::DbUnavailable)?;
        let hits = db.match_sections(
            &feature,
            self.deps.tuning.match_threshold,
            self.deps.tuning.match_limit,
            self.deps.tuning.include_ignored_sections,
        )?;
        let matches = db.aggregate(&hits);

        Ok((matches, feature))
    }
}

fn ingest_pages(db: &mut SearchDb, rows: Vec<Value>, failures: &mut Vec<RowFailure>) {
    for row in rows {
        match serde_json::from_value::<Page>(row.clone()) {
            Ok(page) => db.insert_page(page),
            Err(err) => failures.push(RowFailure {
                table: "page",
                params: row_params(row),
                reason: format!("failed to decode page row: {err}"),
            }),
        }
    }
}

fn ingest_sections(db: &mut SearchDb, rows: Vec<Value>, failures: &mut Vec<RowFailure>) {
    for row in rows {
        let section = match serde_json::from_value::<PageSection>(row.clone()) {
            Ok(section) => section,
            Err(err) => {
                failures.push(RowFailure {
                    table: "page_section",
                    params: row_params(row),
                    reason: format!("failed to decode section row: {err}"),
                });
                continue;
            }
        };

        if let Err(err) = db.insert_section(section) {
            failures.push(RowFailure {
                table: "page_section",
                params: row_params(row),
                reason: format!("failed to insert section row: {err}"),
            });
        }
    }
}

/// Row parameters attached to error reports. The embedding column is
/// replaced with a placeholder to keep diagnostics readable.
fn row_params(mut row: Value) -> Value {
    if let Some(obj) = row.as_object_mut() {
        if obj.contains_key("hf_embedding") {
            obj.insert("hf_embedding".to_string(), Value::String("<vector>".into()));
        }
    }
    row
}
