//! Host-side coordinator: owns the worker lifecycle and the fallback path.
//!
//! The coordinator spawns the worker once, pumps its outbound messages on a
//! background task, and exposes `search`. While the local database is not
//! ready, searches go straight to the server-side full-text-search RPC;
//! once the `DbReady` checkpoint arrives they are delegated to the worker.
//! Readiness flips true exactly once and never reverts within a session.
//!
//! Search replies carry the request id of the message that produced them;
//! the pump delivers only the reply matching the latest issued id and
//! drops stale ones, so an older search finishing late can never overwrite
//! a newer one's results.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::db::PageMatch;
use crate::protocol::{Checkpoint, HostMessage, WorkerMessage};
use crate::remote::SearchFallback;
use crate::worker::{self, WorkerDeps, WorkerHandle};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("search worker is no longer running")]
    WorkerGone,
}

/// A search awaiting its reply from the worker.
struct Pending {
    request_id: u64,
    reply: oneshot::Sender<Vec<PageMatch>>,
}

struct Shared {
    db_ready: AtomicBool,
    init_failed: AtomicBool,
    /// Bumped whenever readiness or bootstrap failure changes.
    status_tx: watch::Sender<()>,
    next_request: AtomicU64,
    pending: Mutex<Option<Pending>>,
    replicated_pages: AtomicUsize,
    replicated_sections: AtomicUsize,
}

/// Owns the worker and its event pump; terminates both on every exit path.
pub struct Coordinator {
    worker: Option<WorkerHandle>,
    pump: Option<JoinHandle<()>>,
    fallback: Arc<dyn SearchFallback>,
    shared: Arc<Shared>,
    status_rx: watch::Receiver<()>,
}

impl Coordinator {
    pub fn new(deps: WorkerDeps, fallback: Arc<dyn SearchFallback>) -> Self {
        let (worker, events) = worker::spawn(deps);
        let (status_tx, status_rx) = watch::channel(());

        let shared = Arc::new(Shared {
            db_ready: AtomicBool::new(false),
            init_failed: AtomicBool::new(false),
            status_tx,
            next_request: AtomicU64::new(0),
            pending: Mutex::new(None),
            replicated_pages: AtomicUsize::new(0),
            replicated_sections: AtomicUsize::new(0),
        });

        let pump = tokio::spawn(pump_events(events, shared.clone()));

        Self {
            worker: Some(worker),
            pump: Some(pump),
            fallback,
            shared,
            status_rx,
        }
    }

    /// Kick off database bootstrap and replication.
    pub fn init(&self, url: &str, anon_key: &str) -> Result<(), CoordinatorError> {
        self.send(HostMessage::Init {
            url: url.to_string(),
            anon_key: anon_key.to_string(),
        })
    }

    /// Whether the local database has finished replicating.
    pub fn is_ready(&self) -> bool {
        self.shared.db_ready.load(Ordering::SeqCst)
    }

    /// Replicated row counts, once ready.
    pub fn replica_stats(&self) -> Option<(usize, usize)> {
        if !self.is_ready() {
            return None;
        }
        Some((
            self.shared.replicated_pages.load(Ordering::SeqCst),
            self.shared.replicated_sections.load(Ordering::SeqCst),
        ))
    }

    /// Wait until the local database is ready, bootstrap has failed, or
    /// the timeout elapses. Returns the readiness flag either way.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut status_rx = self.status_rx.clone();

        loop {
            if self.is_ready() {
                return true;
            }
            if self.shared.init_failed.load(Ordering::SeqCst) {
                return false;
            }

            // a status bump between the checks above and this await marks
            // the watch value changed, so the wakeup cannot be lost
            match tokio::time::timeout_at(deadline, status_rx.changed()).await {
                Ok(Ok(())) => continue,
                // pump gone or timed out: report the flag as it stands
                Ok(Err(_)) | Err(_) => return self.is_ready(),
            }
        }
    }

    /// Search the documentation corpus.
    ///
    /// Delegates to the worker when the local database is ready, otherwise
    /// falls back to the server-side full-text search. Failures on either
    /// path degrade to "no new results": worker errors resolve the call
    /// with an empty list, and fallback errors are logged and swallowed.
    /// The fallback is not retried against the worker within one call.
    pub async fn search(&self, query: &str) -> Result<Vec<PageMatch>, CoordinatorError> {
        if !self.is_ready() {
            return match self.fallback.search_fts(query).await {
                Ok(matches) => Ok(matches),
                Err(err) => {
                    log::error!("fallback full-text search failed: {err}");
                    Ok(Vec::new())
                }
            };
        }

        let request_id = self.shared.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();

        // replacing an older pending entry drops its sender; the
        // superseded caller resolves with no results
        *self.shared.pending.lock().unwrap() = Some(Pending {
            request_id,
            reply: reply_tx,
        });

        self.send(HostMessage::Search {
            request_id,
            query: query.to_string(),
        })?;

        match reply_rx.await {
            Ok(matches) => Ok(matches),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Graceful teardown: stop the worker, then let the pump drain.
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }

    fn send(&self, msg: HostMessage) -> Result<(), CoordinatorError> {
        let worker = self.worker.as_ref().ok_or(CoordinatorError::WorkerGone)?;
        if worker.send(msg) {
            Ok(())
        } else {
            Err(CoordinatorError::WorkerGone)
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }
}

async fn pump_events(mut events: mpsc::UnboundedReceiver<WorkerMessage>, shared: Arc<Shared>) {
    while let Some(msg) = events.recv().await {
        route_message(&shared, msg);
    }
    log::debug!("worker event stream closed");
}

fn route_message(shared: &Shared, msg: WorkerMessage) {
    match msg {
        WorkerMessage::Checkpoint(Checkpoint::DbReady { pages, sections }) => {
            log::info!("local search database ready ({pages} pages, {sections} sections)");
            shared.replicated_pages.store(pages, Ordering::SeqCst);
            shared.replicated_sections.store(sections, Ordering::SeqCst);
            shared.db_ready.store(true, Ordering::SeqCst);
            shared.status_tx.send_replace(());
        }
        WorkerMessage::Checkpoint(checkpoint) => {
            log::debug!("worker checkpoint: {checkpoint:?}");
        }
        WorkerMessage::Error { message, context } => {
            log::error!("search worker error: {message} (context: {context:?})");

            let mut pending = shared.pending.lock().unwrap();
            if let Some(p) = pending.take() {
                // the worker will not reply for this request; resolve the
                // waiting search with no results instead of hanging
                let _ = p.reply.send(Vec::new());
            } else if !shared.db_ready.load(Ordering::SeqCst) {
                // an error with no search in flight before readiness can
                // only come from bootstrap
                shared.init_failed.store(true, Ordering::SeqCst);
                shared.status_tx.send_replace(());
            }
        }
        WorkerMessage::SearchResults {
            request_id,
            matches,
            ..
        } => {
            let mut pending = shared.pending.lock().unwrap();
            match pending.take() {
                Some(p) if p.request_id == request_id => {
                    let _ = p.reply.send(matches);
                }
                Some(p) => {
                    log::debug!(
                        "discarding stale search results for request {request_id} (latest is {})",
                        p.request_id
                    );
                    *pending = Some(p);
                }
                None => {
                    log::debug!("dropping unsolicited search results for request {request_id}");
                }
            }
        }
    }
}
