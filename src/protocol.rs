//! Message vocabulary between the host coordinator and the search worker.
//!
//! The protocol is a closed set of typed messages partitioned by direction.
//! Host to worker: `Init`, `Search`, `Shutdown`. Worker to host:
//! `Checkpoint`, `Error`, `SearchResults`. Every emission is a one-way post;
//! correlation exists only for search replies, which echo the request id of
//! the `Search` that produced them.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::db::PageMatch;

/// Messages the host sends into the worker's queue.
#[derive(Debug, Clone)]
pub enum HostMessage {
    /// Bootstrap the embedded database and replicate the remote tables.
    Init { url: String, anon_key: String },

    /// Run a similarity search. `request_id` is echoed in the reply so the
    /// host can discard replies that a newer search has superseded.
    Search { request_id: u64, query: String },

    /// Stop the worker loop after the current message.
    Shutdown,
}

/// Lifecycle milestones reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    /// Replication finished and local search is available.
    DbReady { pages: usize, sections: usize },
    /// A search message was picked up.
    ReceivedSearchQuery,
    /// A search arrived while the local database was not ready.
    DbNotReady,
}

/// Messages the worker posts back to the host.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Checkpoint(Checkpoint),

    /// A recoverable failure. Context never contains credentials; rows
    /// attached as parameters have their embedding column stripped.
    Error { message: String, context: Option<Value> },

    SearchResults {
        request_id: u64,
        matches: Vec<PageMatch>,
        /// The query embedding the matches were ranked against.
        feature: Vec<f32>,
    },
}

/// Outbound channel wrapper with emit helpers.
///
/// Sending is best-effort: once the host side is gone there is nobody left
/// to care about checkpoints, so a closed channel is logged and ignored.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { tx }
    }

    pub fn checkpoint(&self, checkpoint: Checkpoint) {
        self.send(WorkerMessage::Checkpoint(checkpoint));
    }

    pub fn error(&self, message: impl Into<String>, context: Option<Value>) {
        self.send(WorkerMessage::Error {
            message: message.into(),
            context,
        });
    }

    pub fn results(&self, request_id: u64, matches: Vec<PageMatch>, feature: Vec<f32>) {
        self.send(WorkerMessage::SearchResults {
            request_id,
            matches,
            feature,
        });
    }

    fn send(&self, msg: WorkerMessage) {
        if self.tx.send(msg).is_err() {
            log::debug!("host side gone, dropping worker message");
        }
    }
}
