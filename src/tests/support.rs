//! Shared fakes for driving the worker and coordinator without a network
//! or a real embedding model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::SearchTuning;
use crate::db::PageMatch;
use crate::embedding::{Embedder, EmbedderFactory, EmbeddingError};
use crate::remote::{RemoteError, RemoteFactory, SearchFallback, TableSource};
use crate::worker::WorkerDeps;

/// Serves canned `page` / `page_section` rows with real cursor semantics.
pub struct MockRemote {
    pub pages: Vec<Value>,
    pub sections: Vec<Value>,
    /// Fail every fetch against this table.
    pub fail_table: Option<&'static str>,
    pub fetched_tables: Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new(pages: Vec<Value>, sections: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            sections,
            fail_table: None,
            fetched_tables: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(table: &'static str) -> Arc<Self> {
        Arc::new(Self {
            pages: Vec::new(),
            sections: Vec::new(),
            fail_table: Some(table),
            fetched_tables: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TableSource for MockRemote {
    async fn fetch_rows(
        &self,
        table: &str,
        _columns: &str,
        order_column: &str,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Value>, RemoteError> {
        if self.fail_table == Some(table) {
            return Err(RemoteError::Status {
                status: 503,
                context: table.to_string(),
                body: "unavailable".to_string(),
            });
        }

        self.fetched_tables.lock().unwrap().push(table.to_string());

        let rows = match table {
            "page" => &self.pages,
            "page_section" => &self.sections,
            other => panic!("unexpected table: {other}"),
        };

        let floor = cursor.unwrap_or(i64::MIN);
        Ok(rows
            .iter()
            .filter(|row| row[order_column].as_i64().unwrap_or(i64::MAX) > floor)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Records fallback calls and serves canned page matches.
pub struct MockFallback {
    pub calls: Mutex<Vec<String>>,
    pub results: Vec<PageMatch>,
    pub fail: bool,
}

impl MockFallback {
    pub fn new(results: Vec<PageMatch>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            results,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            results: Vec::new(),
            fail: true,
        })
    }
}

#[async_trait]
impl SearchFallback for MockFallback {
    async fn search_fts(&self, query: &str) -> Result<Vec<PageMatch>, RemoteError> {
        self.calls.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(RemoteError::Status {
                status: 500,
                context: "docs_search_fts".to_string(),
                body: "boom".to_string(),
            });
        }
        Ok(self.results.clone())
    }
}

/// Returns one fixed vector for every input and counts calls.
pub struct MockEmbedder {
    vector: Vec<f32>,
    pub embed_calls: AtomicUsize,
}

impl Embedder for MockEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector.clone())
    }

    fn dimensions(&self) -> usize {
        self.vector.len()
    }
}

/// Factory around a shared `MockEmbedder`, counting constructions.
pub fn mock_embedder_factory(
    vector: Vec<f32>,
    factory_calls: Arc<AtomicUsize>,
) -> (Arc<MockEmbedder>, EmbedderFactory) {
    let embedder = Arc::new(MockEmbedder {
        vector,
        embed_calls: AtomicUsize::new(0),
    });

    let shared = embedder.clone();
    let factory: EmbedderFactory = Arc::new(move || {
        factory_calls.fetch_add(1, Ordering::SeqCst);
        Ok(shared.clone() as Arc<dyn Embedder>)
    });

    (embedder, factory)
}

/// Factory that always fails to build an extractor.
pub fn broken_embedder_factory() -> EmbedderFactory {
    Arc::new(|| -> Result<Arc<dyn Embedder>, EmbeddingError> {
        Err(EmbeddingError::InitFailed("no model".to_string()))
    })
}

/// Factory handing out one fixed remote regardless of credentials.
pub fn fixed_remote_factory(remote: Arc<MockRemote>) -> RemoteFactory {
    Arc::new(
        move |_url: &str, _anon_key: &str| -> Result<Arc<dyn TableSource>, RemoteError> {
            Ok(remote.clone())
        },
    )
}

/// Worker dependencies over 3-dimensional fakes with default tuning.
pub fn test_deps(
    remote: Arc<MockRemote>,
    embedder: EmbedderFactory,
    tuning: SearchTuning,
) -> WorkerDeps {
    WorkerDeps {
        tuning,
        dimensions: 3,
        connect: fixed_remote_factory(remote),
        embedder,
    }
}

pub fn page_row(id: i64, path: &str, title: &str) -> Value {
    json!({
        "id": id,
        "path": path,
        "meta": { "title": title, "description": format!("{title} docs") },
        "type": "guide",
        "source": "guide",
    })
}

pub fn section_row(
    id: i64,
    page_id: i64,
    slug: &str,
    rag_ignore: bool,
    embedding: &[f32],
) -> Value {
    json!({
        "id": id,
        "page_id": page_id,
        "slug": slug,
        "heading": format!("Heading {id}"),
        "rag_ignore": rag_ignore,
        "hf_embedding": embedding,
    })
}

/// Canonical test corpus: two pages, three unit-basis sections, one of
/// them flagged `rag_ignore`.
pub fn scenario_remote() -> Arc<MockRemote> {
    MockRemote::new(
        vec![
            page_row(1, "/guides/database", "Database"),
            page_row(2, "/guides/storage", "Storage"),
        ],
        vec![
            section_row(101, 1, "overview", false, &[1.0, 0.0, 0.0]),
            section_row(102, 1, "connecting", true, &[0.0, 1.0, 0.0]),
            section_row(103, 2, "uploads", false, &[0.0, 0.0, 1.0]),
        ],
    )
}
