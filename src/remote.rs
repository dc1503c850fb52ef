//! Remote backend client.
//!
//! The remote backend is an opaque collaborator reached over HTTP: a
//! row-paginated table read API (`GET /rest/v1/{table}` with
//! `select`/`order`/`limit` and an `id=gt.{cursor}` filter) used by the
//! replicator, and a full-text-search remote procedure
//! (`POST /rest/v1/rpc/docs_search_fts`) used as the host-side fallback
//! while the local database is not ready. Both carry an anonymous,
//! read-scoped credential.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use crate::db::PageMatch;

/// Errors talking to the remote backend.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("reqwest error: {0:?}")]
    Http(#[from] reqwest::Error),

    #[error("invalid remote url: {0}")]
    InvalidUrl(String),

    #[error("remote returned status {status} for {context}: {body}")]
    Status {
        status: u16,
        context: String,
        body: String,
    },

    #[error("failed to decode remote payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Paged, ordered reads from a remote table.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Fetch up to `limit` rows of `table`, ordered ascending by
    /// `order_column`, restricted to rows whose order column is strictly
    /// greater than `cursor` when one is given.
    async fn fetch_rows(
        &self,
        table: &str,
        columns: &str,
        order_column: &str,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Value>, RemoteError>;
}

/// Server-side full-text search, the degraded path while the local
/// database is not ready.
#[async_trait]
pub trait SearchFallback: Send + Sync {
    async fn search_fts(&self, query: &str) -> Result<Vec<PageMatch>, RemoteError>;
}

/// Builds a table source from the credentials carried by an `Init` message.
pub type RemoteFactory =
    Arc<dyn Fn(&str, &str) -> Result<Arc<dyn TableSource>, RemoteError> + Send + Sync>;

/// PostgREST-style client implementing both remote capabilities.
pub struct RestClient {
    base: Url,
    anon_key: String,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(url: &str, anon_key: &str) -> Result<Self, RemoteError> {
        let trimmed = url.strip_suffix('/').unwrap_or(url);
        let base = Url::parse(trimmed).map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            base,
            anon_key: anon_key.to_string(),
            http: reqwest::Client::new(),
        })
    }

    fn table_url(
        &self,
        table: &str,
        columns: &str,
        order_column: &str,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Url, RemoteError> {
        let mut url = self
            .base
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;

        url.query_pairs_mut()
            .append_pair("select", columns)
            .append_pair("order", &format!("{order_column}.asc"))
            .append_pair("limit", &limit.to_string());

        if let Some(cursor) = cursor {
            url.query_pairs_mut()
                .append_pair(order_column, &format!("gt.{cursor}"));
        }

        Ok(url)
    }

    fn rpc_url(&self, function: &str) -> Result<Url, RemoteError> {
        self.base
            .join(&format!("rest/v1/rpc/{function}"))
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))
    }

    async fn handle_response<T>(
        response: reqwest::Response,
        context: &str,
    ) -> Result<T, RemoteError>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                context: context.to_string(),
                body: text,
            });
        }

        serde_json::from_str::<T>(&text).map_err(|err| {
            log::error!("{err}. tried to parse: {text:?}");
            RemoteError::Decode(err)
        })
    }
}

#[async_trait]
impl TableSource for RestClient {
    async fn fetch_rows(
        &self,
        table: &str,
        columns: &str,
        order_column: &str,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, columns, order_column, cursor, limit)?;
        log::debug!("fetching {url}");

        let response = self
            .http
            .get(url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .send()
            .await?;

        Self::handle_response(response, table).await
    }
}

#[async_trait]
impl SearchFallback for RestClient {
    async fn search_fts(&self, query: &str) -> Result<Vec<PageMatch>, RemoteError> {
        let url = self.rpc_url("docs_search_fts")?;
        log::debug!("fts fallback: {url}");

        let response = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .json(&json!({ "query": query }))
            .send()
            .await?;

        Self::handle_response(response, "docs_search_fts").await
    }
}

/// The production remote factory: one `RestClient` per `Init`.
pub fn rest_factory() -> RemoteFactory {
    fn build(url: &str, anon_key: &str) -> Result<Arc<dyn TableSource>, RemoteError> {
        Ok(Arc::new(RestClient::new(url, anon_key)?))
    }
    Arc::new(build)
}
