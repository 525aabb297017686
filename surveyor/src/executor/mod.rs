//! Boundary to the remote query executor.
//!
//! The engine depends only on this trait and on the error taxonomy's
//! timeout/transient distinction, never on the query language itself.

use crate::errors::DiscoveryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod http;

pub use http::HttpQueryExecutor;

/// Per-call options handed to the executor.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Budget for this single remote execution; expiry surfaces as a
    /// `Timeout` error.
    pub timeout: Duration,
    pub row_limit: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            row_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    #[serde(default)]
    pub scanned_records: Option<u64>,
}

/// Raw result of one query: opaque rows plus execution metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

/// External collaborator that runs a query against the remote store.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, options: &QueryOptions) -> DiscoveryResult<QueryResponse>;
}
