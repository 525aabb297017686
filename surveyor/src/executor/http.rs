//! HTTP implementation of the query executor.

use crate::config::ExecutorConfig;
use crate::errors::{DiscoveryError, DiscoveryResult};
use crate::executor::{QueryExecutor, QueryOptions, QueryResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    limit: u32,
    timeout_ms: u64,
}

/// Error document some endpoints return with a 200 status.
#[derive(Debug, Deserialize)]
struct RemoteError {
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RemoteEnvelope {
    #[serde(default)]
    error: Option<RemoteError>,
    #[serde(flatten)]
    response: QueryResponse,
}

pub struct HttpQueryExecutor {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpQueryExecutor {
    /// Build from config. Missing endpoint or credentials are fatal:
    /// there is no point starting a session that cannot query.
    pub fn new(config: &ExecutorConfig) -> DiscoveryResult<Self> {
        if config.endpoint.is_empty() {
            return Err(DiscoveryError::FatalConfig(
                "executor.endpoint is not configured".to_string(),
            ));
        }
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            DiscoveryError::FatalConfig(format!(
                "API key environment variable '{}' is not set",
                config.api_key_env
            ))
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(&self, query: &str, options: &QueryOptions) -> DiscoveryResult<QueryResponse> {
        let body = QueryRequest {
            query,
            limit: options.row_limit,
            timeout_ms: options.timeout.as_millis() as u64,
        };
        debug!(query, timeout_ms = body.timeout_ms, "submitting remote query");

        let response = self
            .client
            .post(&self.endpoint)
            .header("Api-Key", &self.api_key)
            .json(&body)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DiscoveryError::Timeout(format!("query did not complete: {}", e))
                } else {
                    DiscoveryError::Transient(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::REQUEST_TIMEOUT {
            return Err(DiscoveryError::Timeout(format!(
                "remote reported execution timeout ({})",
                status
            )));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DiscoveryError::FatalConfig(format!(
                "credentials rejected by remote API ({})",
                status
            )));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(DiscoveryError::Transient(format!(
                "remote API returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(DiscoveryError::Transient(format!(
                "unexpected status {}",
                status
            )));
        }

        let envelope: RemoteEnvelope = response
            .json()
            .await
            .map_err(|e| DiscoveryError::MalformedResponse(e.to_string()))?;
        if let Some(err) = envelope.error {
            if err.kind == "timeout" {
                return Err(DiscoveryError::Timeout(err.message));
            }
            return Err(DiscoveryError::Transient(format!(
                "{}: {}",
                err.kind, err.message
            )));
        }
        Ok(envelope.response)
    }
}
