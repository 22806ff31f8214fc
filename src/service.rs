//! Request orchestration: serialize, lease an executor, exchange, classify.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::model::{EmbeddingRequest, EmbeddingResponse, ResponseStatus};
use crate::pool::ExecutorPool;

/// Longest slice of a bad worker answer quoted in an error message.
const MAX_QUOTED_OUTPUT: usize = 512;

/// Entry point used by the outer (HTTP) layer.
#[derive(Clone)]
pub struct EmbeddingsService {
    pool: ExecutorPool,
    max_records_per_request: usize,
}

impl EmbeddingsService {
    /// Start the executor pool described by `config`.
    pub async fn start(config: &Config) -> Result<Self> {
        let pool = ExecutorPool::start(config).await?;
        Ok(Self::new(pool, config.limits.max_records_per_request))
    }

    pub fn new(pool: ExecutorPool, max_records_per_request: usize) -> Self {
        Self {
            pool,
            max_records_per_request,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Compute one embedding per record, in input order.
    pub async fn generate_embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        self.generate_embeddings_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`generate_embeddings`](Self::generate_embeddings), but gives up
    /// once `cancel` fires. The executor is released either way.
    pub async fn generate_embeddings_with_cancel(
        &self,
        request: &EmbeddingRequest,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingResponse> {
        let result = self.run(request, cancel).await;
        if let Err(e) = &result {
            report(e);
        }
        result
    }

    async fn run(
        &self,
        request: &EmbeddingRequest,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingResponse> {
        let start = Instant::now();
        let records = request.len();
        if records > self.max_records_per_request {
            return Err(ServiceError::InputTooLarge {
                records,
                max_records: self.max_records_per_request,
            });
        }

        let payload = serde_json::to_string(request).map_err(ServiceError::RequestSerialization)?;
        debug!(
            records,
            bytes = payload.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request serialized"
        );

        let mut lease = self.pool.acquire()?;
        let slot = lease.slot();
        let lease_token = lease.cancel_token().clone();
        debug!(slot, records, "Sending request to executor");
        let exchange_start = Instant::now();

        let raw = {
            let exchange = lease.exchange(&payload, records, &lease_token);
            tokio::pin!(exchange);
            tokio::select! {
                result = &mut exchange => result,
                _ = cancel.cancelled() => {
                    debug!(slot, "Request cancelled by caller");
                    lease_token.cancel();
                    exchange.await
                }
            }
        };
        drop(lease);
        let raw = raw?;
        debug!(
            slot,
            elapsed_ms = exchange_start.elapsed().as_millis() as u64,
            "Exchange finished"
        );

        let response = classify_response(&raw, records)?;
        debug!(
            slot,
            records,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Embeddings generated"
        );
        Ok(response)
    }
}

/// Turn a raw worker answer into a response or a typed failure.
fn classify_response(raw: &[u8], expected: usize) -> Result<EmbeddingResponse> {
    if raw.trim_ascii().is_empty() {
        return Err(ServiceError::delegate(
            "No output received from embedding worker",
            false,
        ));
    }

    let raw = std::str::from_utf8(raw).map_err(|e| ServiceError::ResponseParsing {
        message: format!("{e}: {}", quote(&String::from_utf8_lossy(raw))),
        source: None,
    })?;

    let response: EmbeddingResponse =
        serde_json::from_str(raw).map_err(|e| ServiceError::ResponseParsing {
            message: quote(raw),
            source: Some(e),
        })?;

    if response.status == ResponseStatus::Error {
        return Err(ServiceError::DelegateReported {
            message: response
                .message
                .unwrap_or_else(|| "no message given".to_string()),
        });
    }

    if response.data.len() != expected {
        return Err(ServiceError::ResponseParsing {
            message: format!(
                "expected {expected} embeddings, got {}",
                response.data.len()
            ),
            source: None,
        });
    }

    Ok(response)
}

fn quote(raw: &str) -> String {
    if raw.len() <= MAX_QUOTED_OUTPUT {
        return raw.to_string();
    }
    let mut end = MAX_QUOTED_OUTPUT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

fn report(err: &ServiceError) {
    if err.log_detail() {
        error!(status = err.status_code(), error = ?err, "{err}");
    } else if matches!(err, ServiceError::CapacityExhausted { .. }) {
        warn!(status = err.status_code(), "{err}");
    } else {
        info!(status = err.status_code(), "{err}");
    }
}
