//! Error types for the embedding executor pool.

use thiserror::Error;

/// Every failure the pool or the orchestrator can hand back to a caller.
///
/// None of these are retried inside the crate. The HTTP layer that sits on
/// top maps them with [`ServiceError::status_code`].
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A runtime prerequisite is missing or a required setting is blank.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No free executor was available when the request arrived.
    #[error(
        "Embedding service not available. Maximum number of instances reached: {max_instances}"
    )]
    CapacityExhausted { max_instances: usize },

    /// Socket I/O failed, the worker sent nothing back, or the exchange was
    /// cut short by a deadline or cancellation.
    #[error("{message}")]
    DelegateCommunication {
        message: String,
        log_detail: bool,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The worker answered with an explicit error status.
    #[error("Embedding worker reported an error: {message}")]
    DelegateReported { message: String },

    /// The worker's answer could not be decoded into an embedding response.
    #[error("Error parsing embedding worker output: {message}")]
    ResponseParsing {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// The request carries more records than a worker accepts.
    #[error("Too many records ({records}, max is {max_records})")]
    InputTooLarge { records: usize, max_records: usize },

    #[error("Error serializing request data: {0}")]
    RequestSerialization(#[source] serde_json::Error),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Build a communication failure without an underlying I/O error.
    pub fn delegate(message: impl Into<String>, log_detail: bool) -> Self {
        Self::DelegateCommunication {
            message: message.into(),
            log_detail,
            source: None,
        }
    }

    /// Build a communication failure caused by an I/O error.
    pub fn delegate_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::DelegateCommunication {
            message: message.into(),
            log_detail: true,
            source: Some(source),
        }
    }

    /// HTTP status the outer layer should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) | Self::InputTooLarge { .. } => 400,
            Self::CapacityExhausted { .. } => 503,
            Self::DelegateCommunication { .. }
            | Self::DelegateReported { .. }
            | Self::ResponseParsing { .. }
            | Self::RequestSerialization(_) => 500,
        }
    }

    /// Whether the failure deserves a full, detailed log entry.
    ///
    /// Expected business-level failures (a worker rejecting its input, a full
    /// pool, an oversized request) are reported without detail.
    #[must_use]
    pub fn log_detail(&self) -> bool {
        match self {
            Self::DelegateCommunication { log_detail, .. } => *log_detail,
            Self::Configuration(_) | Self::ResponseParsing { .. } | Self::RequestSerialization(_) => {
                true
            }
            Self::CapacityExhausted { .. }
            | Self::DelegateReported { .. }
            | Self::InputTooLarge { .. } => false,
        }
    }
}
