//! # embedding-pool
//!
//! Serves embedding requests by delegating them to long-running worker
//! processes that speak a newline-delimited JSON protocol over TCP.
//!
//! ## Architecture
//!
//! - **[`config`]** - Configuration loading, layering and validation
//! - **[`error`]** - Typed failures and their HTTP status mapping
//! - **[`executor`]** - Worker processes, wire protocol and the per-slot state machine
//! - **[`pool`]** - Fixed set of executors with immediate-rejection admission control
//! - **[`service`]** - Request orchestration (serialize, lease, exchange, classify)
//! - **[`model`]** - Request/response envelopes
//! - **[`logging`]** - `tracing` subscriber setup

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod model;
pub mod pool;
pub mod service;

pub use error::{Result, ServiceError};
pub use model::{EmbeddingRecord, EmbeddingRequest, EmbeddingResponse, RecordEmbedding};
pub use pool::{ExecutorLease, ExecutorPool, PoolStats};
pub use service::EmbeddingsService;
