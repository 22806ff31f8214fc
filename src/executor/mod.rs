//! Executors: long-lived embedding workers, one per pool slot.
//!
//! This module provides:
//! - Worker process spawning and supervision ([`process`])
//! - The line-based socket protocol ([`wire`])
//! - The startup interpreter check ([`prerequisite`])
//! - The per-slot state machine with restart-after-N-records ([`slot`])
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   lease    ┌───────────────────────────┐
//! │ ExecutorPool │ ─────────► │ Executor (slot i)         │
//! └──────────────┘            │  WorkerProcess  --port=P+i│
//!                             │  WireClient  127.0.0.1:P+i│
//!                             └───────────────────────────┘
//! ```

pub mod prerequisite;
pub mod process;
pub mod slot;
pub mod wire;

pub use prerequisite::check_prerequisite;
pub use process::{ExitOutcome, LaunchSpec, WorkerProcess};
pub use slot::{Executor, ExecutorSettings, ExecutorState, SlotSnapshot};
pub use wire::{TERMINATE_FRAME, WireClient, WireError};
