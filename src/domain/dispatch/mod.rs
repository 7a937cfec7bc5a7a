//! The dispatch engine: claim-and-process protocol, worker pool, submission
//! path and admin operations.

mod processor;
mod service;
mod worker;

pub use processor::JobProcessor;
pub use service::{
    DispatchService, SubmitChannel, Submission, SubmitOutcome, SystemHealth,
};
pub use worker::WorkerPool;

use thiserror::Error;

use crate::domain::queue::QueueError;
use crate::domain::store::StoreError;

/// Errors surfaced by the dispatch engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Submission failed validation; nothing was persisted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Relational store unavailable or inconsistent
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Durable queue unavailable
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Internal serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
