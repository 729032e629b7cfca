//! Error types for the tokenization orchestrator.
//!
//! Every fallible operation in this crate returns [`Result`]. Pipelines never
//! let an [`Error`] escape their worker: it is caught at the outermost
//! boundary, the session is rolled back, and the owning task is moved to
//! `FAILED`. The variants fall into three groups:
//!
//! - transient dependency failures (`Store`, `TokenizerLoad`, `BlobSync`,
//!   `Broadcast`, `Config`, `Worker`)
//! - data-integrity anomalies (`AttributeNotText`, `BlobMissing`,
//!   `BlobColumnsMismatch`, `RequiredBlobsMissing`, `Codec`)
//! - caller mistakes (`NotFound`, `InvalidRequest`, `InvalidTransition`,
//!   `TokenizerNotAllowed`, `ServiceShutdown`)

use crate::model::TaskState;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the tokenization orchestrator.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The record/attribute store failed or is unreachable.
    #[error("Store error: {context}")]
    Store { context: String },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An attribute selected for tokenization is not of type `TEXT`.
    #[error("Attribute '{name}' is not of type text")]
    AttributeNotText { name: String },

    /// A record expected to carry a tokenized blob has none.
    #[error("No tokenized blob for record {record_id}")]
    BlobMissing { record_id: String },

    /// A blob claims to cover an attribute but holds no token sequence for it.
    #[error("Blob of record {record_id} has no token sequence for '{attribute}'")]
    BlobColumnsMismatch { record_id: String, attribute: String },

    /// Blobs did not become visible before the statistics pass gave up.
    #[error("Required blobs missing: expected {expected}, found {found}")]
    RequiredBlobsMissing { expected: u64, found: u64 },

    /// A tokenized blob could not be encoded or decoded.
    #[error("Codec error: {reason}")]
    Codec { reason: String },

    /// The requested tokenizer is outside the configured allow-list.
    #[error("Tokenizer '{config_id}' is outside of configured ({allowed:?})")]
    TokenizerNotAllowed {
        config_id: String,
        allowed: Vec<String>,
    },

    /// The tokenizer engine could not be loaded.
    #[error("Failed to load tokenizer '{config_id}': {reason}")]
    TokenizerLoad { config_id: String, reason: String },

    /// The configuration service could not be reached or returned bad data.
    #[error("Config error: {reason}")]
    Config { reason: String },

    /// Pushing data to the blob storage target failed.
    #[error("Blob sync error: {reason}")]
    BlobSync { reason: String },

    /// A blocking tokenization job died before returning.
    #[error("Worker error: {reason}")]
    Worker { reason: String },

    /// The live event channel rejected a message.
    #[error("Broadcast error: {reason}")]
    Broadcast { reason: String },

    /// A task was asked to make a transition its state does not allow.
    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    /// The request was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The worker pool is shutting down and refuses new work.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub(crate) fn store(context: impl Into<String>) -> Self {
        Self::Store {
            context: context.into(),
        }
    }

    pub(crate) fn codec(reason: impl Into<String>) -> Self {
        Self::Codec {
            reason: reason.into(),
        }
    }

    /// Returns `true` for anomalies in the stored data itself, as opposed to a
    /// dependency that was temporarily unavailable.
    pub const fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::AttributeNotText { .. }
                | Self::BlobMissing { .. }
                | Self::BlobColumnsMismatch { .. }
                | Self::RequiredBlobsMissing { .. }
                | Self::Codec { .. }
        )
    }
}
