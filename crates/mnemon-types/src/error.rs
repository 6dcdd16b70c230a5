//! Shared error types for the Mnemon substrate.

use thiserror::Error;

/// Top-level error type for the Mnemon substrate.
#[derive(Error, Debug)]
pub enum MnemonError {
    /// Input failed structural validation. Never persisted, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No upcaster registered for a schema version step. This is a
    /// configuration defect: the registry must cover every version between
    /// the oldest supported and current.
    #[error("No upcaster registered for schema version {0}")]
    UpcasterNotFound(String),

    /// The requested packet does not exist.
    #[error("Packet not found: {0}")]
    NotFound(String),

    /// A persistence-layer failure (I/O, SQL, connection).
    #[error("Repository error: {0}")]
    Repository(String),

    /// A stored content hash does not match the recomputed digest.
    #[error("Content hash mismatch for packet {0}")]
    IntegrityMismatch(String),

    /// An embedding driver failure.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// The write-path circuit breaker is open.
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with MnemonError.
pub type MnemonResult<T> = Result<T, MnemonError>;
