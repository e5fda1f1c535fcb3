//! Error types for the quote-store library.
use std::error::Error as StdError;

use thiserror::Error;

use crate::quote::QuoteField;

/// Boxed cause carried by errors that wrap arbitrary operation failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The primary error type for operations within this library.
#[derive(Error, Debug)]
pub enum QuoteStoreError {
    /// Wraps an error raised by the embedded SQLite engine.
    #[error("Store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Terminal failure of a retried operation. Carries the last underlying error.
    #[error("'{label}' failed permanently after {attempts} attempts: {source}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// A quote timestamp that cannot be turned into a storage key.
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// A write inside a batch transaction failed; the whole batch was rolled back.
    #[error("Failed to put {field} for symbol '{symbol}' at key {key}: {source}")]
    Put {
        symbol: String,
        field: QuoteField,
        key: i64,
        #[source]
        source: Box<QuoteStoreError>,
    },

    /// A symbol or field namespace could not be created for a batch.
    #[error("Failed to create namespace '{bucket}' for symbol '{symbol}': {source}")]
    Namespace {
        symbol: String,
        bucket: String,
        #[source]
        source: Box<QuoteStoreError>,
    },

    /// A batch transaction could not be opened or committed.
    #[error("Failed to commit batch of {size} quotes for symbol '{symbol}': {source}")]
    Batch {
        symbol: String,
        size: usize,
        #[source]
        source: Box<QuoteStoreError>,
    },

    /// A stored field value could not be decoded back into its typed form.
    #[error("Failed to decode stored {field} value: {reason}")]
    Decode { field: QuoteField, reason: String },

    #[error("Store at {0} was opened read-only")]
    ReadOnly(String),

    #[error("Invalid namespace name: {0:?}")]
    InvalidNamespace(String),

    #[error("Invalid file mode {mode:#o}: {reason}")]
    InvalidFileMode { mode: u32, reason: String },

    #[error("Invalid ingest options: {0}")]
    InvalidIngestOptions(String),

    #[error("Failed to spawn ingest worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    /// First failure observed among the ingest workers.
    #[error("Ingest worker {worker} failed: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: Box<QuoteStoreError>,
    },

    #[error("Ingest worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

/// A convenience type alias for `Result<T, QuoteStoreError>`.
pub type Result<T, E = QuoteStoreError> = std::result::Result<T, E>;
