//! Resilient ingestion and persistence of market quotes.
//!
//! Quotes are stored in a single-file embedded store, one namespace per symbol and one
//! sub-namespace per quote field, keyed by the quote's nanosecond timestamp in big-endian form so
//! that key order is time order. Writes go through [`ingest`], which fans records out to a pool of
//! workers that each commit whole batches in single transactions. Store opening and namespace
//! creation are wrapped in a retry policy with exponential backoff and jitter.

pub mod error;
pub mod key;
pub mod namespace;
pub mod pipeline;
pub mod quote;
pub mod reader;
pub mod retry;
pub mod store;
pub mod writer;

// --- Main Library Exports ---
pub use crate::{
    error::{QuoteStoreError, Result},
    namespace::{ensure_namespace, ensure_namespace_with_retries},
    pipeline::{ingest, IngestOptions, IngestReport},
    quote::{FieldValue, Quote, QuoteField, QuotesPage},
    reader::{
        count, first_timestamp, last_timestamp, read_quotes, read_quotes_limited, scan_field,
    },
    retry::{execute_with_retries, log_failure, RetryPolicy},
    store::{Bucket, QuoteStore, StoreOptions, StoreTxn},
    writer::{write_batch, BatchReport},
};
