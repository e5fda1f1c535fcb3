//! Get-or-create of top-level namespaces (buckets).
use tracing::{debug, info};

use crate::{
    error::Result,
    retry::{log_failure, RetryPolicy},
    store::{Bucket, QuoteStore},
};

/// Returns the top-level namespace `name`, creating it if needed, in one write transaction.
///
/// Idempotent: repeated calls return the same bucket and never duplicate state.
pub fn ensure_namespace(store: &QuoteStore, name: &str) -> Result<Bucket> {
    let bucket = store.update(|txn| txn.create_bucket_if_not_exists(None, name))?;
    debug!(namespace = name, id = bucket.id(), "Namespace ready");
    Ok(bucket)
}

/// [`ensure_namespace`] under `policy`.
///
/// A store that cannot accept writes fails every attempt the same way and ends in
/// [`crate::QuoteStoreError::RetriesExhausted`]; callers treat that as fatal.
pub fn ensure_namespace_with_retries(
    store: &QuoteStore,
    name: &str,
    policy: &RetryPolicy,
) -> Result<Bucket> {
    let label = format!("ensure namespace '{name}'");
    let bucket = policy.execute(&label, |_| ensure_namespace(store, name), log_failure)?;
    info!("Namespace '{}' initialized (id {})", name, bucket.id());
    Ok(bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::StoreOptions, QuoteStoreError};
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn ensure_namespace_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = QuoteStore::open(&StoreOptions::read_write(dir.path().join("q.db"))).unwrap();

        let first = ensure_namespace_with_retries(&store, "QQQ", &fast_policy(5)).unwrap();
        let second = ensure_namespace(&store, "QQQ").unwrap();
        assert_eq!(first, second);

        let count: u64 = store
            .view(|txn| {
                Ok(["QQQ", "SPY"]
                    .iter()
                    .filter_map(|name| txn.bucket(None, name).transpose())
                    .count() as u64)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn read_only_store_exhausts_retries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.db");
        QuoteStore::open(&StoreOptions::read_write(&path))
            .unwrap()
            .close()
            .unwrap();
        let store = QuoteStore::open(&StoreOptions::read_only(&path)).unwrap();

        let err = ensure_namespace_with_retries(&store, "QQQ", &fast_policy(3)).unwrap_err();
        match err {
            QuoteStoreError::RetriesExhausted { label, attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(label.contains("QQQ"));
                assert!(source.to_string().contains("read-only"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = tempdir().unwrap();
        let store = QuoteStore::open(&StoreOptions::read_write(dir.path().join("q.db"))).unwrap();
        assert!(matches!(
            ensure_namespace(&store, ""),
            Err(QuoteStoreError::InvalidNamespace(_))
        ));
    }
}
