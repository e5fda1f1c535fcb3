//! Transactional batch writes of quotes into field sub-namespaces.
//!
//! Layout: `<symbol>/<field>/<8-byte big-endian nanosecond timestamp> -> encoded value`.
use tracing::{debug, trace, warn};

use crate::{
    error::{QuoteStoreError, Result},
    key::encode_key,
    quote::{Quote, QuoteField},
    store::{Bucket, QuoteStore, StoreTxn},
};

/// Outcome of one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Quotes whose eight fields were committed.
    pub written: usize,
    /// Quotes dropped because their timestamp could not be used as a key.
    pub skipped: usize,
}

/// The symbol namespace's eight field sub-namespaces, resolved inside one transaction.
struct FieldBuckets(Vec<(QuoteField, Bucket)>);

impl FieldBuckets {
    fn ensure(txn: &StoreTxn<'_>, symbol: &str) -> Result<Self> {
        let namespace_error = |bucket: &str| {
            let bucket = bucket.to_string();
            move |source: QuoteStoreError| QuoteStoreError::Namespace {
                symbol: symbol.to_string(),
                bucket,
                source: Box::new(source),
            }
        };
        let symbol_bucket = txn
            .create_bucket_if_not_exists(None, symbol)
            .map_err(namespace_error(symbol))?;
        let buckets = QuoteField::ALL
            .into_iter()
            .map(|field| {
                txn.create_bucket_if_not_exists(Some(&symbol_bucket), field.bucket_name())
                    .map(|bucket| (field, bucket))
                    .map_err(namespace_error(field.bucket_name()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(buckets))
    }

    fn iter(&self) -> impl Iterator<Item = (QuoteField, &Bucket)> {
        self.0.iter().map(|(field, bucket)| (*field, bucket))
    }
}

/// Writes `quotes` for `symbol` in a single write transaction.
///
/// Namespaces are resolved once per batch. A quote with an unusable timestamp is logged and
/// skipped; the rest of the batch continues. Any failed put aborts the whole transaction so none
/// of the batch becomes visible, and the error names the field and key that failed. Namespace
/// and transaction failures are wrapped with the symbol. An empty batch opens no transaction.
pub fn write_batch(store: &QuoteStore, symbol: &str, quotes: &[Quote]) -> Result<BatchReport> {
    if quotes.is_empty() {
        return Ok(BatchReport::default());
    }

    let result = store.update(|txn| {
        let buckets = FieldBuckets::ensure(txn, symbol)?;
        let mut report = BatchReport::default();

        for quote in quotes {
            let nanos = match quote.timestamp_nanos() {
                Ok(nanos) => nanos,
                Err(err) => {
                    warn!(symbol, "Skipping quote: {}", err);
                    report.skipped += 1;
                    continue;
                }
            };
            let key = encode_key(nanos);

            for (field, bucket) in buckets.iter() {
                let put_error = |source: QuoteStoreError| QuoteStoreError::Put {
                    symbol: symbol.to_string(),
                    field,
                    key: nanos,
                    source: Box::new(source),
                };
                let value = field.encode(quote).map_err(put_error)?;
                txn.put(bucket, &key, &value).map_err(put_error)?;
            }
            trace!(symbol, key = nanos, "Staged quote");
            report.written += 1;
        }
        Ok(report)
    });
    let report = result.map_err(|err| match err {
        err @ (QuoteStoreError::Put { .. } | QuoteStoreError::Namespace { .. }) => err,
        source => QuoteStoreError::Batch {
            symbol: symbol.to_string(),
            size: quotes.len(),
            source: Box::new(source),
        },
    })?;

    debug!(
        symbol,
        written = report.written,
        skipped = report.skipped,
        "Committed batch"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::decode_key, store::StoreOptions};
    use std::ops::Bound;
    use tempfile::tempdir;

    fn quote(ts: &str, ask: f64) -> Quote {
        Quote {
            ask_price: ask,
            ask_size: 1,
            ask_exchange: "Q".into(),
            bid_price: ask - 0.01,
            bid_size: 2,
            bid_exchange: "P".into(),
            conditions: vec!["R".into()],
            timestamp: ts.into(),
            tape: "C".into(),
        }
    }

    #[test]
    fn writes_every_field_under_the_same_key() {
        let dir = tempdir().unwrap();
        let store = QuoteStore::open(&StoreOptions::read_write(dir.path().join("q.db"))).unwrap();

        let quotes = vec![
            quote("2024-01-02T14:30:00.000000002Z", 10.5),
            quote("2024-01-02T14:30:00.000000001Z", 10.25),
        ];
        let report = write_batch(&store, "QQQ", &quotes).unwrap();
        assert_eq!(report, BatchReport { written: 2, skipped: 0 });

        store
            .view(|txn| {
                let symbol = txn.bucket(None, "QQQ")?.expect("symbol bucket");
                let mut key_sets = Vec::new();
                for field in QuoteField::ALL {
                    let bucket = txn
                        .bucket(Some(&symbol), field.bucket_name())?
                        .expect("field bucket");
                    let keys: Vec<i64> = txn
                        .scan(&bucket, Bound::Unbounded, Bound::Unbounded)?
                        .into_iter()
                        .filter_map(|(k, _)| decode_key(&k))
                        .collect();
                    key_sets.push(keys);
                }
                let first = key_sets[0].clone();
                assert_eq!(first.len(), 2);
                assert!(first[0] < first[1]);
                assert!(key_sets.iter().all(|keys| *keys == first));

                let ask = txn.bucket(Some(&symbol), "askPrice")?.expect("askPrice");
                assert_eq!(txn.get(&ask, &encode_key(first[0]))?, Some(b"10.25".to_vec()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn empty_batch_opens_nothing() {
        let dir = tempdir().unwrap();
        let store = QuoteStore::open(&StoreOptions::read_write(dir.path().join("q.db"))).unwrap();
        assert_eq!(write_batch(&store, "QQQ", &[]).unwrap(), BatchReport::default());
        let bucket = store.view(|txn| txn.bucket(None, "QQQ")).unwrap();
        assert!(bucket.is_none());
    }
    #[test]
    fn read_only_store_wraps_commit_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.db");
        QuoteStore::open(&StoreOptions::read_write(&path))
            .unwrap()
            .close()
            .unwrap();
        let store = QuoteStore::open(&StoreOptions::read_only(&path)).unwrap();

        let quotes = vec![quote("2024-01-02T14:30:00Z", 10.0); 3];
        match write_batch(&store, "QQQ", &quotes).unwrap_err() {
            QuoteStoreError::Batch { symbol, size, source } => {
                assert_eq!(symbol, "QQQ");
                assert_eq!(size, 3);
                assert!(matches!(*source, QuoteStoreError::ReadOnly(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn namespace_failure_names_the_bucket() {
        let dir = tempdir().unwrap();
        let store = QuoteStore::open(&StoreOptions::read_write(dir.path().join("q.db"))).unwrap();
        store
            .execute_batch(
                "CREATE TRIGGER reject_tape BEFORE INSERT ON buckets WHEN NEW.name = 'tape' \
                 BEGIN SELECT RAISE(ABORT, 'tape namespace rejected'); END;",
            )
            .unwrap();

        let err = write_batch(&store, "QQQ", &[quote("2024-01-02T14:30:00Z", 10.0)]).unwrap_err();
        match &err {
            QuoteStoreError::Namespace { symbol, bucket, source } => {
                assert_eq!(symbol, "QQQ");
                assert_eq!(bucket, "tape");
                assert!(matches!(**source, QuoteStoreError::Sqlite(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("'tape'"));
        // The symbol namespace was rolled back with the batch.
        assert!(store.view(|txn| txn.bucket(None, "QQQ")).unwrap().is_none());
    }
}
