//! Read side: range scans over field sub-namespaces and reconstruction of whole quotes.
//!
//! Every function runs inside a single read transaction. A symbol or field that was never written
//! reads as empty.
use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
};

use tracing::debug;

use crate::{
    error::{QuoteStoreError, Result},
    key::{decode_key, encode_key, TimestampKey},
    quote::{format_timestamp_nanos, FieldValue, Quote, QuoteField},
    store::{Bucket, QuoteStore, StoreTxn},
};

/// Field whose sub-namespace stands in for the symbol's key set. First in [`QuoteField::ALL`].
const INDEX_FIELD: QuoteField = QuoteField::ALL[0];

fn field_bucket(txn: &StoreTxn<'_>, symbol: &str, field: QuoteField) -> Result<Option<Bucket>> {
    match txn.bucket(None, symbol)? {
        Some(parent) => txn.bucket(Some(&parent), field.bucket_name()),
        None => Ok(None),
    }
}

/// Translates a timestamp range into key bounds. `None` if the range cannot hold any
/// non-negative timestamp.
fn key_bounds<R: RangeBounds<i64>>(
    range: &R,
) -> Option<(Bound<TimestampKey>, Bound<TimestampKey>)> {
    let start = match range.start_bound() {
        Bound::Included(&t) if t > 0 => Bound::Included(encode_key(t)),
        Bound::Excluded(&t) if t >= 0 => Bound::Excluded(encode_key(t)),
        _ => Bound::Unbounded,
    };
    let end = match range.end_bound() {
        Bound::Included(&t) if t < 0 => return None,
        Bound::Excluded(&t) if t <= 0 => return None,
        Bound::Included(&t) => Bound::Included(encode_key(t)),
        Bound::Excluded(&t) => Bound::Excluded(encode_key(t)),
        Bound::Unbounded => Bound::Unbounded,
    };
    Some((start, end))
}

fn scan_bucket<R: RangeBounds<i64>>(
    txn: &StoreTxn<'_>,
    bucket: &Bucket,
    range: &R,
    limit: Option<usize>,
) -> Result<Vec<(i64, Vec<u8>)>> {
    let Some((start, end)) = key_bounds(range) else {
        return Ok(Vec::new());
    };
    let (start, end) = (start.as_ref().map(|k| &k[..]), end.as_ref().map(|k| &k[..]));
    let entries = match limit {
        Some(limit) => txn.scan_limit(bucket, start, end, limit)?,
        None => txn.scan(bucket, start, end)?,
    };
    Ok(entries
        .into_iter()
        .filter_map(|(key, value)| decode_key(&key).map(|nanos| (nanos, value)))
        .collect())
}

/// Raw stored values of one field for timestamps in `range`, in ascending timestamp order.
pub fn scan_field<R: RangeBounds<i64>>(
    store: &QuoteStore,
    symbol: &str,
    field: QuoteField,
    range: R,
) -> Result<Vec<(i64, Vec<u8>)>> {
    store.view(|txn| match field_bucket(txn, symbol, field)? {
        Some(bucket) => scan_bucket(txn, &bucket, &range, None),
        None => Ok(Vec::new()),
    })
}

fn edge_timestamp(store: &QuoteStore, symbol: &str, latest: bool) -> Result<Option<i64>> {
    store.view(|txn| {
        let Some(bucket) = field_bucket(txn, symbol, INDEX_FIELD)? else {
            return Ok(None);
        };
        let entry = if latest {
            txn.last(&bucket)?
        } else {
            txn.first(&bucket)?
        };
        Ok(entry.and_then(|(key, _)| decode_key(&key)))
    })
}

/// Timestamp of the earliest stored quote for `symbol`.
pub fn first_timestamp(store: &QuoteStore, symbol: &str) -> Result<Option<i64>> {
    edge_timestamp(store, symbol, false)
}

/// Timestamp of the latest stored quote for `symbol`.
pub fn last_timestamp(store: &QuoteStore, symbol: &str) -> Result<Option<i64>> {
    edge_timestamp(store, symbol, true)
}

/// Number of quotes stored for `symbol`.
pub fn count(store: &QuoteStore, symbol: &str) -> Result<u64> {
    store.view(|txn| match field_bucket(txn, symbol, INDEX_FIELD)? {
        Some(bucket) => txn.count(&bucket),
        None => Ok(0),
    })
}

/// Reassembles the quotes stored for `symbol` in `range` from the eight field sub-namespaces.
///
/// Fails with [`QuoteStoreError::Decode`] if a key is missing from any field or a value does not
/// decode.
pub fn read_quotes<R: RangeBounds<i64>>(
    store: &QuoteStore,
    symbol: &str,
    range: R,
) -> Result<Vec<Quote>> {
    let quotes = store.view(|txn| collect_quotes(txn, symbol, &range, None))?;
    debug!(symbol, count = quotes.len(), "Read quotes");
    Ok(quotes)
}

/// Like [`read_quotes`], but stops after the first `limit` quotes in `range`.
pub fn read_quotes_limited<R: RangeBounds<i64>>(
    store: &QuoteStore,
    symbol: &str,
    range: R,
    limit: usize,
) -> Result<Vec<Quote>> {
    let quotes = store.view(|txn| collect_quotes(txn, symbol, &range, Some(limit)))?;
    debug!(symbol, count = quotes.len(), limit, "Read quotes");
    Ok(quotes)
}

fn collect_quotes<R: RangeBounds<i64>>(
    txn: &StoreTxn<'_>,
    symbol: &str,
    range: &R,
    limit: Option<usize>,
) -> Result<Vec<Quote>> {
    let Some(index) = field_bucket(txn, symbol, INDEX_FIELD)? else {
        return Ok(Vec::new());
    };
    let mut rows: BTreeMap<i64, Vec<FieldValue>> = BTreeMap::new();
    for (nanos, value) in scan_bucket(txn, &index, range, limit)? {
        rows.insert(nanos, vec![INDEX_FIELD.decode(&value)?]);
    }
    let (Some(&first), Some(&last)) = (rows.keys().next(), rows.keys().next_back()) else {
        return Ok(Vec::new());
    };

    // The remaining fields only need the keys the index scan kept.
    for (position, field) in QuoteField::ALL.into_iter().enumerate().skip(1) {
        let Some(bucket) = field_bucket(txn, symbol, field)? else {
            return Err(QuoteStoreError::Decode {
                field,
                reason: format!("namespace missing for symbol '{symbol}'"),
            });
        };
        for (nanos, value) in scan_bucket(txn, &bucket, &(first..=last), None)? {
            let value = field.decode(&value)?;
            if let Some(row) = rows.get_mut(&nanos).filter(|row| row.len() == position) {
                row.push(value);
            }
        }
    }

    rows.into_iter()
        .map(|(nanos, values)| assemble(nanos, values))
        .collect()
}

fn assemble(nanos: i64, values: Vec<FieldValue>) -> Result<Quote> {
    let mut quote = Quote {
        ask_price: 0.0,
        ask_size: 0,
        ask_exchange: String::new(),
        bid_price: 0.0,
        bid_size: 0,
        bid_exchange: String::new(),
        conditions: Vec::new(),
        timestamp: format_timestamp_nanos(nanos),
        tape: String::new(),
    };
    if values.len() != QuoteField::ALL.len() {
        let field = QuoteField::ALL[values.len()];
        return Err(QuoteStoreError::Decode {
            field,
            reason: format!("no value at key {nanos}"),
        });
    }

    for (field, value) in QuoteField::ALL.into_iter().zip(values) {
        match (field, value) {
            (QuoteField::AskPrice, FieldValue::Price(v)) => quote.ask_price = v,
            (QuoteField::BidPrice, FieldValue::Price(v)) => quote.bid_price = v,
            (QuoteField::AskSize, FieldValue::Size(v)) => quote.ask_size = v,
            (QuoteField::BidSize, FieldValue::Size(v)) => quote.bid_size = v,
            (QuoteField::AskExchange, FieldValue::Text(v)) => quote.ask_exchange = v,
            (QuoteField::BidExchange, FieldValue::Text(v)) => quote.bid_exchange = v,
            (QuoteField::Tape, FieldValue::Text(v)) => quote.tape = v,
            (QuoteField::Conditions, FieldValue::Conditions(v)) => quote.conditions = v,
            (field, value) => {
                return Err(QuoteStoreError::Decode {
                    field,
                    reason: format!("unexpected value {value:?}"),
                })
            }
        }
    }
    Ok(quote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::StoreOptions, writer::write_batch};
    use tempfile::tempdir;

    fn quote(ts: &str, ask: f64) -> Quote {
        Quote {
            ask_price: ask,
            ask_size: 4,
            ask_exchange: "Q".into(),
            bid_price: ask - 0.02,
            bid_size: 9,
            bid_exchange: "K".into(),
            conditions: vec!["@".into(), "R".into()],
            timestamp: ts.into(),
            tape: "C".into(),
        }
    }

    fn seeded() -> (tempfile::TempDir, QuoteStore, Vec<Quote>) {
        let dir = tempdir().unwrap();
        let store = QuoteStore::open(&StoreOptions::read_write(dir.path().join("q.db"))).unwrap();
        let quotes = vec![
            quote("2024-01-02T14:30:00.000000001Z", 410.0),
            quote("2024-01-02T14:30:00.5Z", 410.25),
            quote("2024-01-02T14:30:01Z", 410.5),
        ];
        write_batch(&store, "QQQ", &quotes).unwrap();
        (dir, store, quotes)
    }

    #[test]
    fn missing_symbol_reads_empty() {
        let dir = tempdir().unwrap();
        let store = QuoteStore::open(&StoreOptions::read_write(dir.path().join("q.db"))).unwrap();
        assert!(scan_field(&store, "SPY", QuoteField::Tape, ..).unwrap().is_empty());
        assert_eq!(first_timestamp(&store, "SPY").unwrap(), None);
        assert_eq!(last_timestamp(&store, "SPY").unwrap(), None);
        assert_eq!(count(&store, "SPY").unwrap(), 0);
        assert!(read_quotes(&store, "SPY", ..).unwrap().is_empty());
    }

    #[test]
    fn scans_respect_bounds() {
        let (_dir, store, quotes) = seeded();
        let stamps: Vec<i64> = quotes.iter().map(|q| q.timestamp_nanos().unwrap()).collect();

        let all = scan_field(&store, "QQQ", QuoteField::AskPrice, ..).unwrap();
        assert_eq!(all.iter().map(|(t, _)| *t).collect::<Vec<_>>(), stamps);
        assert_eq!(all[1].1, b"410.25");

        let tail = scan_field(&store, "QQQ", QuoteField::AskPrice, stamps[1]..).unwrap();
        assert_eq!(tail.len(), 2);
        let head = scan_field(&store, "QQQ", QuoteField::AskPrice, ..stamps[1]).unwrap();
        assert_eq!(head.len(), 1);
        let exact = scan_field(&store, "QQQ", QuoteField::AskPrice, stamps[1]..=stamps[1]).unwrap();
        assert_eq!(exact.len(), 1);
        assert!(scan_field(&store, "QQQ", QuoteField::AskPrice, ..0).unwrap().is_empty());
        assert_eq!(scan_field(&store, "QQQ", QuoteField::AskPrice, -5..).unwrap().len(), 3);

        assert_eq!(first_timestamp(&store, "QQQ").unwrap(), Some(stamps[0]));
        assert_eq!(last_timestamp(&store, "QQQ").unwrap(), Some(stamps[2]));
        assert_eq!(count(&store, "QQQ").unwrap(), 3);
    }

    #[test]
    fn reassembles_quotes() {
        let (_dir, store, quotes) = seeded();
        let read = read_quotes(&store, "QQQ", ..).unwrap();
        assert_eq!(read.len(), 3);
        for (read, written) in read.iter().zip(&quotes) {
            assert_eq!(read.ask_price, written.ask_price);
            assert_eq!(read.conditions, written.conditions);
            assert_eq!(read.timestamp_nanos().unwrap(), written.timestamp_nanos().unwrap());
        }
        assert_eq!(read[2].timestamp, "2024-01-02T14:30:01Z");
        assert_eq!(
            read[1],
            Quote { timestamp: "2024-01-02T14:30:00.500Z".into(), ..quotes[1].clone() }
        );
    }

    #[test]
    fn limited_read_stops_after_limit() {
        let (_dir, store, quotes) = seeded();
        let stamps: Vec<i64> = quotes.iter().map(|q| q.timestamp_nanos().unwrap()).collect();

        let head = read_quotes_limited(&store, "QQQ", .., 2).unwrap();
        assert_eq!(head.len(), 2);
        assert_eq!(head[0].ask_price, 410.0);
        assert_eq!(head[1].ask_price, 410.25);
        assert_eq!(head[1].conditions, quotes[1].conditions);

        let tail = read_quotes_limited(&store, "QQQ", stamps[1].., 1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].timestamp_nanos().unwrap(), stamps[1]);

        assert_eq!(read_quotes_limited(&store, "QQQ", .., 10).unwrap().len(), 3);
        assert!(read_quotes_limited(&store, "QQQ", .., 0).unwrap().is_empty());
        assert!(read_quotes_limited(&store, "SPY", .., 5).unwrap().is_empty());
    }
}
