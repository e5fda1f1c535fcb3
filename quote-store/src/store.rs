//! Embedded, single-file, ordered key-value store with nested buckets.
//!
//! The store is a SQLite database holding two tables: a bucket tree (`buckets`) and the entries of
//! every bucket (`entries`), clustered on `(bucket_id, key)` so iterating a bucket yields its keys
//! in byte-lexicographic order. All access goes through [`QuoteStore::update`] (one immediate
//! write transaction) or [`QuoteStore::view`] (one read transaction). Write transactions are
//! serialized: the connection lives behind a mutex, and SQLite's file lock plus the configured
//! busy timeout cover other connections to the same file.

use std::{
    fs, io,
    ops::Bound,
    path::{Path, PathBuf},
    time::Duration,
};

use parking_lot::Mutex;
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OpenFlags, OptionalExtension,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::{
    error::{QuoteStoreError, Result},
    retry::{duration_ms, log_failure, RetryPolicy},
};

pub const DEFAULT_STORE_PATH: &str = "db/ticks.db";
pub const READ_WRITE_FILE_MODE: u32 = 0o600;
pub const READ_ONLY_FILE_MODE: u32 = 0o400;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;

const ROOT_PARENT_ID: i64 = 0;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    id INTEGER PRIMARY KEY,
    parent_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (parent_id, name)
);

CREATE TABLE IF NOT EXISTS entries (
    bucket_id INTEGER NOT NULL REFERENCES buckets(id),
    key BLOB NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (bucket_id, key)
) WITHOUT ROWID;
"#;

const PUT_SQL: &str = "INSERT INTO entries (bucket_id, key, value) VALUES (?1, ?2, ?3) \
     ON CONFLICT (bucket_id, key) DO UPDATE SET value = excluded.value";

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

fn default_file_mode() -> u32 {
    READ_WRITE_FILE_MODE
}

fn default_lock_timeout() -> Duration {
    Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS)
}

/// Options for opening a [`QuoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Unix permission bits applied when the file is created.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    /// How long to wait for the file lock held by another connection.
    #[serde(
        rename = "lock_timeout_ms",
        default = "default_lock_timeout",
        with = "duration_ms"
    )]
    pub lock_timeout: Duration,
    #[serde(default)]
    pub read_only: bool,
}

impl StoreOptions {
    /// Read-write preset: owner-only `0600`, 500ms lock timeout. Creates the file if missing.
    pub fn read_write<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file_mode: READ_WRITE_FILE_MODE,
            lock_timeout: default_lock_timeout(),
            read_only: false,
        }
    }

    /// Read-only preset: owner-only `0400`, 500ms lock timeout. The file must exist.
    pub fn read_only<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file_mode: READ_ONLY_FILE_MODE,
            lock_timeout: default_lock_timeout(),
            read_only: true,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Rejects permission bits that expose the file beyond its owner, and read-write options
    /// whose mode would leave the owner unable to write.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| QuoteStoreError::InvalidFileMode {
            mode: self.file_mode,
            reason: reason.to_string(),
        };
        if self.file_mode & !0o777 != 0 {
            return Err(invalid("only permission bits are allowed"));
        }
        if self.file_mode & 0o077 != 0 {
            return Err(invalid("grants access to group or others"));
        }
        if self.file_mode & 0o400 == 0 {
            return Err(invalid("owner cannot read"));
        }
        if !self.read_only && self.file_mode & 0o200 == 0 {
            return Err(invalid("read-write store requires owner write permission"));
        }
        Ok(())
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::read_write(DEFAULT_STORE_PATH)
    }
}

/// Handle to a bucket. Buckets are never deleted, so a handle stays valid for the lifetime of
/// the store file and can be reused across transactions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bucket {
    id: i64,
    name: String,
}

impl Bucket {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An owned, open store. Shared across threads by reference.
pub struct QuoteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    read_only: bool,
}

impl QuoteStore {
    /// Opens (and in read-write mode creates) the store described by `options`.
    pub fn open(options: &StoreOptions) -> Result<Self> {
        options.validate()?;
        let path = options.path.clone();

        let flags = if options.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let existed = path.exists();

        debug!(path = ?path, read_only = options.read_only, "Opening store");
        let conn = Connection::open_with_flags(&path, flags)?;
        conn.busy_timeout(options.lock_timeout)?;

        if !options.read_only {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = FULL;")?;
            conn.execute_batch(SCHEMA)?;
            if !existed {
                apply_file_mode(&path, options.file_mode)?;
                info!("Created store file {:?} with mode {:#o}", path, options.file_mode);
            }
        }

        info!("Opened store {:?} (read_only: {})", path, options.read_only);
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            read_only: options.read_only,
        })
    }

    /// [`QuoteStore::open`] under `policy`, absorbing transient lock contention.
    pub fn open_with_retries(options: &StoreOptions, policy: &RetryPolicy) -> Result<Self> {
        policy.execute("open store", |_| Self::open(options), log_failure)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Runs `f` inside one write transaction. Commits if `f` returns `Ok`, rolls back otherwise.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<T>,
    {
        if self.read_only {
            return Err(QuoteStoreError::ReadOnly(self.path.display().to_string()));
        }
        let mut conn = self.conn.lock();
        let txn = StoreTxn {
            tx: conn.transaction_with_behavior(TransactionBehavior::Immediate)?,
            writable: true,
        };
        let value = f(&txn)?;
        txn.tx.commit()?;
        trace!("Committed write transaction");
        Ok(value)
    }

    /// Runs `f` inside one read transaction.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let txn = StoreTxn {
            tx: conn.transaction_with_behavior(TransactionBehavior::Deferred)?,
            writable: false,
        };
        let value = f(&txn)?;
        txn.tx.commit()?;
        Ok(value)
    }

    /// Closes the store, surfacing any error from the final flush.
    pub fn close(self) -> Result<()> {
        let path = self.path;
        self.conn
            .into_inner()
            .close()
            .map_err(|(_, err)| QuoteStoreError::from(err))?;
        info!("Closed store {:?}", path);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.lock().execute_batch(sql)?)
    }
}

#[cfg(unix)]
fn apply_file_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_file_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// A transaction over the store, passed to the closures of [`QuoteStore::update`] and
/// [`QuoteStore::view`].
pub struct StoreTxn<'conn> {
    tx: rusqlite::Transaction<'conn>,
    writable: bool,
}

impl<'conn> StoreTxn<'conn> {
    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(QuoteStoreError::ReadOnly("read transaction".to_string()))
        }
    }

    /// Looks up a bucket. `parent == None` addresses the top level.
    pub fn bucket(&self, parent: Option<&Bucket>, name: &str) -> Result<Option<Bucket>> {
        let parent_id = parent.map_or(ROOT_PARENT_ID, Bucket::id);
        let id = self
            .tx
            .prepare_cached("SELECT id FROM buckets WHERE parent_id = ?1 AND name = ?2")?
            .query_row(params![parent_id, name], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(id.map(|id| Bucket {
            id,
            name: name.to_string(),
        }))
    }

    /// Returns the named bucket under `parent`, creating it first if it does not exist.
    pub fn create_bucket_if_not_exists(
        &self,
        parent: Option<&Bucket>,
        name: &str,
    ) -> Result<Bucket> {
        if name.is_empty() {
            return Err(QuoteStoreError::InvalidNamespace(name.to_string()));
        }
        self.ensure_writable()?;
        if let Some(bucket) = self.bucket(parent, name)? {
            return Ok(bucket);
        }
        let parent_id = parent.map_or(ROOT_PARENT_ID, Bucket::id);
        self.tx
            .prepare_cached("INSERT INTO buckets (parent_id, name) VALUES (?1, ?2)")?
            .execute(params![parent_id, name])?;
        let id = self.tx.last_insert_rowid();
        debug!(bucket = name, parent_id, id, "Created bucket");
        Ok(Bucket {
            id,
            name: name.to_string(),
        })
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, bucket: &Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.tx
            .prepare_cached(PUT_SQL)?
            .execute(params![bucket.id, key, value])?;
        Ok(())
    }

    pub fn get(&self, bucket: &Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tx
            .prepare_cached("SELECT value FROM entries WHERE bucket_id = ?1 AND key = ?2")?
            .query_row(params![bucket.id, key], |row| row.get(0))
            .optional()?)
    }

    /// Entries of `bucket` with keys inside the bounds, in ascending key order.
    pub fn scan(
        &self,
        bucket: &Bucket,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_entries(bucket, start, end, None)
    }

    /// Like [`StoreTxn::scan`], stopping after the first `limit` entries.
    pub fn scan_limit(
        &self,
        bucket: &Bucket,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_entries(bucket, start, end, Some(limit))
    }

    fn scan_entries(
        &self,
        bucket: &Bucket,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut sql = String::from("SELECT key, value FROM entries WHERE bucket_id = ?1");
        let mut args = vec![SqlValue::Integer(bucket.id)];
        for (bound, inclusive, exclusive) in [(start, ">=", ">"), (end, "<=", "<")] {
            let (op, key) = match bound {
                Bound::Included(key) => (inclusive, key),
                Bound::Excluded(key) => (exclusive, key),
                Bound::Unbounded => continue,
            };
            args.push(SqlValue::Blob(key.to_vec()));
            sql.push_str(&format!(" AND key {} ?{}", op, args.len()));
        }
        sql.push_str(" ORDER BY key");
        if let Some(limit) = limit {
            args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Entry with the smallest key.
    pub fn first(&self, bucket: &Bucket) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.edge(bucket, "ASC")
    }

    /// Entry with the largest key.
    pub fn last(&self, bucket: &Bucket) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.edge(bucket, "DESC")
    }

    fn edge(&self, bucket: &Bucket, order: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let sql = format!(
            "SELECT key, value FROM entries WHERE bucket_id = ?1 ORDER BY key {order} LIMIT 1"
        );
        Ok(self
            .tx
            .prepare_cached(&sql)?
            .query_row(params![bucket.id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?)
    }

    pub fn count(&self, bucket: &Bucket) -> Result<u64> {
        let count: i64 = self
            .tx
            .prepare_cached("SELECT COUNT(*) FROM entries WHERE bucket_id = ?1")?
            .query_row(params![bucket.id], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp(dir: &Path) -> QuoteStore {
        QuoteStore::open(&StoreOptions::read_write(dir.join("store.db"))).unwrap()
    }

    #[test]
    fn validates_file_modes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        assert!(StoreOptions::read_write(&path).validate().is_ok());
        assert!(StoreOptions::read_only(&path).validate().is_ok());

        let mut options = StoreOptions::read_write(&path);
        options.file_mode = 0o644;
        assert!(matches!(
            QuoteStore::open(&options),
            Err(QuoteStoreError::InvalidFileMode { mode: 0o644, .. })
        ));
        options.file_mode = 0o400;
        assert!(options.validate().is_err());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn applies_file_mode_on_create() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let store = QuoteStore::open(&StoreOptions::read_write(&path)).unwrap();
        store.close().unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, READ_WRITE_FILE_MODE);
    }

    #[test]
    fn read_only_open_requires_existing_file() {
        let dir = tempdir().unwrap();
        let result = QuoteStore::open(&StoreOptions::read_only(dir.path().join("missing.db")));
        assert!(matches!(result, Err(QuoteStoreError::Sqlite(_))));
    }

    #[test]
    fn nested_buckets_are_get_or_create() {
        let dir = tempdir().unwrap();
        let store = open_temp(dir.path());

        let (top, child) = store
            .update(|txn| {
                let top = txn.create_bucket_if_not_exists(None, "QQQ")?;
                let child = txn.create_bucket_if_not_exists(Some(&top), "askPrice")?;
                Ok((top, child))
            })
            .unwrap();
        let (top_again, child_again, other) = store
            .update(|txn| {
                let top = txn.create_bucket_if_not_exists(None, "QQQ")?;
                let child = txn.create_bucket_if_not_exists(Some(&top), "askPrice")?;
                let other = txn.create_bucket_if_not_exists(None, "askPrice")?;
                Ok((top, child, other))
            })
            .unwrap();

        assert_eq!(top, top_again);
        assert_eq!(child, child_again);
        assert_ne!(child.id(), other.id());
        assert_eq!(child.name(), "askPrice");

        let missing = store.view(|txn| txn.bucket(Some(&top), "bidPrice")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn put_overwrites_and_scan_is_ordered() {
        let dir = tempdir().unwrap();
        let store = open_temp(dir.path());

        let bucket = store
            .update(|txn| {
                let bucket = txn.create_bucket_if_not_exists(None, "b")?;
                for key in [3u8, 1, 2, 0xff, 0x10] {
                    txn.put(&bucket, &[key], &[key])?;
                }
                txn.put(&bucket, &[2], b"two")?;
                Ok(bucket)
            })
            .unwrap();

        store
            .view(|txn| {
                assert_eq!(txn.get(&bucket, &[2])?, Some(b"two".to_vec()));
                assert_eq!(txn.get(&bucket, &[9])?, None);
                assert_eq!(txn.count(&bucket)?, 5);

                let all = txn.scan(&bucket, Bound::Unbounded, Bound::Unbounded)?;
                let keys: Vec<u8> = all.iter().map(|(k, _)| k[0]).collect();
                assert_eq!(keys, vec![1, 2, 3, 0x10, 0xff]);

                let window =
                    txn.scan(&bucket, Bound::Excluded(&[1][..]), Bound::Included(&[0x10][..]))?;
                let keys: Vec<u8> = window.iter().map(|(k, _)| k[0]).collect();
                assert_eq!(keys, vec![2, 3, 0x10]);

                let head = txn.scan_limit(&bucket, Bound::Included(&[2][..]), Bound::Unbounded, 2)?;
                let keys: Vec<u8> = head.iter().map(|(k, _)| k[0]).collect();
                assert_eq!(keys, vec![2, 3]);
                assert!(txn.scan_limit(&bucket, Bound::Unbounded, Bound::Unbounded, 0)?.is_empty());

                assert_eq!(txn.first(&bucket)?.map(|(k, _)| k), Some(vec![1]));
                assert_eq!(txn.last(&bucket)?.map(|(k, _)| k), Some(vec![0xff]));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_update_rolls_back() {
        let dir = tempdir().unwrap();
        let store = open_temp(dir.path());
        let bucket = store
            .update(|txn| txn.create_bucket_if_not_exists(None, "b"))
            .unwrap();

        let result: Result<()> = store.update(|txn| {
            txn.put(&bucket, b"k1", b"v1")?;
            txn.create_bucket_if_not_exists(None, "")?;
            Ok(())
        });
        assert!(matches!(result, Err(QuoteStoreError::InvalidNamespace(_))));

        let count = store.view(|txn| txn.count(&bucket)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn read_only_store_rejects_writes_and_sees_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = QuoteStore::open(&StoreOptions::read_write(&path)).unwrap();
        store
            .update(|txn| {
                let bucket = txn.create_bucket_if_not_exists(None, "b")?;
                txn.put(&bucket, b"k", b"v")
            })
            .unwrap();
        store.close().unwrap();

        let store = QuoteStore::open(&StoreOptions::read_only(&path)).unwrap();
        assert!(store.is_read_only());
        let value = store
            .view(|txn| {
                let bucket = txn.bucket(None, "b")?.expect("bucket exists");
                txn.get(&bucket, b"k")
            })
            .unwrap();
        assert_eq!(value, Some(b"v".to_vec()));

        let result = store.update(|txn| txn.create_bucket_if_not_exists(None, "c"));
        assert!(matches!(result, Err(QuoteStoreError::ReadOnly(_))));
        let result = store.view(|txn| txn.create_bucket_if_not_exists(None, "c"));
        assert!(matches!(result, Err(QuoteStoreError::ReadOnly(_))));
    }
}
