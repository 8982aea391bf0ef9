// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::{info, trace};

use super::{ordering_micros, LogFilter, LogStore, QueryLimit, StorageError, StorageResult};
use crate::model::LogRecord;

/// [`LogStore`] on a local RocksDB.
///
/// Two keys per record, written in one synced batch:
/// `rec:<id>` holds the index key and enforces id uniqueness, and
/// `ts:<ordered micros><id>` holds the record JSON. The time component is
/// encoded so a forward scan of `ts:` yields the newest record first.
#[derive(Clone)]
pub struct RocksLogStore {
    db: Arc<DB>,
    // serializes the read-check-write of `save`; readers never take it
    write_lock: Arc<Mutex<()>>,
    path: PathBuf,
}

impl RocksLogStore {
    const RECORD_PREFIX: &'static [u8] = b"rec:";
    const INDEX_PREFIX: &'static [u8] = b"ts:";

    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        info!(path = %path.as_ref().display(), "rocksdb log store opened");
        Ok(RocksLogStore {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_key(id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(Self::RECORD_PREFIX.len() + id.len());
        key.extend_from_slice(Self::RECORD_PREFIX);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn index_key(micros: i64, id: &str) -> Vec<u8> {
        // flipping the sign bit orders negatives before positives as unsigned,
        // the complement then turns ascending time into descending bytes
        let ordered = !((micros as u64) ^ (1 << 63));
        let mut key = Vec::with_capacity(Self::INDEX_PREFIX.len() + 8 + id.len());
        key.extend_from_slice(Self::INDEX_PREFIX);
        key.extend_from_slice(&ordered.to_be_bytes());
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn save_blocking(db: &DB, write_lock: &Mutex<()>, record: &LogRecord) -> StorageResult<()> {
        let micros = ordering_micros(record)?;
        let value = serde_json::to_vec(record)?;
        let record_key = Self::record_key(&record.id);
        let index_key = Self::index_key(micros, &record.id);

        let _guard = write_lock.lock();
        if db.get_pinned(&record_key)?.is_some() {
            return Err(StorageError::DuplicateId(record.id.clone()));
        }
        let mut batch = WriteBatch::default();
        batch.put(&record_key, &index_key);
        batch.put(&index_key, &value);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        db.write_opt(batch, &write_opts)?;
        trace!(record_id = %record.id, "record written");
        Ok(())
    }

    fn find_blocking(
        db: &DB,
        filter: &LogFilter,
        limit: QueryLimit,
    ) -> StorageResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mode = IteratorMode::From(Self::INDEX_PREFIX, Direction::Forward);
        for item in db.iterator(mode) {
            let (key, value) = item?;
            if !key.starts_with(Self::INDEX_PREFIX) {
                break;
            }
            let record: LogRecord = serde_json::from_slice(&value)?;
            if filter.matches(&record) {
                records.push(record);
                if records.len() >= limit.get() {
                    break;
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl LogStore for RocksLogStore {
    async fn save(&self, record: &LogRecord) -> StorageResult<()> {
        let db = self.db.clone();
        let write_lock = self.write_lock.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || Self::save_blocking(&db, &write_lock, &record)).await?
    }

    async fn find(&self, filter: &LogFilter, limit: QueryLimit) -> StorageResult<Vec<LogRecord>> {
        let db = self.db.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || Self::find_blocking(&db, &filter, limit)).await?
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;

    fn record(id: &str, service: &str, level: &str, second: i64) -> LogRecord {
        let ts = Utc.with_ymd_and_hms(2025, 10, 15, 10, 0, 0).unwrap() + Duration::seconds(second);
        LogRecord {
            id: id.to_string(),
            service: service.to_string(),
            level: level.to_string(),
            message: format!("message {id}"),
            details: None,
            timestamp_processed: ts.to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn empty_store_returns_empty_result() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        let found = store.find(&LogFilter::default(), QueryLimit::DEFAULT).await?;
        assert!(found.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn saved_record_round_trips_unchanged() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        let mut original = record("r-1", "payments_service", "ERROR", 0);
        original.details = Some(
            serde_json::json!({"order_id": "XYZ-789", "nested": {"n": [1, 2]}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        // a naive timestamp must come back exactly as it went in
        original.timestamp_processed = "2025-10-15T10:00:00.000".to_string();
        store.save(&original).await?;

        let filter = LogFilter::new(Some("payments_service".into()), Some("ERROR".into()));
        let found = store.find(&filter, QueryLimit::DEFAULT).await?;
        assert_eq!(found, vec![original]);
        Ok(())
    }

    #[tokio::test]
    async fn results_are_newest_first() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        for (id, second) in [("b", 20), ("a", 10), ("c", 30), ("old", -86_400 * 365 * 60)] {
            store.save(&record(id, "svc", "INFO", second)).await?;
        }
        let found = store.find(&LogFilter::default(), QueryLimit::DEFAULT).await?;
        let ids: Vec<_> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a", "old"]);
        Ok(())
    }

    #[tokio::test]
    async fn filters_are_exact_and_conjunctive() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        store.save(&record("1", "users", "INFO", 1)).await?;
        store.save(&record("2", "users", "ERROR", 2)).await?;
        store.save(&record("3", "payments", "ERROR", 3)).await?;
        store.save(&record("4", "users_v2", "INFO", 4)).await?;

        let users = LogFilter::new(Some("users".into()), None);
        let found = store.find(&users, QueryLimit::DEFAULT).await?;
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|r| r.service == "users"));
        assert!(found[0].processed_at() >= found[1].processed_at());

        let users_error = LogFilter::new(Some("users".into()), Some("ERROR".into()));
        let found = store.find(&users_error, QueryLimit::DEFAULT).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "2");

        let errors = LogFilter::new(None, Some("ERROR".into()));
        assert_eq!(store.find(&errors, QueryLimit::DEFAULT).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn limit_keeps_the_most_recent_records() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        for i in 0..150 {
            store.save(&record(&format!("r{i:03}"), "svc", "INFO", i)).await?;
        }
        let found = store.find(&LogFilter::default(), QueryLimit::DEFAULT).await?;
        assert_eq!(found.len(), 100);
        assert_eq!(found.first().unwrap().id, "r149");
        assert_eq!(found.last().unwrap().id, "r050");
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_and_original_kept() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        store.save(&record("same", "svc", "INFO", 1)).await?;
        let err = store.save(&record("same", "other", "WARN", 2)).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateId(id) if id == "same"));

        let found = store.find(&LogFilter::default(), QueryLimit::DEFAULT).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service, "svc");
        Ok(())
    }

    #[tokio::test]
    async fn unparsable_timestamp_is_a_storage_failure() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        let mut bad = record("x", "svc", "INFO", 0);
        bad.timestamp_processed = "not a time".to_string();
        let err = store.save(&bad).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTimestamp(_)));
        Ok(())
    }

    #[tokio::test]
    async fn records_survive_reopen() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksLogStore::open(dir.path())?;
            store.save(&record("durable", "svc", "INFO", 0)).await?;
        }
        let store = RocksLogStore::open(dir.path())?;
        let found = store.find(&LogFilter::default(), QueryLimit::DEFAULT).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "durable");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_and_readers() -> StorageResult<()> {
        let dir = TempDir::new().unwrap();
        let store = RocksLogStore::open(dir.path())?;
        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let id = format!("w{w}-{i}");
                    store.save(&record(&id, "svc", "INFO", w * 100 + i)).await?;
                    store.find(&LogFilter::default(), QueryLimit::new(10).unwrap()).await?;
                }
                Ok::<_, StorageError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap()?;
        }
        let found = store.find(&LogFilter::default(), QueryLimit::clamped(1000)).await?;
        assert_eq!(found.len(), 100);
        Ok(())
    }
}
