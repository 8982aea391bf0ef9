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

use std::time::Duration;

use async_trait::async_trait;

use crate::model::LogRecord;

pub use memory_store::MemoryLogStore;
pub use rocks_store::RocksLogStore;

mod memory_store;
mod rocks_store;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("record {0} already stored")]
    DuplicateId(String),

    #[error("unorderable timestamp_processed: {0}")]
    InvalidTimestamp(String),

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage task failed: {0}")]
    TaskJoin(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(value: rocksdb::Error) -> Self {
        StorageError::Backend(value.into_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(value: tokio::task::JoinError) -> Self {
        StorageError::TaskJoin(value.to_string())
    }
}

/// Exact-match predicates, combined with AND. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub service: Option<String>,
    pub level: Option<String>,
}

impl LogFilter {
    pub fn new(service: Option<String>, level: Option<String>) -> Self {
        LogFilter { service, level }
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.service.as_ref().map_or(true, |s| *s == record.service)
            && self.level.as_ref().map_or(true, |l| *l == record.level)
    }
}

/// Result size bound, always within `[MIN, MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueryLimit(usize);

impl QueryLimit {
    pub const MIN: usize = 1;
    pub const MAX: usize = 1000;
    pub const DEFAULT: QueryLimit = QueryLimit(100);

    /// `None` when `n` is out of range.
    pub fn new(n: i64) -> Option<QueryLimit> {
        usize::try_from(n)
            .ok()
            .filter(|n| (Self::MIN..=Self::MAX).contains(n))
            .map(QueryLimit)
    }

    pub fn clamped(n: i64) -> QueryLimit {
        QueryLimit(n.clamp(Self::MIN as i64, Self::MAX as i64) as usize)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for QueryLimit {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Durable home of every [`LogRecord`].
///
/// Implementations are shared by the ingestion pipeline and the query server
/// and must be safe to call from both at once.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persists exactly one record before returning. A record whose id is
    /// already present is rejected with [`StorageError::DuplicateId`].
    async fn save(&self, record: &LogRecord) -> StorageResult<()>;

    /// Matching records, most recently processed first, at most `limit` long.
    async fn find(&self, filter: &LogFilter, limit: QueryLimit) -> StorageResult<Vec<LogRecord>>;
}

/// Sort key for `timestamp_processed`, in microseconds since the epoch.
pub(crate) fn ordering_micros(record: &LogRecord) -> StorageResult<i64> {
    record
        .processed_at()
        .map(|ts| ts.timestamp_micros())
        .ok_or_else(|| StorageError::InvalidTimestamp(record.timestamp_processed.clone()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, Some(1))]
    #[case(100, Some(100))]
    #[case(1000, Some(1000))]
    #[case(0, None)]
    #[case(-5, None)]
    #[case(1001, None)]
    fn limit_accepts_only_the_valid_range(#[case] n: i64, #[case] expected: Option<usize>) {
        assert_eq!(QueryLimit::new(n).map(QueryLimit::get), expected);
    }

    #[test]
    fn limit_clamps_into_range() {
        assert_eq!(QueryLimit::clamped(0).get(), 1);
        assert_eq!(QueryLimit::clamped(5000).get(), 1000);
        assert_eq!(QueryLimit::clamped(42).get(), 42);
        assert_eq!(QueryLimit::default().get(), 100);
    }
}
