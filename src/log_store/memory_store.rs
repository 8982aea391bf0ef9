use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ordering_micros, LogFilter, LogStore, QueryLimit, StorageError, StorageResult};
use crate::model::LogRecord;

#[derive(Default)]
struct Records {
    by_time: BTreeMap<(Reverse<i64>, String), LogRecord>,
    ids: HashSet<String>,
}

/// Process-local [`LogStore`]; contents are lost on exit.
#[derive(Default)]
pub struct MemoryLogStore {
    records: RwLock<Records>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn save(&self, record: &LogRecord) -> StorageResult<()> {
        let micros = ordering_micros(record)?;
        let mut records = self.records.write();
        if !records.ids.insert(record.id.clone()) {
            return Err(StorageError::DuplicateId(record.id.clone()));
        }
        records
            .by_time
            .insert((Reverse(micros), record.id.clone()), record.clone());
        Ok(())
    }

    async fn find(&self, filter: &LogFilter, limit: QueryLimit) -> StorageResult<Vec<LogRecord>> {
        let records = self.records.read();
        Ok(records
            .by_time
            .values()
            .filter(|r| filter.matches(r))
            .take(limit.get())
            .cloned()
            .collect())
    }
}
