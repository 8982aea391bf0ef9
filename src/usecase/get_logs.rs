use std::sync::Arc;

use crate::log_store::{LogFilter, LogStore, QueryLimit, StorageResult};
use crate::model::LogRecord;

pub struct GetLogs {
    store: Arc<dyn LogStore>,
}

impl GetLogs {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        GetLogs { store }
    }

    pub async fn execute(
        &self,
        service: Option<String>,
        level: Option<String>,
        limit: QueryLimit,
    ) -> StorageResult<Vec<LogRecord>> {
        self.store
            .find(&LogFilter::new(service, level), limit)
            .await
    }
}
