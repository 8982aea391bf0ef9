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

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::log_store::{LogStore, StorageError};
use crate::model::{LogRecord, SchemaViolations};

/// What happened to one raw payload handed to [`SaveLog`].
///
/// Failures are values, not logs: the caller decides how to react to each.
#[derive(Debug)]
pub enum SaveOutcome {
    Saved(LogRecord),
    Invalid(SchemaViolations),
    StorageFailed(StorageError),
}

pub struct SaveLog {
    store: Arc<dyn LogStore>,
    persist_timeout: Option<Duration>,
}

impl SaveLog {
    pub fn new(store: Arc<dyn LogStore>, persist_timeout: Option<Duration>) -> Self {
        SaveLog {
            store,
            persist_timeout,
        }
    }

    pub async fn execute(&self, raw: Value) -> SaveOutcome {
        self.execute_with_identity(raw, None).await
    }

    /// `message_id` is the broker-assigned identity, used as the record id
    /// when the payload carries none.
    pub async fn execute_with_identity(&self, raw: Value, message_id: Option<&str>) -> SaveOutcome {
        let record = match LogRecord::from_raw_with_identity(raw, message_id) {
            Ok(record) => record,
            Err(violations) => return SaveOutcome::Invalid(violations),
        };

        let saved = match self.persist_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.store.save(&record)).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout(limit)),
            },
            None => self.store.save(&record).await,
        };

        match saved {
            Ok(()) => {
                debug!(record_id = %record.id, service = %record.service, "log saved");
                SaveOutcome::Saved(record)
            }
            Err(err) => SaveOutcome::StorageFailed(err),
        }
    }
}
