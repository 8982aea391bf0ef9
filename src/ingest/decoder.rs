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

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::broker::{AckDecision, BrokerResult, Delivery};
use crate::log_store::StorageError;
use crate::model::SchemaViolations;
use crate::usecase::{SaveLog, SaveOutcome};

/// Terminal classification of one delivered message.
#[derive(Debug)]
pub enum IngestOutcome {
    Stored { id: String },
    /// the record id was already persisted by an earlier delivery of the same
    /// message
    AlreadyStored { id: String },
    /// the body is not well-formed JSON
    Poison(String),
    InvalidSchema(SchemaViolations),
    StorageFailure(StorageError),
}

impl IngestOutcome {
    pub fn decision(&self) -> AckDecision {
        match self {
            IngestOutcome::Stored { .. } | IngestOutcome::AlreadyStored { .. } => AckDecision::Ack,
            IngestOutcome::Poison(_)
            | IngestOutcome::InvalidSchema(_)
            | IngestOutcome::StorageFailure(_) => AckDecision::DeadLetter,
        }
    }
}

impl fmt::Display for IngestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestOutcome::Stored { .. } => f.write_str("stored"),
            IngestOutcome::AlreadyStored { .. } => f.write_str("already_stored"),
            IngestOutcome::Poison(_) => f.write_str("poison_message"),
            IngestOutcome::InvalidSchema(_) => f.write_str("invalid_schema"),
            IngestOutcome::StorageFailure(_) => f.write_str("storage_failure"),
        }
    }
}

pub fn decode_payload(payload: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Decides, for every delivery, between acknowledging it and routing it to
/// the dead-letter queue, and sends exactly one of the two.
#[derive(Clone)]
pub struct MessageHandler {
    save_log: Arc<SaveLog>,
}

impl MessageHandler {
    pub fn new(save_log: Arc<SaveLog>) -> Self {
        MessageHandler { save_log }
    }

    /// Runs decode, validation and persistence without touching the broker.
    pub async fn classify(&self, payload: &[u8], message_id: Option<&str>) -> IngestOutcome {
        let raw = match decode_payload(payload) {
            Ok(raw) => raw,
            Err(err) => return IngestOutcome::Poison(err.to_string()),
        };
        match self.save_log.execute_with_identity(raw, message_id).await {
            SaveOutcome::Saved(record) => IngestOutcome::Stored { id: record.id },
            SaveOutcome::Invalid(violations) => IngestOutcome::InvalidSchema(violations),
            SaveOutcome::StorageFailed(StorageError::DuplicateId(id)) => {
                IngestOutcome::AlreadyStored { id }
            }
            SaveOutcome::StorageFailed(err) => IngestOutcome::StorageFailure(err),
        }
    }

    /// Classifies and settles one delivery. An `Err` means the settle itself
    /// failed, which only happens when the channel is gone; the broker then
    /// redelivers the message.
    pub async fn handle(&self, delivery: Delivery) -> BrokerResult<IngestOutcome> {
        let outcome = self
            .classify(&delivery.payload, delivery.message_id.as_deref())
            .await;
        let decision = outcome.decision();
        let routing_key = delivery.routing_key.clone();
        let delivery_tag = delivery.delivery_tag;

        match &outcome {
            IngestOutcome::Stored { id } => {
                info!(routing_key = %routing_key, record_id = %id, "log received and stored");
            }
            IngestOutcome::AlreadyStored { id } => {
                warn!(routing_key = %routing_key, record_id = %id, redelivered = delivery.redelivered,
                    "log already stored, acknowledging duplicate delivery");
            }
            IngestOutcome::Poison(cause) => {
                error!(routing_key = %routing_key, cause = %cause,
                    body = %String::from_utf8_lossy(&delivery.payload),
                    "message is not valid json, sending to dead-letter queue");
            }
            IngestOutcome::InvalidSchema(violations) => {
                error!(routing_key = %routing_key, violations = %violations,
                    "message failed validation, sending to dead-letter queue");
            }
            IngestOutcome::StorageFailure(err) => {
                error!(routing_key = %routing_key, cause = %err,
                    "failed to persist log, sending to dead-letter queue");
            }
        }

        delivery.settle(decision).await?;
        match decision {
            AckDecision::Ack => {
                info!(monotonic_counter.messages_acked = 1u64, outcome = %outcome, delivery_tag);
            }
            AckDecision::DeadLetter => {
                info!(monotonic_counter.messages_dead_lettered = 1u64, outcome = %outcome, delivery_tag);
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::log_store::{LogFilter, LogStore, MemoryLogStore, QueryLimit, StorageResult};
    use crate::model::LogRecord;

    struct BrokenStore;

    #[async_trait]
    impl LogStore for BrokenStore {
        async fn save(&self, _record: &LogRecord) -> StorageResult<()> {
            Err(StorageError::Backend("disk full".into()))
        }
        async fn find(&self, _: &LogFilter, _: QueryLimit) -> StorageResult<Vec<LogRecord>> {
            Ok(Vec::new())
        }
    }

    fn handler_with(store: Arc<dyn LogStore>) -> MessageHandler {
        MessageHandler::new(Arc::new(SaveLog::new(store, None)))
    }

    #[tokio::test]
    async fn valid_message_is_stored_and_acked() {
        let store = Arc::new(MemoryLogStore::new());
        let handler = handler_with(store.clone());
        let body = json!({"service": "users_service", "level": "INFO", "message": "created"});
        let outcome = handler
            .classify(body.to_string().as_bytes(), None)
            .await;
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));
        assert_eq!(outcome.decision(), AckDecision::Ack);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn non_json_is_poison() {
        let store = Arc::new(MemoryLogStore::new());
        let handler = handler_with(store.clone());
        let outcome = handler.classify(b"not json", None).await;
        assert!(matches!(outcome, IngestOutcome::Poison(_)));
        assert_eq!(outcome.decision(), AckDecision::DeadLetter);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_field_is_invalid_schema() {
        let store = Arc::new(MemoryLogStore::new());
        let handler = handler_with(store.clone());
        let outcome = handler
            .classify(br#"{"service": "s", "level": "INFO"}"#, None)
            .await;
        assert!(matches!(outcome, IngestOutcome::InvalidSchema(_)));
        assert_eq!(outcome.decision(), AckDecision::DeadLetter);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn json_scalar_is_invalid_schema_not_poison() {
        let handler = handler_with(Arc::new(MemoryLogStore::new()));
        let outcome = handler.classify(br#""not json""#, None).await;
        assert!(matches!(outcome, IngestOutcome::InvalidSchema(_)));
    }

    #[tokio::test]
    async fn storage_failure_is_dead_lettered() {
        let handler = handler_with(Arc::new(BrokenStore));
        let outcome = handler
            .classify(br#"{"service": "s", "level": "INFO", "message": "m"}"#, None)
            .await;
        assert!(matches!(
            outcome,
            IngestOutcome::StorageFailure(StorageError::Backend(_))
        ));
        assert_eq!(outcome.decision(), AckDecision::DeadLetter);
    }

    #[tokio::test]
    async fn redelivery_with_message_id_is_acked_once_stored() {
        let store = Arc::new(MemoryLogStore::new());
        let handler = handler_with(store.clone());
        let body = br#"{"service": "s", "level": "INFO", "message": "m"}"#;

        let first = handler.classify(body, Some("msg-1")).await;
        assert!(matches!(first, IngestOutcome::Stored { ref id } if id == "msg-1"));
        let second = handler.classify(body, Some("msg-1")).await;
        assert!(matches!(second, IngestOutcome::AlreadyStored { ref id } if id == "msg-1"));
        assert_eq!(second.decision(), AckDecision::Ack);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_with_underscore_id_is_acked_once_stored() {
        let store = Arc::new(MemoryLogStore::new());
        let handler = handler_with(store.clone());
        let body = br#"{"_id": "doc-9", "service": "s", "level": "INFO", "message": "m"}"#;

        let first = handler.classify(body, None).await;
        assert!(matches!(first, IngestOutcome::Stored { ref id } if id == "doc-9"));
        let second = handler.classify(body, None).await;
        assert!(matches!(second, IngestOutcome::AlreadyStored { ref id } if id == "doc-9"));
        assert_eq!(second.decision(), AckDecision::Ack);
        assert_eq!(store.len(), 1);
    }
}
