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

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Details = Map<String, Value>;

/// A validated log event, as persisted and as returned by queries.
///
/// Records are immutable once built: the store never updates one in place.
/// `timestamp_processed` is the time the pipeline handled the event, not the
/// time the producer emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub service: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Details>,
    pub timestamp_processed: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// the body decoded, but to something other than an object
    NotAnObject,
    Missing,
    WrongType,
    Empty,
    Malformed,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::NotAnObject => "not an object",
            ViolationKind::Missing => "missing",
            ViolationKind::WrongType => "wrong type",
            ViolationKind::Empty => "empty",
            ViolationKind::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub kind: ViolationKind,
}

/// Every field-level problem found in one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaViolations(Vec<Violation>);

impl SchemaViolations {
    fn push(&mut self, field: &'static str, kind: ViolationKind) {
        self.0.push(Violation { field, kind });
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }
    pub fn contains(&self, field: &str, kind: ViolationKind) -> bool {
        self.0.iter().any(|v| v.field == field && v.kind == kind)
    }
}

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", violation.field, violation.kind)?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaViolations {}

/// Processing time in RFC 3339 with microseconds, always UTC (`...Z`).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339, or a naive ISO-8601 date-time which is taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl LogRecord {
    /// Builds a record from a decoded payload, generating `id` and
    /// `timestamp_processed` when the payload does not carry them.
    pub fn from_raw(raw: Value) -> Result<LogRecord, SchemaViolations> {
        Self::from_raw_with_identity(raw, None)
    }

    /// Like [`LogRecord::from_raw`], but a payload without `id` takes
    /// `fallback_id` (the broker message id) before a fresh UUID is minted.
    /// Redeliveries of the same message then map to the same record.
    pub fn from_raw_with_identity(
        raw: Value,
        fallback_id: Option<&str>,
    ) -> Result<LogRecord, SchemaViolations> {
        let mut violations = SchemaViolations::default();
        let Value::Object(mut fields) = raw else {
            violations.push("body", ViolationKind::NotAnObject);
            return Err(violations);
        };

        let service = required_text(&mut fields, "service", &mut violations);
        let level = required_text(&mut fields, "level", &mut violations);
        let message = required_text(&mut fields, "message", &mut violations);

        let details = match fields.remove("details") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                violations.push("details", ViolationKind::WrongType);
                None
            }
        };

        // `_id` is the document-store spelling some producers still send
        let id = optional_text(&mut fields, "id", &mut violations)
            .or_else(|| optional_text(&mut fields, "_id", &mut violations));
        let id = match id {
            Some(id) if id.trim().is_empty() => {
                violations.push("id", ViolationKind::Empty);
                None
            }
            other => other,
        };

        let timestamp_processed =
            match optional_text(&mut fields, "timestamp_processed", &mut violations) {
                Some(ts) if parse_timestamp(&ts).is_none() => {
                    violations.push("timestamp_processed", ViolationKind::Malformed);
                    None
                }
                other => other,
            };

        match (service, level, message) {
            (Some(service), Some(level), Some(message)) if violations.is_empty() => {
                Ok(LogRecord {
                    id: id
                        .or_else(|| fallback_id.filter(|f| !f.is_empty()).map(str::to_string))
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    service,
                    level,
                    message,
                    details,
                    timestamp_processed: timestamp_processed.unwrap_or_else(now_timestamp),
                })
            }
            _ => Err(violations),
        }
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp_processed)
    }
}

fn required_text(
    fields: &mut Map<String, Value>,
    field: &'static str,
    violations: &mut SchemaViolations,
) -> Option<String> {
    match fields.remove(field) {
        None | Some(Value::Null) => {
            violations.push(field, ViolationKind::Missing);
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            violations.push(field, ViolationKind::Empty);
            None
        }
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            violations.push(field, ViolationKind::WrongType);
            None
        }
    }
}

fn optional_text(
    fields: &mut Map<String, Value>,
    field: &'static str,
    violations: &mut SchemaViolations,
) -> Option<String> {
    match fields.remove(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            violations.push(field, ViolationKind::WrongType);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[test]
    fn minimal_payload_gets_generated_id_and_timestamp() {
        let record = LogRecord::from_raw(json!({
            "service": "users_service",
            "level": "INFO",
            "message": "created"
        }))
        .unwrap();

        assert!(!record.id.is_empty());
        assert!(uuid::Uuid::parse_str(&record.id).is_ok());
        assert_eq!(record.service, "users_service");
        assert_eq!(record.details, None);
        assert!(record.processed_at().is_some());
        assert!(record.timestamp_processed.ends_with('Z'));
    }

    #[test]
    fn supplied_id_and_timestamp_are_kept_verbatim() {
        let record = LogRecord::from_raw(json!({
            "id": "a1b2",
            "service": "payments_service",
            "level": "ERROR",
            "message": "payment failed",
            "details": {"order_id": "XYZ-789", "error_code": 5001},
            "timestamp_processed": "2025-10-15T10:00:00.000"
        }))
        .unwrap();

        assert_eq!(record.id, "a1b2");
        assert_eq!(record.timestamp_processed, "2025-10-15T10:00:00.000");
        assert_eq!(record.details.unwrap()["error_code"], json!(5001));
    }

    #[test]
    fn fallback_id_is_used_only_without_payload_id() {
        let payload = json!({"service": "s", "level": "l", "message": "m"});
        let record = LogRecord::from_raw_with_identity(payload, Some("msg-7")).unwrap();
        assert_eq!(record.id, "msg-7");

        let payload = json!({"id": "own", "service": "s", "level": "l", "message": "m"});
        let record = LogRecord::from_raw_with_identity(payload, Some("msg-7")).unwrap();
        assert_eq!(record.id, "own");
    }

    #[test]
    fn underscore_id_is_accepted_as_the_record_id() {
        let payload = json!({"_id": "doc-1", "service": "s", "level": "l", "message": "m"});
        let record = LogRecord::from_raw_with_identity(payload, Some("msg-7")).unwrap();
        assert_eq!(record.id, "doc-1");

        // `id` wins when both are present
        let payload = json!({"id": "own", "_id": "doc-1", "service": "s", "level": "l", "message": "m"});
        let record = LogRecord::from_raw(payload).unwrap();
        assert_eq!(record.id, "own");

        let payload = json!({"_id": 42, "service": "s", "level": "l", "message": "m"});
        let violations = LogRecord::from_raw(payload).unwrap_err();
        assert!(violations.contains("_id", ViolationKind::WrongType));
    }

    #[rstest]
    #[case(json!({"level": "INFO", "message": "m"}), "service", ViolationKind::Missing)]
    #[case(json!({"service": "", "level": "INFO", "message": "m"}), "service", ViolationKind::Empty)]
    #[case(json!({"service": "s", "level": "  ", "message": "m"}), "level", ViolationKind::Empty)]
    #[case(json!({"service": "s", "level": 3, "message": "m"}), "level", ViolationKind::WrongType)]
    #[case(json!({"service": "s", "level": "INFO", "message": null}), "message", ViolationKind::Missing)]
    #[case(json!({"service": "s", "level": "INFO", "message": "m", "details": [1]}), "details", ViolationKind::WrongType)]
    #[case(json!({"service": "s", "level": "INFO", "message": "m", "id": ""}), "id", ViolationKind::Empty)]
    #[case(json!({"service": "s", "level": "INFO", "message": "m", "timestamp_processed": "yesterday"}), "timestamp_processed", ViolationKind::Malformed)]
    #[case(json!("just a string"), "body", ViolationKind::NotAnObject)]
    #[case(json!([1, 2, 3]), "body", ViolationKind::NotAnObject)]
    fn invalid_payloads_report_the_violation(
        #[case] payload: Value,
        #[case] field: &str,
        #[case] kind: ViolationKind,
    ) {
        let violations = LogRecord::from_raw(payload).unwrap_err();
        assert!(
            violations.contains(field, kind),
            "expected {field}: {kind}, got {violations}"
        );
    }

    #[test]
    fn all_violations_are_collected() {
        let violations = LogRecord::from_raw(json!({"details": "x"})).unwrap_err();
        assert_eq!(violations.len(), 4);
        assert!(violations.contains("service", ViolationKind::Missing));
        assert!(violations.contains("level", ViolationKind::Missing));
        assert!(violations.contains("message", ViolationKind::Missing));
        assert!(violations.contains("details", ViolationKind::WrongType));
    }

    #[test]
    fn persisted_shape_has_null_details() {
        let record = LogRecord::from_raw(json!({"service": "s", "level": "l", "message": "m"}))
            .unwrap();
        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 6);
        assert_eq!(object["details"], Value::Null);
        let back: LogRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[rstest]
    #[case("2025-10-15T10:00:00Z")]
    #[case("2025-10-15T10:00:00.123456+02:00")]
    #[case("2025-10-15T10:00:00.123456")]
    #[case("2025-10-15T10:00:00")]
    fn iso_timestamps_parse(#[case] input: &str) {
        assert!(parse_timestamp(input).is_some());
    }
}
