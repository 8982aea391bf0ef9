pub use log_record::{
    now_timestamp, parse_timestamp, Details, LogRecord, SchemaViolations, Violation,
    ViolationKind,
};

mod log_record;
