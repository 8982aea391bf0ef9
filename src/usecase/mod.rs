pub use get_logs::GetLogs;
pub use save_log::{SaveLog, SaveOutcome};

mod get_logs;
mod save_log;
