pub use decoder::{decode_payload, IngestOutcome, MessageHandler};
pub use supervisor::{ConnectionSupervisor, RetryPolicy, SupervisorState};

mod decoder;
mod supervisor;
