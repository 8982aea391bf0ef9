pub use app::{open_store, App};
pub use app_error::{AppError, AppResult};
pub use config::{
    AppConfig, BrokerConfig, HttpConfig, StorageConfig, StorageKind, TracingConfig, ENV_BROKER_URI,
    ENV_DB_PATH, ENV_PREFIX,
};
pub use server::{handle_request, LogsQuery, QueryContext, QueryServer};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app;
mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
