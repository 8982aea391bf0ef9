pub mod broker;
pub mod ingest;
pub mod log_store;
pub mod model;
pub mod service;
pub mod usecase;

pub use log_store::{LogFilter, LogStore, MemoryLogStore, QueryLimit, RocksLogStore, StorageError};
pub use model::LogRecord;
pub use service::{
    setup_local_tracing, setup_tracing, App, AppConfig, AppError, AppResult, BrokerConfig,
    Shutdown,
};
