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

use crate::broker::{BrokerError, TopologyError};
use crate::log_store::StorageError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(String),

    /// pipeline errors
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// the deployed broker topology disagrees with the declared one; retrying cannot fix it
    #[error("fatal topology error: {0}")]
    FatalTopology(String),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl From<TopologyError> for AppError {
    fn from(value: TopologyError) -> Self {
        match value {
            TopologyError::Conflict { .. } => AppError::FatalTopology(value.to_string()),
            TopologyError::Broker(err) => AppError::Broker(err),
        }
    }
}
