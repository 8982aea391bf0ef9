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

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, trace};

use super::config::{AppConfig, StorageConfig, StorageKind};
use super::server::{QueryContext, QueryServer};
use super::{AppError, AppResult, Shutdown};
use crate::broker::{AmqpConnector, BrokerConnector, Topology};
use crate::ingest::{ConnectionSupervisor, MessageHandler, RetryPolicy};
use crate::log_store::{LogStore, MemoryLogStore, RocksLogStore};
use crate::usecase::{GetLogs, SaveLog};

/// Opens the configured store. Both the ingestion side and the query side
/// share the returned handle.
pub fn open_store(config: &StorageConfig) -> AppResult<Arc<dyn LogStore>> {
    match config.kind {
        StorageKind::Rocksdb => {
            let store = RocksLogStore::open(&config.path)?;
            info!(path = %config.path, "opened rocksdb log store");
            Ok(Arc::new(store))
        }
        StorageKind::Memory => {
            info!("using in-memory log store, records are lost on exit");
            Ok(Arc::new(MemoryLogStore::new()))
        }
    }
}

/// The whole service: one ingestion supervisor and one query server over a
/// shared store.
pub struct App {
    config: AppConfig,
    connector: Arc<dyn BrokerConnector>,
    store: Option<Arc<dyn LogStore>>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let connector = Arc::new(AmqpConnector::new(config.broker.uri.clone()));
        App {
            config,
            connector,
            store: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Uses `store` instead of opening the configured one.
    pub fn with_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs until `shutdown_signal` resolves, the query server fails, or the
    /// supervisor gives up on a topology conflict.
    pub async fn run<F>(self, shutdown_signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        self.run_with(shutdown_signal, |_| {}).await
    }

    /// Like [`App::run`], reporting the bound query address once listening.
    pub async fn run_with<F, R>(self, shutdown_signal: F, on_listening: R) -> AppResult<()>
    where
        F: Future<Output = ()>,
        R: FnOnce(SocketAddr),
    {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.config.storage)?,
        };

        // ingestion side
        let save_log = Arc::new(SaveLog::new(
            store.clone(),
            self.config.storage.persist_timeout(),
        ));
        let broker_conf = &self.config.broker;
        let supervisor = ConnectionSupervisor::new(
            self.connector.clone(),
            Topology::from_config(broker_conf),
            MessageHandler::new(save_log),
            RetryPolicy::from(broker_conf),
        )
        .with_consumer_tag(broker_conf.consumer_tag.clone())
        .with_prefetch_count(broker_conf.prefetch_count);
        let pipeline_state = supervisor.subscribe_state();

        // query side
        let context = QueryContext::new(
            GetLogs::new(store),
            self.config.http.allowed_hosts.clone(),
            pipeline_state,
        );
        let server = QueryServer::bind(
            &self.config.http,
            context,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )
        .await?;
        on_listening(server.local_addr()?);

        let mut supervisor_task = {
            let shutdown = Shutdown::new(notify_shutdown.subscribe());
            tokio::spawn(async move {
                let res = supervisor.run(shutdown).await;
                drop(shutdown_complete_tx);
                res
            })
        };

        let mut outcome = Ok(());
        let mut supervisor_done = false;
        tokio::select! {
            res = server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "query server failed");
                    outcome = Err(err);
                }
            }
            res = &mut supervisor_task => {
                supervisor_done = true;
                outcome = match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(fatal)) => Err(AppError::from(fatal)),
                    Err(join_err) => Err(join_err.into()),
                };
            }
            _ = shutdown_signal => {
                info!("get shutdown signal");
            }
        }

        // a send error only means every receiver is already gone
        let _ = notify_shutdown.send(());
        if !supervisor_done {
            match supervisor_task.await {
                Ok(Ok(())) => {}
                Ok(Err(fatal)) => outcome = outcome.and(Err(AppError::from(fatal))),
                Err(join_err) => outcome = outcome.and(Err(join_err.into())),
            }
        }
        trace!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        info!("log service shutdown complete");
        outcome
    }
}
