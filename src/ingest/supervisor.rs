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
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::MessageHandler;
use crate::broker::{BrokerChannel, BrokerConnector, BrokerError, Topology, TopologyError};
use crate::service::{BrokerConfig, Shutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
    Consuming,
    /// the run loop has returned, either on shutdown or on a fatal error
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Connected => "connected",
            SupervisorState::Consuming => "consuming",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// wait after the broker was unreachable or the connection dropped
    pub connect_retry: Duration,
    /// wait after any other failure while consuming
    pub failure_retry: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            connect_retry: Duration::from_secs(5),
            failure_retry: Duration::from_secs(10),
        }
    }
}

impl From<&BrokerConfig> for RetryPolicy {
    fn from(config: &BrokerConfig) -> Self {
        RetryPolicy {
            connect_retry: config.connect_retry(),
            failure_retry: config.failure_retry(),
        }
    }
}

enum SessionEnd {
    Shutdown,
    ConnectionLost(BrokerError),
    Failed(BrokerError),
}

impl From<BrokerError> for SessionEnd {
    fn from(err: BrokerError) -> Self {
        if err.is_connection_loss() {
            SessionEnd::ConnectionLost(err)
        } else {
            SessionEnd::Failed(err)
        }
    }
}

/// Owns the broker connection and the consume loop.
///
/// ```text
/// DISCONNECTED -> CONNECTING -> CONNECTED -> CONSUMING
///       ^             |             |            |
///       +-------------+-------------+------------+   (any loss)
/// ```
///
/// Reconnection is unbounded. Only a shutdown signal or a topology conflict
/// makes [`ConnectionSupervisor::run`] return. Messages are handled one at a
/// time, in delivery order.
pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    handler: MessageHandler,
    retry: RetryPolicy,
    consumer_tag: String,
    prefetch_count: u16,
    state_tx: watch::Sender<SupervisorState>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: Topology,
        handler: MessageHandler,
        retry: RetryPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Disconnected);
        ConnectionSupervisor {
            connector,
            topology,
            handler,
            retry,
            consumer_tag: "loghub".to_string(),
            prefetch_count: 1,
            state_tx,
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count.max(1);
        self
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "supervisor state change");
        }
    }

    /// Returns `Ok` after a shutdown signal, or the conflict that made the
    /// declared topology unusable.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<(), TopologyError> {
        while !shutdown.is_shutdown() {
            self.set_state(SupervisorState::Connecting);
            info!("connecting to broker");
            let connected = tokio::select! {
                res = self.connector.connect() => res,
                _ = shutdown.recv() => break,
            };
            let channel = match connected {
                Ok(channel) => channel,
                Err(err) => {
                    error!(cause = %err, retry_in = ?self.retry.connect_retry,
                        "broker connection failed");
                    self.set_state(SupervisorState::Disconnected);
                    self.pause(self.retry.connect_retry, &mut shutdown).await;
                    continue;
                }
            };
            self.set_state(SupervisorState::Connected);

            let end = self.run_session(channel.as_ref(), &mut shutdown).await;
            channel.close().await;
            match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ConnectionLost(err)) => {
                    warn!(cause = %err, retry_in = ?self.retry.connect_retry,
                        monotonic_counter.broker_reconnects = 1u64,
                        "broker connection lost");
                    self.set_state(SupervisorState::Disconnected);
                    self.pause(self.retry.connect_retry, &mut shutdown).await;
                }
                Ok(SessionEnd::Failed(err)) => {
                    error!(cause = %err, retry_in = ?self.retry.failure_retry,
                        monotonic_counter.broker_reconnects = 1u64,
                        "consumer failed");
                    self.set_state(SupervisorState::Disconnected);
                    self.pause(self.retry.failure_retry, &mut shutdown).await;
                }
                Err(fatal) => {
                    error!(cause = %fatal, "giving up: broker topology does not match configuration");
                    self.set_state(SupervisorState::Stopped);
                    return Err(fatal);
                }
            }
        }
        self.set_state(SupervisorState::Stopped);
        info!("supervisor stopped");
        Ok(())
    }

    async fn run_session(
        &self,
        channel: &dyn BrokerChannel,
        shutdown: &mut Shutdown,
    ) -> Result<SessionEnd, TopologyError> {
        match self.topology.declare(channel).await {
            Ok(()) => {}
            Err(TopologyError::Broker(err)) => return Ok(err.into()),
            Err(conflict) => return Err(conflict),
        }
        if let Err(err) = channel.set_prefetch(self.prefetch_count).await {
            return Ok(err.into());
        }
        let mut deliveries = match channel
            .consume(self.topology.main_queue(), &self.consumer_tag)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => return Ok(err.into()),
        };
        self.set_state(SupervisorState::Consuming);
        info!(queue = %self.topology.main_queue(), "consuming, waiting for logs");

        loop {
            // only the wait is interruptible; a message already received is
            // always processed and settled
            let next = tokio::select! {
                next = deliveries.next_delivery() => next,
                _ = shutdown.recv() => return Ok(SessionEnd::Shutdown),
            };
            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return Ok(err.into()),
                None => {
                    return Ok(SessionEnd::ConnectionLost(BrokerError::Connection(
                        "delivery stream closed".to_string(),
                    )))
                }
            };
            if let Err(err) = self.handler.handle(delivery).await {
                return Ok(err.into());
            }
        }
    }

    async fn pause(&self, wait: Duration, shutdown: &mut Shutdown) {
        tokio::select! {
            _ = time::sleep(wait) => {}
            _ = shutdown.recv() => {}
        }
    }
}
