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

use tracing::{debug, error, info};

use super::{BrokerChannel, BrokerError};
use crate::service::BrokerConfig;

/// Only topic exchanges are declared; routing keys are `logs.<service>.<level>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable_topic(name: impl Into<String>) -> Self {
        ExchangeSpec {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Where rejected messages of a queue are re-published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub pattern: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// same name, incompatible arguments: configuration and broker have drifted
    #[error("{entity} conflicts with the deployed topology: {source}")]
    Conflict {
        entity: String,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Broker(BrokerError),
}

impl TopologyError {
    fn classify(entity: String, err: BrokerError) -> Self {
        match err {
            BrokerError::PreconditionFailed(_) => TopologyError::Conflict { entity, source: err },
            other => TopologyError::Broker(other),
        }
    }
}

/// The exchange / queue / dead-letter graph the pipeline consumes from.
///
/// ```text
/// logs_exchange --logs.*.*--> logs_queue --nack--> logs_exchange_dlx --dlq.logs.#--> logs_queue_dlx
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub dlx_exchange: ExchangeSpec,
    pub dlx_queue: QueueSpec,
    pub dlx_binding: BindingSpec,
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub binding: BindingSpec,
}

impl Topology {
    pub fn from_config(config: &BrokerConfig) -> Self {
        let dlx_exchange = ExchangeSpec::durable_topic(&config.dlx_exchange);
        let dlx_queue = QueueSpec {
            name: config.dlx_queue.clone(),
            durable: true,
            dead_letter: None,
        };
        let dlx_binding = BindingSpec {
            exchange: config.dlx_exchange.clone(),
            queue: config.dlx_queue.clone(),
            pattern: format!("{}.#", config.dlx_routing_key),
        };
        let exchange = ExchangeSpec::durable_topic(&config.exchange);
        let queue = QueueSpec {
            name: config.queue.clone(),
            durable: true,
            dead_letter: Some(DeadLetter {
                exchange: config.dlx_exchange.clone(),
                routing_key: config.dlx_routing_key.clone(),
            }),
        };
        let binding = BindingSpec {
            exchange: config.exchange.clone(),
            queue: config.queue.clone(),
            pattern: config.binding_pattern.clone(),
        };
        Topology {
            dlx_exchange,
            dlx_queue,
            dlx_binding,
            exchange,
            queue,
            binding,
        }
    }

    pub fn main_queue(&self) -> &str {
        &self.queue.name
    }

    /// Declares the dead-letter side first so the main queue never points at a
    /// missing exchange. Safe to call on every reconnect.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), TopologyError> {
        Self::exchange(channel, &self.dlx_exchange).await?;
        Self::queue(channel, &self.dlx_queue).await?;
        Self::bind(channel, &self.dlx_binding).await?;
        Self::exchange(channel, &self.exchange).await?;
        Self::queue(channel, &self.queue).await?;
        Self::bind(channel, &self.binding).await?;
        info!(
            exchange = %self.exchange.name,
            queue = %self.queue.name,
            dlx_queue = %self.dlx_queue.name,
            "topology declared"
        );
        Ok(())
    }

    async fn exchange(channel: &dyn BrokerChannel, spec: &ExchangeSpec) -> Result<(), TopologyError> {
        debug!(exchange = %spec.name, "declaring exchange");
        channel
            .declare_exchange(spec)
            .await
            .map_err(|e| Self::report(format!("exchange {}", spec.name), e))
    }

    async fn queue(channel: &dyn BrokerChannel, spec: &QueueSpec) -> Result<(), TopologyError> {
        debug!(queue = %spec.name, "declaring queue");
        channel
            .declare_queue(spec)
            .await
            .map_err(|e| Self::report(format!("queue {}", spec.name), e))
    }

    async fn bind(channel: &dyn BrokerChannel, spec: &BindingSpec) -> Result<(), TopologyError> {
        debug!(exchange = %spec.exchange, queue = %spec.queue, pattern = %spec.pattern, "binding queue");
        channel.bind_queue(spec).await.map_err(|e| {
            Self::report(
                format!("binding {} -> {} ({})", spec.exchange, spec.queue, spec.pattern),
                e,
            )
        })
    }

    fn report(entity: String, err: BrokerError) -> TopologyError {
        let err = TopologyError::classify(entity, err);
        if let TopologyError::Conflict { .. } = &err {
            error!(cause = %err, "topology declaration conflict");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnector, MemoryBroker};

    fn topology() -> Topology {
        Topology::from_config(&BrokerConfig::default())
    }

    #[test]
    fn default_topology_matches_the_deployment_names() {
        let topology = topology();
        assert_eq!(topology.exchange, ExchangeSpec::durable_topic("logs_exchange"));
        assert_eq!(topology.main_queue(), "logs_queue");
        assert_eq!(topology.binding.pattern, "logs.*.*");
        assert_eq!(topology.dlx_exchange.name, "logs_exchange_dlx");
        assert_eq!(topology.dlx_queue.name, "logs_queue_dlx");
        assert_eq!(topology.dlx_binding.pattern, "dlq.logs.#");
        assert_eq!(
            topology.queue.dead_letter,
            Some(DeadLetter {
                exchange: "logs_exchange_dlx".into(),
                routing_key: "dlq.logs".into(),
            })
        );
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        topology().declare(channel.as_ref()).await.unwrap();
        topology().declare(channel.as_ref()).await.unwrap();

        let channel = broker.connect().await.unwrap();
        topology().declare(channel.as_ref()).await.unwrap();
        assert_eq!(broker.binding_count(), 2);
    }

    #[tokio::test]
    async fn conflicting_queue_is_fatal() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        // an older deployment declared the main queue without dead-lettering
        channel
            .declare_queue(&QueueSpec {
                name: "logs_queue".into(),
                durable: true,
                dead_letter: None,
            })
            .await
            .unwrap();

        let err = topology().declare(channel.as_ref()).await.unwrap_err();
        match err {
            TopologyError::Conflict { entity, .. } => assert_eq!(entity, "queue logs_queue"),
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lost_connection_is_not_a_conflict() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        broker.drop_connections();
        let err = topology().declare(channel.as_ref()).await.unwrap_err();
        assert!(matches!(err, TopologyError::Broker(BrokerError::Connection(_))));
    }
}
