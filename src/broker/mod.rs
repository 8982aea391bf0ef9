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

//! Broker client seam.
//!
//! The pipeline only talks to these traits. [`AmqpConnector`] drives a real
//! AMQP 0-9-1 broker; [`MemoryBroker`] implements the same routing rules in
//! process and is what the tests run against.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryMessage};
pub use routing::topic_matches;
pub use topology::{
    BindingSpec, DeadLetter, ExchangeKind, ExchangeSpec, QueueSpec, Topology, TopologyError,
};

mod amqp;
mod memory;
mod routing;
mod topology;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// broker unreachable, or an established connection went away
    #[error("broker connection error: {0}")]
    Connection(String),

    /// a declaration clashed with an existing entity of the same name
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("broker channel error: {0}")]
    Channel(String),
}

impl BrokerError {
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Opens a fresh connection and a channel on it.
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerChannel>>;
}

/// One channel on one connection. All declarations are idempotent when the
/// existing entity matches.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> BrokerResult<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> BrokerResult<()>;

    async fn bind_queue(&self, binding: &BindingSpec) -> BrokerResult<()>;

    /// Caps the number of unacknowledged deliveries in flight.
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> BrokerResult<Box<dyn DeliveryStream>>;

    async fn close(&self);
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// `None` once the consumer is cancelled or the connection is gone.
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>>;
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    async fn reject(&self, requeue: bool) -> BrokerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// processed; the broker may forget the message
    Ack,
    /// negative-acknowledge without requeue, so the queue's dead-letter
    /// arguments route it to quarantine
    DeadLetter,
}

impl fmt::Display for AckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckDecision::Ack => f.write_str("ack"),
            AckDecision::DeadLetter => f.write_str("dead-letter"),
        }
    }
}

/// A message handed out by the broker and not yet settled.
///
/// `settle` takes the delivery by value, so it can be acknowledged at most
/// once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Bytes,
    pub message_id: Option<String>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: String,
        payload: Bytes,
        message_id: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Delivery {
            delivery_tag,
            routing_key,
            payload,
            message_id,
            redelivered,
            acker,
        }
    }

    pub async fn settle(self, decision: AckDecision) -> BrokerResult<()> {
        match decision {
            AckDecision::Ack => self.acker.ack().await,
            AckDecision::DeadLetter => self.acker.reject(false).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
