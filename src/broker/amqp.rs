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

use async_trait::async_trait;
use bytes::Bytes;
use lapin::acker::Acker as LapinAcker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{
    Acker, BindingSpec, BrokerChannel, BrokerConnector, BrokerError, BrokerResult, Delivery,
    DeliveryStream, ExchangeKind, ExchangeSpec, QueueSpec,
};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
const REPLY_SUCCESS: u16 = 200;

/// Connects to an AMQP 0-9-1 broker such as RabbitMQ.
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        AmqpConnector { uri: uri.into() }
    }
}

/// Sorts lapin errors into the three outcomes the supervisor cares about.
///
/// Hard protocol errors close the whole connection (CONNECTION_FORCED on a
/// broker restart, for one), so they count as a connection loss just like a
/// channel that was closed underneath the consumer.
fn classify(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp_error) => match amqp_error.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(err.to_string())
            }
            AMQPErrorKind::Hard(_) => BrokerError::Connection(err.to_string()),
            AMQPErrorKind::Soft(_) => BrokerError::Channel(err.to_string()),
        },
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::MissingHeartbeatError => BrokerError::Connection(err.to_string()),
        _ => BrokerError::Channel(err.to_string()),
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(classify)?;
        let channel = connection.create_channel().await.map_err(classify)?;
        info!(channel_id = channel.id(), "connected to amqp broker");
        Ok(Box::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

impl AmqpChannel {
    fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }

    fn queue_arguments(queue: &QueueSpec) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(dead_letter) = &queue.dead_letter {
            arguments.insert(
                DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(dead_letter.exchange.as_str().into()),
            );
            arguments.insert(
                DEAD_LETTER_ROUTING_KEY_ARG.into(),
                AMQPValue::LongString(dead_letter.routing_key.as_str().into()),
            );
        }
        arguments
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                Self::exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> BrokerResult<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                Self::queue_arguments(queue),
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(classify)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<Box<dyn DeliveryStream>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;
        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
            debug!(cause = %err, "channel close failed");
        }
        if let Err(err) = self.connection.close(REPLY_SUCCESS, "closing").await {
            debug!(cause = %err, "connection close failed");
        }
    }
}

struct AmqpDeliveryStream {
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(cause = %err, "amqp consumer error");
                return Some(Err(classify(err)));
            }
        };
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string());
        Some(Ok(Delivery::new(
            delivery.delivery_tag,
            delivery.routing_key.as_str().to_string(),
            Bytes::from(delivery.data),
            message_id,
            delivery.redelivered,
            Box::new(AmqpAcker(delivery.acker)),
        )))
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use lapin::protocol::{AMQPError, AMQPHardError};
    use lapin::{ChannelState, ConnectionState};
    use rstest::rstest;

    use super::*;

    fn protocol_error(kind: AMQPErrorKind) -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(kind, "closed by broker".into()))
    }

    fn outcome(err: &BrokerError) -> &'static str {
        match err {
            BrokerError::Connection(_) => "connection",
            BrokerError::PreconditionFailed(_) => "precondition",
            BrokerError::Channel(_) => "channel",
        }
    }

    #[rstest]
    #[case(protocol_error(AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED)), "connection")]
    #[case(protocol_error(AMQPErrorKind::Hard(AMQPHardError::INTERNALERROR)), "connection")]
    #[case(lapin::Error::InvalidChannelState(ChannelState::Error), "connection")]
    #[case(lapin::Error::InvalidChannelState(ChannelState::Closed), "connection")]
    #[case(lapin::Error::InvalidConnectionState(ConnectionState::Closed), "connection")]
    #[case(
        lapin::Error::IOError(Arc::new(io::Error::from(io::ErrorKind::ConnectionReset))),
        "connection"
    )]
    #[case(lapin::Error::MissingHeartbeatError, "connection")]
    #[case(
        protocol_error(AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)),
        "precondition"
    )]
    #[case(protocol_error(AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)), "channel")]
    #[case(protocol_error(AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)), "channel")]
    fn lapin_errors_map_to_retry_classes(#[case] err: lapin::Error, #[case] expected: &str) {
        let classified = classify(err);
        assert_eq!(outcome(&classified), expected, "{classified}");
        assert_eq!(classified.is_connection_loss(), expected == "connection");
    }
}
