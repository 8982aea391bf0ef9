use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::{
    topic_matches, Acker, BindingSpec, BrokerChannel, BrokerConnector, BrokerError, BrokerResult,
    Delivery, DeliveryStream, ExchangeSpec, QueueSpec,
};

/// A message sitting in a [`MemoryBroker`] queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    pub routing_key: String,
    pub payload: Bytes,
    pub message_id: Option<String>,
    pub redelivered: bool,
}

struct MemoryQueue {
    spec: QueueSpec,
    tx: async_channel::Sender<MemoryMessage>,
    rx: async_channel::Receiver<MemoryMessage>,
}

struct Shared {
    exchanges: DashMap<String, ExchangeSpec>,
    queues: DashMap<String, MemoryQueue>,
    bindings: RwLock<Vec<BindingSpec>>,
    reachable: AtomicBool,
    // bumped on every simulated connection drop; channels remember the value
    // they were opened under
    generation: watch::Sender<u64>,
    connect_attempts: AtomicUsize,
    acks: AtomicUsize,
    rejects: AtomicUsize,
    next_tag: AtomicU64,
}

impl Shared {
    fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn route(&self, exchange: &str, message: MemoryMessage) -> BrokerResult<usize> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
        }
        let targets: Vec<String> = self
            .bindings
            .read()
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();
        let mut routed = 0;
        for queue in targets {
            if let Some(queue) = self.queues.get(&queue) {
                if queue.tx.try_send(message.clone()).is_ok() {
                    routed += 1;
                }
            }
        }
        trace!(exchange, routing_key = %message.routing_key, routed, "message routed");
        Ok(routed)
    }

    fn requeue(&self, queue: &str, mut message: MemoryMessage) {
        message.redelivered = true;
        if let Some(queue) = self.queues.get(queue) {
            let _ = queue.tx.try_send(message);
        }
    }

    fn dead_letter(&self, queue: &str, message: MemoryMessage) {
        let target = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter.clone());
        let Some(target) = target else {
            debug!(queue, "rejected message dropped, queue has no dead-letter exchange");
            return;
        };
        let routing_key = if target.routing_key.is_empty() {
            message.routing_key
        } else {
            target.routing_key
        };
        let message = MemoryMessage {
            routing_key,
            payload: message.payload,
            message_id: message.message_id,
            redelivered: false,
        };
        if let Err(err) = self.route(&target.exchange, message) {
            warn!(queue, cause = %err, "dead-lettering failed, message dropped");
        }
    }
}

/// In-process broker with topic-exchange routing and dead-lettering.
///
/// Also lets a test refuse connections or drop every open one, to exercise
/// reconnection. Unacknowledged deliveries on a dropped connection go back to
/// their queue marked as redelivered.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        MemoryBroker {
            shared: Arc::new(Shared {
                exchanges: DashMap::new(),
                queues: DashMap::new(),
                bindings: RwLock::new(Vec::new()),
                reachable: AtomicBool::new(true),
                generation,
                connect_attempts: AtomicUsize::new(0),
                acks: AtomicUsize::new(0),
                rejects: AtomicUsize::new(0),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn drop_connections(&self) {
        self.shared.generation.send_modify(|g| *g += 1);
        debug!("memory broker dropped all connections");
    }

    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
        message_id: Option<&str>,
    ) -> BrokerResult<usize> {
        self.shared.route(
            exchange,
            MemoryMessage {
                routing_key: routing_key.to_string(),
                payload: payload.into(),
                message_id: message_id.map(str::to_string),
                redelivered: false,
            },
        )
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared.queues.get(queue).map_or(0, |q| q.rx.len())
    }

    /// Removes and returns everything currently waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<MemoryMessage> {
        let Some(queue) = self.shared.queues.get(queue) else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        while let Ok(message) = queue.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> usize {
        self.shared.acks.load(Ordering::SeqCst)
    }

    pub fn reject_count(&self) -> usize {
        self.shared.rejects.load(Ordering::SeqCst)
    }

    pub fn binding_count(&self) -> usize {
        self.shared.bindings.read().len()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            generation: self.shared.generation(),
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    generation: u64,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.shared.generation() != self.generation {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        match self.shared.exchanges.entry(exchange.name.clone()) {
            Entry::Occupied(existing) if existing.get() != exchange => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{}'",
                    exchange.name
                )))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        match self.shared.queues.entry(queue.name.clone()) {
            Entry::Occupied(existing) if existing.get().spec != *queue => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    queue.name
                )))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                let (tx, rx) = async_channel::unbounded();
                slot.insert(MemoryQueue {
                    spec: queue.clone(),
                    tx,
                    rx,
                });
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        if !self.shared.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::Channel(format!(
                "no exchange '{}'",
                binding.exchange
            )));
        }
        if !self.shared.queues.contains_key(&binding.queue) {
            return Err(BrokerError::Channel(format!("no queue '{}'", binding.queue)));
        }
        let mut bindings = self.shared.bindings.write();
        if !bindings.contains(binding) {
            bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> BrokerResult<()> {
        self.ensure_open()
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<Box<dyn DeliveryStream>> {
        self.ensure_open()?;
        let rx = self
            .shared
            .queues
            .get(queue)
            .map(|q| q.rx.clone())
            .ok_or_else(|| BrokerError::Channel(format!("no queue '{queue}'")))?;
        debug!(queue, consumer_tag, "memory consumer registered");
        Ok(Box::new(MemoryDeliveryStream {
            shared: self.shared.clone(),
            generation: self.generation,
            queue: queue.to_string(),
            rx,
            closed: self.shared.generation.subscribe(),
        }))
    }

    async fn close(&self) {}
}

struct MemoryDeliveryStream {
    shared: Arc<Shared>,
    generation: u64,
    queue: String,
    rx: async_channel::Receiver<MemoryMessage>,
    closed: watch::Receiver<u64>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        if self.shared.generation() != self.generation {
            return None;
        }
        let message = tokio::select! {
            message = self.rx.recv() => message.ok()?,
            _ = self.closed.changed() => return None,
        };
        if self.shared.generation() != self.generation {
            self.shared.requeue(&self.queue, message);
            return None;
        }
        let delivery_tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
        let acker = MemoryAcker {
            shared: self.shared.clone(),
            generation: self.generation,
            queue: self.queue.clone(),
            message: message.clone(),
        };
        Some(Ok(Delivery::new(
            delivery_tag,
            message.routing_key,
            message.payload,
            message.message_id,
            message.redelivered,
            Box::new(acker),
        )))
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    generation: u64,
    queue: String,
    message: MemoryMessage,
}

impl MemoryAcker {
    fn ensure_live(&self) -> BrokerResult<()> {
        if self.shared.generation() != self.generation {
            // the broker takes back whatever was in flight on a dead connection
            self.shared.requeue(&self.queue, self.message.clone());
            return Err(BrokerError::Connection(
                "connection closed before settle".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.ensure_live()?;
        self.shared.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        self.ensure_live()?;
        self.shared.rejects.fetch_add(1, Ordering::SeqCst);
        if requeue {
            self.shared.requeue(&self.queue, self.message.clone());
        } else {
            self.shared.dead_letter(&self.queue, self.message.clone());
        }
        Ok(())
    }
}
