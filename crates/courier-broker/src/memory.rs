//! In-process broker
//!
//! Behaves like the AMQP topology Courier declares, without a server:
//! - direct and fan-out exchanges with bindings, plus the default exchange
//!   (empty name, routing key = queue name)
//! - per-queue dead-letter destination, used by `nack(requeue = false)`,
//!   undecodable payloads and expired messages
//! - per-message expiration (the broker-native deferred path)
//! - unacked deliveries return to the queue when their consumer stops
//!
//! Nothing here survives a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_common::Envelope;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    Broker, BrokerError, BrokerPublisher, Delivery, PublishOptions, QueueConsumer, QueueStats, Result,
    Topology,
};

/// How long an idle poll waits for a publish before returning empty
const IDLE_POLL_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    Direct,
    Fanout,
}

struct Exchange {
    kind: ExchangeKind,
    /// (binding key, queue name)
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    tag: u64,
    routing_key: String,
    body: Arc<[u8]>,
    redelivered: bool,
}

#[derive(Debug, Clone)]
struct DeadLetter {
    exchange: String,
    routing_key: Option<String>,
}

struct MemoryQueue {
    name: String,
    ready: Mutex<VecDeque<StoredMessage>>,
    dead_letter: Option<DeadLetter>,
    consumers: AtomicU32,
    notify: Notify,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        self.ready.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.ready.lock().push_front(message);
        self.notify.notify_one();
    }

    fn take(&self, max: usize) -> Vec<StoredMessage> {
        let mut ready = self.ready.lock();
        let count = max.min(ready.len());
        ready.drain(..count).collect()
    }

    fn remove_tag(&self, tag: u64) -> Option<StoredMessage> {
        let mut ready = self.ready.lock();
        let position = ready.iter().position(|m| m.tag == tag)?;
        ready.remove(position)
    }
}

struct Inner {
    exchanges: RwLock<HashMap<String, Exchange>>,
    queues: DashMap<String, Arc<MemoryQueue>>,
    available: AtomicBool,
    next_tag: AtomicU64,
}

impl Inner {
    fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>> {
        self.queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.exchanges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                kind,
                bindings: Vec::new(),
            });
    }

    fn declare_queue(&self, name: &str, dead_letter: Option<DeadLetter>) {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryQueue {
                name: name.to_string(),
                ready: Mutex::new(VecDeque::new()),
                dead_letter,
                consumers: AtomicU32::new(0),
                notify: Notify::new(),
            })
        });
    }

    fn bind(&self, exchange: &str, key: &str, queue: &str) -> Result<()> {
        let mut exchanges = self.exchanges.write();
        let exchange = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Topology(format!("exchange '{exchange}' is not declared")))?;
        let binding = (key.to_string(), queue.to_string());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    fn targets(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<MemoryQueue>>> {
        if exchange.is_empty() {
            return Ok(self.queues.get(routing_key).map(|q| q.value().clone()).into_iter().collect());
        }

        let exchanges = self.exchanges.read();
        let exchange_def = exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Topology(format!("exchange '{exchange}' is not declared")))?;

        let queues = exchange_def
            .bindings
            .iter()
            .filter(|(key, _)| match exchange_def.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
            })
            .filter_map(|(_, queue)| self.queues.get(queue).map(|q| q.value().clone()))
            .collect();
        Ok(queues)
    }

    /// Place one copy of `body` in every queue the exchange routes to
    fn route(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        body: Arc<[u8]>,
        expiration: Option<Duration>,
    ) -> Result<usize> {
        let targets = self.targets(exchange, routing_key)?;
        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        for queue in &targets {
            let tag = self.next_tag();
            queue.push_back(StoredMessage {
                tag,
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered: false,
            });

            if let Some(ttl) = expiration {
                let inner = Arc::downgrade(self);
                let queue_name = queue.name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    expire(inner, &queue_name, tag);
                });
            }
        }
        Ok(targets.len())
    }

    /// Forward a message to the queue's dead-letter destination, or drop it
    /// when the queue has none.
    fn dead_letter(self: &Arc<Self>, queue: &MemoryQueue, message: StoredMessage) {
        let Some(dead_letter) = &queue.dead_letter else {
            warn!(queue = %queue.name, "Message dropped, queue has no dead-letter destination");
            return;
        };
        let routing_key = dead_letter.routing_key.as_deref().unwrap_or(&message.routing_key);
        if let Err(e) = self.route(&dead_letter.exchange, routing_key, message.body, None) {
            warn!(queue = %queue.name, error = %e, "Dead-lettering failed, message dropped");
        }
    }
}

fn expire(inner: Weak<Inner>, queue_name: &str, tag: u64) {
    let Some(inner) = inner.upgrade() else { return };
    let Ok(queue) = inner.queue(queue_name) else { return };
    if let Some(message) = queue.remove_tag(tag) {
        debug!(queue = %queue_name, "Message expired, dead-lettering");
        inner.dead_letter(&queue, message);
    }
}

/// In-process broker; clones share the same state
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                exchanges: RwLock::new(HashMap::new()),
                queues: DashMap::new(),
                available: AtomicBool::new(true),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Broker with `topology` already declared
    pub fn with_topology(topology: &Topology) -> Result<Self> {
        let broker = Self::new();
        broker.declare(topology)?;
        Ok(broker)
    }

    fn declare(&self, topology: &Topology) -> Result<()> {
        let inner = &self.inner;
        inner.declare_exchange(&topology.direct_exchange, ExchangeKind::Direct);
        inner.declare_exchange(&topology.fanout_exchange, ExchangeKind::Fanout);
        inner.declare_exchange(&topology.dead_letter_exchange, ExchangeKind::Direct);

        for route in topology.routes() {
            inner.declare_queue(&route.dead_letter_queue, None);
            inner.bind(&topology.dead_letter_exchange, &route.dead_letter_routing_key, &route.dead_letter_queue)?;

            inner.declare_queue(
                &route.queue,
                Some(DeadLetter {
                    exchange: topology.dead_letter_exchange.clone(),
                    routing_key: Some(route.dead_letter_routing_key.clone()),
                }),
            );
            inner.bind(&topology.direct_exchange, &route.routing_key, &route.queue)?;
            inner.bind(&topology.fanout_exchange, "", &route.queue)?;

            inner.declare_queue(
                &route.deferred_queue,
                Some(DeadLetter {
                    exchange: topology.direct_exchange.clone(),
                    routing_key: Some(route.routing_key.clone()),
                }),
            );
        }

        info!(queues = inner.queues.len(), "In-memory broker topology declared");
        Ok(())
    }

    /// Simulate an outage: while unavailable every publish fails
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Push raw bytes straight into a queue, bypassing serialization
    pub fn inject_raw(&self, queue: &str, body: &[u8]) -> Result<()> {
        let queue = self.inner.queue(queue)?;
        queue.push_back(StoredMessage {
            tag: self.inner.next_tag(),
            routing_key: queue.name.clone(),
            body: Arc::from(body),
            redelivered: false,
        });
        Ok(())
    }

    /// Messages ready in `queue`, zero for unknown queues
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner.queue(queue).map(|q| q.ready.lock().len()).unwrap_or(0)
    }

    /// Decoded copies of the envelopes ready in `queue`, left in place
    pub fn peek(&self, queue: &str) -> Vec<Envelope> {
        let Ok(queue) = self.inner.queue(queue) else {
            return Vec::new();
        };
        let ready = queue.ready.lock();
        ready
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.body).ok())
            .collect()
    }
}

#[async_trait]
impl BrokerPublisher for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> Result<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable);
        }

        let body: Arc<[u8]> = serde_json::to_vec(envelope)?.into();
        let copies = self.inner.route(exchange, routing_key, body, options.expiration)?;

        debug!(
            message_id = %envelope.id,
            exchange = %exchange,
            routing_key = %routing_key,
            copies,
            "Envelope published to in-memory broker"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        self.declare(topology)
    }

    async fn consumer(&self, queue: &str) -> Result<Box<dyn QueueConsumer>> {
        let queue = self.inner.queue(queue)?;
        queue.consumers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            queue,
            unacked: DashMap::new(),
            running: AtomicBool::new(true),
        }))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let q = self.inner.queue(queue)?;
        let message_count = q.ready.lock().len() as u64;
        Ok(QueueStats {
            queue: queue.to_string(),
            message_count,
            consumer_count: q.consumers.load(Ordering::SeqCst),
        })
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    queue: Arc<MemoryQueue>,
    unacked: DashMap<String, StoredMessage>,
    running: AtomicBool,
}

impl MemoryConsumer {
    fn into_deliveries(&self, batch: Vec<StoredMessage>) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(batch.len());
        for message in batch {
            match serde_json::from_slice::<Envelope>(&message.body) {
                Ok(envelope) => {
                    let receipt_handle = uuid::Uuid::new_v4().to_string();
                    let redelivered = message.redelivered;
                    self.unacked.insert(receipt_handle.clone(), message);
                    deliveries.push(Delivery {
                        envelope,
                        receipt_handle,
                        redelivered,
                        queue: self.queue.name.clone(),
                    });
                }
                Err(e) => {
                    warn!(queue = %self.queue.name, error = %e, "Undecodable message rejected");
                    self.inner.dead_letter(&self.queue, message);
                }
            }
        }
        deliveries
    }

    fn release_unacked(&self) {
        let handles: Vec<String> = self.unacked.iter().map(|e| e.key().clone()).collect();
        for handle in handles {
            if let Some((_, mut message)) = self.unacked.remove(&handle) {
                message.redelivered = true;
                self.queue.push_front(message);
            }
        }
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    fn identifier(&self) -> &str {
        &self.queue.name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<Delivery>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let mut batch = self.queue.take(max_messages as usize);
        if batch.is_empty() {
            let _ = tokio::time::timeout(IDLE_POLL_WAIT, self.queue.notify.notified()).await;
            batch = self.queue.take(max_messages as usize);
        }

        Ok(self.into_deliveries(batch))
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.unacked
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(receipt_handle.to_string()))
    }

    async fn nack(&self, receipt_handle: &str, requeue: bool) -> Result<()> {
        let (_, mut message) = self
            .unacked
            .remove(receipt_handle)
            .ok_or_else(|| BrokerError::NotFound(receipt_handle.to_string()))?;

        if requeue {
            message.redelivered = true;
            self.queue.push_front(message);
        } else {
            self.inner.dead_letter(&self.queue, message);
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.release_unacked();
            self.queue.consumers.fetch_sub(1, Ordering::SeqCst);
            debug!(queue = %self.queue.name, "In-memory consumer stopped");
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.release_unacked();
            self.queue.consumers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
