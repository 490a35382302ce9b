//! Message router contract: the bridge between the local fabric and an
//! external broker.
//!
//! The transport sits behind a trait. Publishing retries with
//! exponential backoff under a circuit breaker; while the transport is
//! unavailable (or disabled by configuration), messages route through
//! the local EventBus under a `stub_` topic prefix so downstream
//! consumers keep functioning.

use crate::bus::EventBus;
use crate::crdt::OrSet;
use crate::metrics::{names, Metrics};
use crate::models::PayloadValue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 5;

/// Failures after which the breaker opens.
const BREAKER_THRESHOLD: u32 = 5;
/// How long the breaker stays open before probing again.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum RouterError {
    TransportUnavailable(String),
    RetriesExhausted { attempts: u32, last: String },
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportUnavailable(reason) => write!(f, "transport unavailable: {reason}"),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// External broker transport. Implementations cover AMQP and the like;
/// the fabric only depends on this contract.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &PayloadValue,
    ) -> Result<(), String>;

    fn is_connected(&self) -> bool;
}

/// Where a publish actually went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Transport,
    /// Routed through the local bus under `stub_<exchange>`.
    LocalStub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Whether a call may proceed; transitions Open -> HalfOpen after
    /// the cooldown.
    fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = self
                    .opened_at
                    .map(|at| at.elapsed() >= BREAKER_COOLDOWN)
                    .unwrap_or(true);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.state == BreakerState::HalfOpen || self.consecutive_failures >= BREAKER_THRESHOLD {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
        }
    }
}

/// A registered consumer's cancellable handle.
pub struct ConsumerHandle {
    cancelled: Arc<AtomicBool>,
    pub queue: String,
}

impl ConsumerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub struct MessageRouter {
    bus: Arc<EventBus>,
    metrics: Metrics,
    transport: Option<Arc<dyn Transport>>,
    breaker: Mutex<Breaker>,
    /// Replicated belief of which consumer queues exist across the
    /// node group. Local registrations add; peers merge in theirs.
    consumer_beliefs: Mutex<OrSet>,
}

impl MessageRouter {
    /// A router without a transport routes everything locally.
    pub fn new(bus: Arc<EventBus>, metrics: Metrics, transport: Option<Arc<dyn Transport>>) -> Arc<Self> {
        let node_id = bus.clock().node_id().to_string();
        Arc::new(Self {
            bus,
            metrics,
            transport,
            breaker: Mutex::new(Breaker::new()),
            consumer_beliefs: Mutex::new(OrSet::new(node_id)),
        })
    }

    /// Publish with retry and breaker protection, falling back to the
    /// local stub route. The stub fallback always succeeds, so callers
    /// only observe the outcome, never an error, unless the message
    /// cannot be routed at all.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: PayloadValue,
    ) -> Result<RouteOutcome, RouterError> {
        let transport = match &self.transport {
            Some(transport) if transport.is_connected() => transport.clone(),
            _ => {
                return Ok(self.route_local(exchange, routing_key, message));
            }
        };

        if !self.breaker.lock().allow() {
            self.metrics.increment(names::ROUTER_CIRCUIT_OPEN);
            debug!(exchange, "circuit open, using local stub route");
            return Ok(self.route_local(exchange, routing_key, message));
        }

        let mut backoff = BACKOFF_BASE;
        let mut last_error = String::new();
        for attempt in 1..=MAX_RETRIES {
            match transport.publish(exchange, routing_key, &message).await {
                Ok(()) => {
                    self.breaker.lock().record_success();
                    return Ok(RouteOutcome::Transport);
                }
                Err(error) => {
                    last_error = error;
                    self.metrics.increment(names::ROUTER_RETRIES);
                    warn!(
                        exchange,
                        routing_key,
                        attempt,
                        error = %last_error,
                        "transport publish failed"
                    );
                    self.breaker.lock().record_failure();
                    if !self.breaker.lock().allow() {
                        break;
                    }
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        }

        warn!(exchange, last_error = %last_error, "transport exhausted, stub routing");
        Ok(self.route_local(exchange, routing_key, message))
    }

    fn route_local(&self, exchange: &str, routing_key: &str, message: PayloadValue) -> RouteOutcome {
        self.metrics.increment(names::ROUTER_STUB_ROUTED);
        let topic = format!("stub_{exchange}.{routing_key}");
        self.bus.publish(&topic, message);
        RouteOutcome::LocalStub
    }

    /// Register a consumer on the local stub route for a queue.
    /// Returns the handle and the bus subscription carrying deliveries.
    pub fn register_consumer(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> (ConsumerHandle, crate::bus::Subscription) {
        let topic = format!("stub_{exchange}.{routing_key}");
        let subscription = self.bus.subscribe(topic.as_str(), Default::default());
        self.consumer_beliefs.lock().add(topic.clone());
        (
            ConsumerHandle {
                cancelled: Arc::new(AtomicBool::new(false)),
                queue: topic,
            },
            subscription,
        )
    }

    /// Drop a cancelled consumer from the replicated belief set.
    pub fn forget_consumer(&self, handle: &ConsumerHandle) {
        self.consumer_beliefs.lock().remove(&handle.queue);
    }

    /// Snapshot of this node's consumer belief replica, for exchange
    /// with peers.
    pub fn consumer_beliefs(&self) -> OrSet {
        self.consumer_beliefs.lock().clone()
    }

    /// Merge a peer's belief replica into ours.
    pub fn merge_consumer_beliefs(&self, remote: &OrSet) {
        self.consumer_beliefs.lock().merge(remote);
    }
}
