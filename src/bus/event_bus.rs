//! EventBus core: HLC-stamped publish with per-topic subscriber sets.
//!
//! Publishers never block on slow consumers. Every subscriber owns a
//! bounded queue with drop-oldest overflow; ordered subscribers get an
//! HLC-sorting buffer task between the queue and their receiver.

use crate::clock::Clock;
use crate::metrics::{names, Metrics};
use crate::models::{Event, EventBuilder, PayloadValue};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

use super::ordered::{Admit, OrderedBuffer};

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    All,
    Topic(String),
}

impl From<&str> for TopicFilter {
    fn from(topic: &str) -> Self {
        TopicFilter::Topic(topic.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub ordered_delivery: bool,
    /// How long an ordered subscriber holds events for re-sorting.
    pub buffer_window_ms: u64,
    pub batch_delivery: bool,
    /// Max events handed over in one batch.
    pub batch_max: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            ordered_delivery: false,
            buffer_window_ms: 100,
            batch_delivery: false,
            batch_max: 64,
        }
    }
}

impl SubscribeOptions {
    pub fn ordered(window_ms: u64) -> Self {
        Self {
            ordered_delivery: true,
            buffer_window_ms: window_ms,
            ..Default::default()
        }
    }

    pub fn batched(batch_max: usize) -> Self {
        Self {
            batch_delivery: true,
            batch_max,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub event: Arc<Event>,
    /// Set when an ordered subscriber receives an event that arrived
    /// behind its release watermark.
    pub late: bool,
}

#[derive(Debug, Clone)]
pub enum Delivery {
    Single(DeliveredEvent),
    Batch(Vec<DeliveredEvent>),
}

impl Delivery {
    /// Flatten into individual deliveries; convenient in tests.
    pub fn into_events(self) -> Vec<DeliveredEvent> {
        match self {
            Delivery::Single(event) => vec![event],
            Delivery::Batch(events) => events,
        }
    }
}

/// Bounded drop-oldest staging queue between publisher and consumer.
struct SubscriberQueue {
    inner: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    cap: usize,
}

impl SubscriberQueue {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(256))),
            notify: Notify::new(),
            cap,
        }
    }

    /// Push an event; returns true if an older event was dropped to
    /// make room.
    fn push(&self, event: Arc<Event>) -> bool {
        let dropped = {
            let mut queue = self.inner.lock();
            let dropped = if queue.len() >= self.cap {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

}

struct SubscriberState {
    id: Uuid,
    queue: SubscriberQueue,
    closed: AtomicBool,
}

impl SubscriberState {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until at least one event is queued, then take up to `max`.
    /// Returns `None` once the subscription has been closed.
    async fn wait_batch(&self, max: usize) -> Option<Vec<Arc<Event>>> {
        loop {
            if self.is_closed() {
                return None;
            }
            {
                let mut queue = self.queue.inner.lock();
                if !queue.is_empty() {
                    let take = queue.len().min(max.max(1));
                    return Some(queue.drain(..take).collect());
                }
            }
            self.queue.notify.notified().await;
        }
    }
}

/// A live subscription. Dropping the handle ends delivery.
pub struct Subscription {
    pub id: Uuid,
    pub filter: TopicFilter,
    receiver: mpsc::Receiver<Delivery>,
    state: Arc<SubscriberState>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Receive with a timeout; `None` on timeout or closed channel.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.close();
    }
}

/// In-process pub/sub with per-topic subscriber sets.
pub struct EventBus {
    clock: Arc<Clock>,
    metrics: Metrics,
    channel_cap: usize,
    topic_subs: RwLock<HashMap<String, Vec<Arc<SubscriberState>>>>,
    all_subs: RwLock<Vec<Arc<SubscriberState>>>,
}

impl EventBus {
    pub fn new(clock: Arc<Clock>, metrics: Metrics, channel_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            clock,
            metrics,
            channel_cap: channel_cap.max(1),
            topic_subs: RwLock::new(HashMap::new()),
            all_subs: RwLock::new(Vec::new()),
        })
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Publish a payload on a topic with default metadata. Returns the
    /// content-hash event id.
    pub fn publish(&self, topic: &str, payload: PayloadValue) -> String {
        self.publish_draft(EventBuilder::new(topic).payload(payload))
    }

    /// Publish a fully-specified draft; the bus stamps the timestamp.
    pub fn publish_draft(&self, draft: EventBuilder) -> String {
        let event = draft.build(self.clock.now());
        self.fan_out(Arc::new(event)).id.clone()
    }

    /// Publish an event that already carries a timestamp (remote or
    /// derived events). The clock observes the timestamp so local HLC
    /// keeps dominating.
    pub fn publish_event(&self, event: Event) -> Arc<Event> {
        self.clock.observe(&event.timestamp);
        self.fan_out(Arc::new(event))
    }

    fn fan_out(&self, event: Arc<Event>) -> Arc<Event> {
        trace!(topic = %event.topic, id = %event.id, "publish");

        let mut delivered = 0usize;
        {
            let subs = self.topic_subs.read();
            if let Some(entries) = subs.get(&event.topic) {
                for sub in entries.iter().filter(|s| !s.is_closed()) {
                    if sub.queue.push(event.clone()) {
                        self.metrics.increment(names::BUS_DROPPED_EVENTS);
                    }
                    delivered += 1;
                }
            }
        }
        {
            let subs = self.all_subs.read();
            for sub in subs.iter().filter(|s| !s.is_closed()) {
                if sub.queue.push(event.clone()) {
                    self.metrics.increment(names::BUS_DROPPED_EVENTS);
                }
                delivered += 1;
            }
        }

        if delivered == 0 {
            trace!(topic = %event.topic, "no subscribers");
        }
        event
    }

    /// Register a subscriber. The returned `Subscription` yields
    /// deliveries; dropping it tears the route down.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: impl Into<TopicFilter>,
        opts: SubscribeOptions,
    ) -> Subscription {
        let filter = filter.into();
        let state = Arc::new(SubscriberState {
            id: Uuid::new_v4(),
            queue: SubscriberQueue::new(self.channel_cap),
            closed: AtomicBool::new(false),
        });

        match &filter {
            TopicFilter::All => self.all_subs.write().push(state.clone()),
            TopicFilter::Topic(topic) => self
                .topic_subs
                .write()
                .entry(topic.clone())
                .or_default()
                .push(state.clone()),
        }

        let (tx, rx) = mpsc::channel(self.channel_cap);
        let bus = self.clone();
        let task_state = state.clone();
        let task_filter = filter.clone();
        if opts.ordered_delivery {
            tokio::spawn(async move {
                bus.ordered_delivery_loop(task_state, tx, opts).await;
                bus.remove(&task_filter);
            });
        } else {
            tokio::spawn(async move {
                bus.plain_delivery_loop(task_state, tx, opts).await;
                bus.remove(&task_filter);
            });
        }

        debug!(?filter, id = %state.id, "subscribed");
        Subscription {
            id: state.id,
            filter,
            receiver: rx,
            state,
        }
    }

    /// Explicitly detach a subscriber by id.
    pub fn unsubscribe(&self, filter: &TopicFilter, id: Uuid) {
        let close = |entries: &mut Vec<Arc<SubscriberState>>| {
            for entry in entries.iter() {
                if entry.id == id {
                    entry.close();
                }
            }
            entries.retain(|e| !e.is_closed());
        };
        match filter {
            TopicFilter::All => close(&mut self.all_subs.write()),
            TopicFilter::Topic(topic) => {
                if let Some(entries) = self.topic_subs.write().get_mut(topic) {
                    close(entries);
                }
            }
        }
    }

    fn remove(&self, filter: &TopicFilter) {
        match filter {
            TopicFilter::All => self.all_subs.write().retain(|e| !e.is_closed()),
            TopicFilter::Topic(topic) => {
                let mut subs = self.topic_subs.write();
                if let Some(entries) = subs.get_mut(topic) {
                    entries.retain(|e| !e.is_closed());
                    if entries.is_empty() {
                        subs.remove(topic);
                    }
                }
            }
        }
    }

    async fn plain_delivery_loop(
        &self,
        state: Arc<SubscriberState>,
        tx: mpsc::Sender<Delivery>,
        opts: SubscribeOptions,
    ) {
        let batch_max = if opts.batch_delivery { opts.batch_max } else { 1 };
        loop {
            let Some(events) = state.wait_batch(batch_max).await else {
                break;
            };
            let ok = if opts.batch_delivery {
                let batch = events
                    .into_iter()
                    .map(|event| DeliveredEvent { event, late: false })
                    .collect();
                tx.send(Delivery::Batch(batch)).await.is_ok()
            } else {
                let mut ok = true;
                for event in events {
                    if tx
                        .send(Delivery::Single(DeliveredEvent { event, late: false }))
                        .await
                        .is_err()
                    {
                        ok = false;
                        break;
                    }
                }
                ok
            };
            if !ok {
                state.close();
                break;
            }
        }
    }

    async fn ordered_delivery_loop(
        &self,
        state: Arc<SubscriberState>,
        tx: mpsc::Sender<Delivery>,
        opts: SubscribeOptions,
    ) {
        let mut buffer = OrderedBuffer::new(opts.buffer_window_ms, self.channel_cap);
        let far_future = Duration::from_secs(3600);
        let mut seen_overflows = 0u64;

        loop {
            if state.is_closed() {
                break;
            }

            let next_wake = buffer
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + far_future);

            tokio::select! {
                events = state.wait_batch(opts.batch_max) => {
                    let Some(events) = events else { break };
                    let now = Instant::now();
                    for event in events {
                        match buffer.offer(event, now) {
                            Admit::Buffered => {}
                            Admit::Late(event) => {
                                self.metrics.increment(names::BUS_LATE_EVENTS);
                                if tx
                                    .send(Delivery::Single(DeliveredEvent { event, late: true }))
                                    .await
                                    .is_err()
                                {
                                    state.close();
                                    return;
                                }
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(next_wake)) => {}
            }

            let overflows = buffer.overflow_drops();
            if overflows > seen_overflows {
                self.metrics
                    .add(names::BUS_ORDERED_OVERFLOW, overflows - seen_overflows);
                seen_overflows = overflows;
            }

            for event in buffer.release_due(Instant::now()) {
                if tx
                    .send(Delivery::Single(DeliveredEvent { event, late: false }))
                    .await
                    .is_err()
                {
                    state.close();
                    return;
                }
            }
        }

        // Flush remaining buffered events in order on shutdown.
        for event in buffer.drain() {
            if tx
                .send(Delivery::Single(DeliveredEvent { event, late: false }))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_metrics;
    use crate::models::payload;

    fn test_bus(cap: usize) -> Arc<EventBus> {
        EventBus::new(Arc::new(Clock::new("test-node")), new_metrics(), cap)
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let bus = test_bus(64);
        let mut sub = bus.subscribe("alerts", SubscribeOptions::default());

        let id = bus.publish("alerts", payload(vec![("level", PayloadValue::I64(3))]));
        let delivery = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
        let events = delivery.into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.id, id);
        assert!(!events[0].late);
    }

    #[tokio::test]
    async fn test_all_subscriber_sees_every_topic() {
        let bus = test_bus(64);
        let mut sub = bus.subscribe(TopicFilter::All, SubscribeOptions::default());

        bus.publish("a", PayloadValue::Null);
        bus.publish("b", PayloadValue::Null);

        let mut topics = Vec::new();
        for _ in 0..2 {
            let delivery = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
            for d in delivery.into_events() {
                topics.push(d.event.topic.clone());
            }
        }
        topics.sort();
        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let bus = test_bus(256);
        let mut sub = bus.subscribe("t", SubscribeOptions::default());
        for _ in 0..50 {
            bus.publish("t", PayloadValue::Null);
        }
        let mut prev = None;
        let mut seen = 0;
        while seen < 50 {
            let delivery = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
            for d in delivery.into_events() {
                if let Some(prev) = &prev {
                    assert!(d.event.timestamp > *prev);
                }
                prev = Some(d.event.timestamp.clone());
                seen += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_batch_delivery() {
        let bus = test_bus(256);
        let mut sub = bus.subscribe("t", SubscribeOptions::batched(32));
        for _ in 0..10 {
            bus.publish("t", PayloadValue::Null);
        }
        let mut total = 0;
        while total < 10 {
            match sub.recv_timeout(Duration::from_secs(1)).await.unwrap() {
                Delivery::Batch(events) => total += events.len(),
                Delivery::Single(_) => panic!("expected batch delivery"),
            }
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = test_bus(4);
        let metrics_bus = bus.clone();
        // Subscriber never drains its receiver; the staging queue caps.
        let _sub = bus.subscribe("t", SubscribeOptions::default());
        // Give the delivery task a moment to move a few into the channel,
        // then saturate the staging queue.
        for _ in 0..64 {
            bus.publish("t", PayloadValue::Null);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..64 {
            bus.publish("t", PayloadValue::Null);
        }
        // Publisher never blocked; some events were dropped and counted.
        assert!(metrics_bus.metrics.get(names::BUS_DROPPED_EVENTS) > 0);
    }

    #[tokio::test]
    async fn test_ordered_delivery_sorts_within_window() {
        let clock = Arc::new(Clock::new("test-node"));
        let bus = EventBus::new(clock.clone(), new_metrics(), 64);
        let mut sub = bus.subscribe("t", SubscribeOptions::ordered(40));

        // Stamp timestamps ourselves, then publish in reverse order.
        let t1 = clock.now();
        let t2 = clock.now();
        let t3 = clock.now();
        for ts in [t3.clone(), t1.clone(), t2.clone()] {
            bus.publish_event(crate::models::EventBuilder::new("t").build(ts));
        }

        let mut received = Vec::new();
        while received.len() < 3 {
            let delivery = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
            for d in delivery.into_events() {
                received.push(d.event.timestamp.clone());
            }
        }
        assert_eq!(received, vec![t1, t2, t3]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = test_bus(64);
        let mut sub = bus.subscribe("t", SubscribeOptions::default());
        let filter = sub.filter.clone();
        let id = sub.id;
        bus.unsubscribe(&filter, id);
        bus.publish("t", PayloadValue::Null);
        // Either nothing arrives or the channel is closed.
        let got = sub.recv_timeout(Duration::from_millis(100)).await;
        assert!(got.is_none());
    }
}
