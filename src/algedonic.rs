//! Algedonic (pain/pleasure) signal channel.
//!
//! Signals queue in priority order and drain to normal subscribers on
//! a short cadence. Critical signals skip the queue entirely and go
//! straight to the bypass subscribers (S5 policy and S3 control),
//! within the same call.

use crate::clock::{Clock, HlcTimestamp};
use crate::metrics::{names, Metrics};
use crate::models::{PayloadValue, Subsystem};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Pain,
    Pleasure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgedonicSignal {
    /// Negative is pain, positive is pleasure.
    pub valence: f64,
    pub intensity: f64,
    pub source: String,
    pub subsystem: Subsystem,
    pub urgency: Urgency,
    pub bypass_hierarchy: bool,
    /// Delivery target, e.g. "s5" or "s3".
    pub target: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, PayloadValue>,
    pub timestamp: HlcTimestamp,
}

impl AlgedonicSignal {
    pub fn kind(&self) -> SignalKind {
        if self.valence < 0.0 {
            SignalKind::Pain
        } else {
            SignalKind::Pleasure
        }
    }

    /// Critical signals bypass the hierarchy: very intense signals of
    /// either kind, or strong pain.
    pub fn is_critical(&self) -> bool {
        self.bypass_hierarchy
            || self.intensity >= 0.9
            || (self.kind() == SignalKind::Pain && self.intensity >= 0.8)
    }
}

/// Convenience constructor for pain signals raised by components.
pub fn pain_signal(
    source: &str,
    intensity: f64,
    urgency: Urgency,
    target: &str,
    timestamp: HlcTimestamp,
) -> AlgedonicSignal {
    AlgedonicSignal {
        valence: -1.0,
        intensity: intensity.clamp(0.0, 1.0),
        source: source.to_string(),
        subsystem: Subsystem::External,
        urgency,
        bypass_hierarchy: intensity >= 0.9,
        target: target.to_string(),
        metadata: BTreeMap::new(),
        timestamp,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitResult {
    Queued,
    Bypassed,
    Debounced,
}

struct Prioritized(Arc<AlgedonicSignal>);

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Prioritized {}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .urgency
            .cmp(&other.0.urgency)
            .then(
                self.0
                    .intensity
                    .partial_cmp(&other.0.intensity)
                    .unwrap_or(Ordering::Equal),
            )
            // Earlier signals first among equals (reversed for max-heap).
            .then(other.0.timestamp.cmp(&self.0.timestamp))
    }
}

struct DebounceEntry {
    last_emit: Instant,
    max_intensity: f64,
}

/// Priority-ordered pain/pleasure bus with per-(source, kind)
/// debouncing.
pub struct AlgedonicChannel {
    clock: Arc<Clock>,
    metrics: Metrics,
    queue: Mutex<BinaryHeap<Prioritized>>,
    normal_tx: broadcast::Sender<Arc<AlgedonicSignal>>,
    bypass_tx: broadcast::Sender<Arc<AlgedonicSignal>>,
    debounce: Mutex<HashMap<(String, SignalKind), DebounceEntry>>,
    debounce_window: Duration,
}

impl AlgedonicChannel {
    pub fn new(clock: Arc<Clock>, metrics: Metrics, debounce_window: Duration) -> Arc<Self> {
        let (normal_tx, _) = broadcast::channel(256);
        let (bypass_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            clock,
            metrics,
            queue: Mutex::new(BinaryHeap::new()),
            normal_tx,
            bypass_tx,
            debounce: Mutex::new(HashMap::new()),
            debounce_window,
        })
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Normal subscriber chain, fed by `drain()` in priority order.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AlgedonicSignal>> {
        self.normal_tx.subscribe()
    }

    /// Direct S5/S3 route for critical signals.
    pub fn subscribe_bypass(&self) -> broadcast::Receiver<Arc<AlgedonicSignal>> {
        self.bypass_tx.subscribe()
    }

    /// Emit a signal. Repeats of the same (source, kind) inside the
    /// debounce window are dropped unless they escalate past the
    /// maximum intensity already delivered in that window, so the
    /// delivered stream always carries the window's max.
    pub fn emit(&self, signal: AlgedonicSignal) -> EmitResult {
        let key = (signal.source.clone(), signal.kind());
        {
            let mut debounce = self.debounce.lock();
            let now = Instant::now();
            if let Some(entry) = debounce.get_mut(&key) {
                if now.duration_since(entry.last_emit) < self.debounce_window {
                    if signal.intensity <= entry.max_intensity {
                        self.metrics.increment(names::ALGEDONIC_DEBOUNCED);
                        debug!(source = %signal.source, "signal debounced");
                        return EmitResult::Debounced;
                    }
                    entry.max_intensity = signal.intensity;
                } else {
                    entry.last_emit = now;
                    entry.max_intensity = signal.intensity;
                }
            } else {
                debounce.insert(
                    key,
                    DebounceEntry {
                        last_emit: now,
                        max_intensity: signal.intensity,
                    },
                );
            }
        }

        let signal = Arc::new(signal);
        if signal.is_critical() {
            self.metrics.increment(names::ALGEDONIC_BYPASSED);
            warn!(
                source = %signal.source,
                intensity = signal.intensity,
                target = %signal.target,
                "critical algedonic signal bypassing hierarchy"
            );
            // Errors mean no bypass subscriber is attached; the signal
            // still reaches the normal chain below.
            let _ = self.bypass_tx.send(signal.clone());
            let _ = self.normal_tx.send(signal);
            return EmitResult::Bypassed;
        }

        self.queue.lock().push(Prioritized(signal));
        EmitResult::Queued
    }

    /// Deliver queued signals to normal subscribers in priority order.
    /// Called from the channel's tick loop.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let signal = { self.queue.lock().pop() };
            match signal {
                Some(Prioritized(signal)) => {
                    let _ = self.normal_tx.send(signal);
                    drained += 1;
                }
                None => break,
            }
        }
        drained
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_metrics;

    fn channel(window_ms: u64) -> Arc<AlgedonicChannel> {
        AlgedonicChannel::new(
            Arc::new(Clock::new("n")),
            new_metrics(),
            Duration::from_millis(window_ms),
        )
    }

    fn signal(source: &str, valence: f64, intensity: f64, urgency: Urgency) -> AlgedonicSignal {
        AlgedonicSignal {
            valence,
            intensity,
            source: source.to_string(),
            subsystem: Subsystem::S1Operations,
            urgency,
            bypass_hierarchy: false,
            target: "s3".to_string(),
            metadata: BTreeMap::new(),
            timestamp: HlcTimestamp::new(1, 0, "n"),
        }
    }

    #[tokio::test]
    async fn test_priority_order_on_drain() {
        let channel = channel(0);
        let mut rx = channel.subscribe();

        channel.emit(signal("a", -0.2, 0.3, Urgency::Low));
        channel.emit(signal("b", -0.2, 0.5, Urgency::High));
        channel.emit(signal("c", -0.2, 0.4, Urgency::Medium));
        assert_eq!(channel.drain(), 3);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first.source, "b");
        assert_eq!(second.source, "c");
        assert_eq!(third.source, "a");
    }

    #[tokio::test]
    async fn test_critical_bypasses_immediately() {
        let channel = channel(0);
        let mut bypass = channel.subscribe_bypass();

        let result = channel.emit(signal("overload", -1.0, 0.95, Urgency::Critical));
        assert_eq!(result, EmitResult::Bypassed);

        // Delivered without any drain tick.
        let delivered = bypass.try_recv().unwrap();
        assert_eq!(delivered.source, "overload");
        assert_eq!(channel.queued(), 0);
    }

    #[tokio::test]
    async fn test_strong_pain_is_critical() {
        let channel = channel(0);
        let mut bypass = channel.subscribe_bypass();
        channel.emit(signal("fault", -0.9, 0.85, Urgency::High));
        assert!(bypass.try_recv().is_ok());

        // Pleasure at the same intensity is not critical.
        let result = channel.emit(signal("joy", 0.9, 0.85, Urgency::High));
        assert_eq!(result, EmitResult::Queued);
    }

    #[tokio::test]
    async fn test_debounce_drops_repeats() {
        let channel = channel(5_000);
        channel.emit(signal("src", -0.5, 0.5, Urgency::Medium));
        let repeat = channel.emit(signal("src", -0.5, 0.4, Urgency::Medium));
        assert_eq!(repeat, EmitResult::Debounced);

        // Escalation past the window max passes through.
        let escalated = channel.emit(signal("src", -0.5, 0.7, Urgency::Medium));
        assert_eq!(escalated, EmitResult::Queued);

        // Different kind from the same source is not debounced.
        let pleasure = channel.emit(signal("src", 0.5, 0.4, Urgency::Medium));
        assert_eq!(pleasure, EmitResult::Queued);
    }
}
