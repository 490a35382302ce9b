//! Component heartbeats and health reporting.
//!
//! Owners call `heartbeat()` from their tick loops; the monitor
//! answers `health_check` events on the bus with a
//! `health_check_response` carrying per-component status and the
//! fabric counter snapshot.

use crate::bus::{EventBus, SubscribeOptions};
use crate::metrics::{CounterSnapshot, Metrics};
use crate::models::{payload, topics, EventBuilder, PayloadValue};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// A component is unhealthy once its heartbeat is this stale.
const STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub seconds_since_heartbeat: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub uptime_secs: f64,
    pub components: Vec<ComponentHealth>,
    pub counters: Vec<CounterSnapshot>,
}

pub struct HealthMonitor {
    bus: Arc<EventBus>,
    metrics: Metrics,
    heartbeats: RwLock<HashMap<String, Instant>>,
    started: Instant,
}

impl HealthMonitor {
    pub fn new(bus: Arc<EventBus>, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            bus,
            metrics,
            heartbeats: RwLock::new(HashMap::new()),
            started: Instant::now(),
        })
    }

    /// Register a component so it shows up in reports before its
    /// first heartbeat.
    pub fn register(&self, name: &str) {
        self.heartbeats
            .write()
            .entry(name.to_string())
            .or_insert_with(Instant::now);
    }

    pub fn heartbeat(&self, name: &str) {
        self.heartbeats
            .write()
            .insert(name.to_string(), Instant::now());
    }

    pub fn report(&self) -> HealthReport {
        let now = Instant::now();
        let mut components: Vec<ComponentHealth> = self
            .heartbeats
            .read()
            .iter()
            .map(|(name, last)| {
                let age = now.duration_since(*last);
                ComponentHealth {
                    name: name.clone(),
                    healthy: age < STALE_AFTER,
                    seconds_since_heartbeat: age.as_secs_f64(),
                }
            })
            .collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));

        HealthReport {
            healthy: components.iter().all(|c| c.healthy),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            components,
            counters: self.metrics.snapshot(),
        }
    }

    fn publish_report(&self) {
        let report = self.report();
        let body: PayloadValue = serde_json::to_value(&report)
            .map(PayloadValue::from)
            .unwrap_or(PayloadValue::Null);
        self.bus.publish_draft(
            EventBuilder::new(topics::HEALTH_CHECK_RESPONSE)
                .source("health_monitor")
                .payload(payload(vec![
                    ("healthy", PayloadValue::Bool(report.healthy)),
                    ("report", body),
                ])),
        );
    }

    /// Answer health_check events until the bus drops the route.
    pub async fn run(self: Arc<Self>) {
        let mut sub = self.bus.subscribe("health_check", SubscribeOptions::default());
        info!("health monitor listening");
        while let Some(delivery) = sub.recv().await {
            for _ in delivery.into_events() {
                self.publish_report();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::metrics::new_metrics;

    fn monitor() -> (Arc<HealthMonitor>, Arc<EventBus>, Metrics) {
        let metrics = new_metrics();
        let bus = EventBus::new(Arc::new(Clock::new("n")), metrics.clone(), 64);
        (HealthMonitor::new(bus.clone(), metrics.clone()), bus, metrics)
    }

    #[tokio::test]
    async fn test_report_tracks_components() {
        let (monitor, _bus, metrics) = monitor();
        monitor.register("fusion");
        monitor.heartbeat("store");
        metrics.increment("some.counter");

        let report = monitor.report();
        assert!(report.healthy);
        assert_eq!(report.components.len(), 2);
        assert_eq!(report.components[0].name, "fusion");
        assert!(report.counters.iter().any(|c| c.name == "some.counter"));
    }

    #[tokio::test]
    async fn test_health_check_roundtrip() {
        let (monitor, bus, _metrics) = monitor();
        monitor.heartbeat("fusion");
        let mut sub = bus.subscribe(topics::HEALTH_CHECK_RESPONSE, Default::default());
        tokio::spawn(monitor.clone().run());
        // Give the monitor's subscription a moment to attach.
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish("health_check", PayloadValue::Null);
        let delivery = sub
            .recv_timeout(Duration::from_secs(2))
            .await
            .expect("health response");
        let event = &delivery.into_events()[0].event;
        assert_eq!(event.field("healthy"), Some(PayloadValue::Bool(true)));
    }
}
