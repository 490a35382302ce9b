//! VSM Fabric node
//!
//! Wires the event intelligence pipeline: producers publish onto the
//! bus; the pipeline task feeds the event store and pattern registry;
//! semantic fusion distills contexts, patterns, and causal chains; the
//! index owner embeds detected patterns into the HNSW index with
//! adaptive persistence; the algedonic channel routes pain back to the
//! decision layers.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vsm_fabric::algedonic::{pain_signal, AlgedonicChannel, Urgency};
use vsm_fabric::bus::{EventBus, SubscribeOptions, TopicFilter};
use vsm_fabric::clock::Clock;
use vsm_fabric::config::Config;
use vsm_fabric::error::FabricError;
use vsm_fabric::fusion::{builtin_rules, pattern_vector, FusionConfig, SemanticFusionEngine};
use vsm_fabric::health::HealthMonitor;
use vsm_fabric::hnsw::{
    load_index, save_index, AdaptiveInterval, DistanceMetric, HnswIndex, HnswParams, NodeMetadata,
    PersistError,
};
use vsm_fabric::metrics::{names, new_metrics, Metrics};
use vsm_fabric::models::{payload, PayloadValue};
use vsm_fabric::patterns::{PatternEvaluator, PatternRegistry};
use vsm_fabric::router::MessageRouter;
use vsm_fabric::store::EventStore;

#[derive(Parser)]
#[command(name = "vsmfab", about = "VSM event intelligence fabric node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fabric node.
    Run,
    /// Print a snapshot's structure without loading it into a node.
    DumpIndex { path: PathBuf },
    /// Remove index nodes older than the given age (e.g. 30m, 12h, 7d).
    Prune {
        #[arg(long)]
        max_age: String,
    },
    /// Compact the index snapshot: drop orphans, re-prune, sweep.
    Compact,
    /// Print index and configuration stats.
    Stats,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vsm_fabric=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            let error = FabricError::InvalidInput(error.to_string());
            error!(%error, "configuration rejected");
            std::process::exit(error.exit_code());
        }
    };

    let result = match cli.command {
        Command::Run => run_node(config).await,
        Command::DumpIndex { path } => dump_index(&path),
        Command::Prune { max_age } => prune_index(&config, &max_age),
        Command::Compact => compact_index(&config),
        Command::Stats => print_stats(&config),
    };

    if let Err(error) = result {
        error!(%error, "command failed");
        std::process::exit(error.exit_code());
    }
}

fn wall_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Parse durations like "500ms", "30s", "5m", "12h", "7d".
fn parse_duration(input: &str) -> Result<Duration, FabricError> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| FabricError::InvalidInput(format!("missing duration unit in '{input}'")))?;
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| FabricError::InvalidInput(format!("bad duration '{input}'")))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        "d" => Duration::from_secs(value * 86_400),
        other => {
            return Err(FabricError::InvalidInput(format!(
                "unknown duration unit '{other}'"
            )))
        }
    };
    Ok(duration)
}

/// Load the persisted index, falling back to a fresh one. Corruption
/// is reported so the caller can raise pain; a missing snapshot is a
/// normal first boot.
fn load_or_fresh(config: &Config) -> (HnswIndex, Option<FabricError>) {
    match load_index(&config.persist_path, wall_ms()) {
        Ok(index) => (index, None),
        Err(PersistError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no index snapshot found, starting fresh");
            (
                HnswIndex::new(
                    HnswParams::new(config.hnsw_m, config.hnsw_ef),
                    DistanceMetric::Cosine,
                ),
                None,
            )
        }
        Err(error) => {
            let fabric_error: FabricError = error.into();
            warn!(%fabric_error, "index snapshot unusable, starting fresh");
            (
                HnswIndex::new(
                    HnswParams::new(config.hnsw_m, config.hnsw_ef),
                    DistanceMetric::Cosine,
                ),
                Some(fabric_error),
            )
        }
    }
}

async fn run_node(config: Config) -> Result<(), FabricError> {
    info!(node_id = %config.node_id, "🧠 fabric node starting");

    let clock = Arc::new(Clock::new(config.node_id.clone()));
    let metrics = new_metrics();
    let bus = EventBus::new(clock.clone(), metrics.clone(), config.subscriber_channel_cap);
    let store = EventStore::new(
        config.event_retention_ms,
        config.store_topic_cap,
        metrics.clone(),
    );
    let algedonic = AlgedonicChannel::new(clock.clone(), metrics.clone(), Duration::from_secs(5));

    let registry = PatternRegistry::new(
        PatternEvaluator::new(store.clone(), metrics.clone()),
        bus.clone(),
        algedonic.clone(),
        metrics.clone(),
    );
    registry.load_critical()?;
    for domain in ["operations", "coordination", "intelligence"] {
        let loaded = registry.load_domain(domain)?;
        info!(domain, loaded, "domain patterns loaded");
    }
    for pattern in registry.stats().patterns {
        registry.activate(&pattern.name);
    }

    let fusion = SemanticFusionEngine::new(
        bus.clone(),
        clock.clone(),
        metrics.clone(),
        FusionConfig {
            queue_cap: config.fusion_queue_cap,
            fuse_interval: Duration::from_millis(config.fuse_interval_ms),
            pattern_cache_cap: config.pattern_cache_cap,
            pattern_ttl_ms: config.pattern_ttl_ms,
            ..Default::default()
        },
        builtin_rules(),
    );
    let fusion_topics = fusion.subscribed_topics();

    let (index, load_error) = load_or_fresh(&config);
    if let Some(error) = load_error {
        algedonic.emit(pain_signal(
            "index_loader",
            0.9,
            Urgency::High,
            "s3",
            clock.now(),
        ));
        bus.publish(
            "index_persist_failed",
            payload(vec![
                ("phase", PayloadValue::Str("load".into())),
                ("error", PayloadValue::Str(error.to_string())),
            ]),
        );
    }

    let router = MessageRouter::new(bus.clone(), metrics.clone(), None);
    if config.amqp_enabled {
        warn!("AMQP enabled but no transport is wired; stub routing stays active");
    }

    let health = HealthMonitor::new(bus.clone(), metrics.clone());
    for component in ["pipeline", "fusion", "hnsw", "algedonic"] {
        health.register(component);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Pipeline: the single subscriber that sequences store append,
    // pattern evaluation, and fusion ingestion per event.
    {
        let bus = bus.clone();
        let store = store.clone();
        let registry = registry.clone();
        let fusion = fusion.clone();
        let health = health.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut sub = bus.subscribe(TopicFilter::All, SubscribeOptions::batched(64));
            loop {
                tokio::select! {
                    delivery = sub.recv() => {
                        let Some(delivery) = delivery else { break };
                        for delivered in delivery.into_events() {
                            let event = delivered.event;
                            store.append(event.clone());
                            registry.evaluate(&event);
                            if fusion_topics.contains(&event.topic) {
                                fusion.ingest(&event);
                            }
                        }
                        health.heartbeat("pipeline");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("pipeline task stopped");
        });
    }

    // Fusion tick loop.
    {
        let fusion = fusion.clone();
        let health = health.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut fuse = tokio::time::interval(fusion.fuse_interval());
            fuse.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut cleanup = tokio::time::interval(fusion.cleanup_interval());
            cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = fuse.tick() => {
                        fusion.fuse_tick();
                        health.heartbeat("fusion");
                    }
                    _ = cleanup.tick() => fusion.cleanup_tick(),
                    _ = shutdown.changed() => break,
                }
            }
            info!("fusion task stopped");
        });
    }

    // Algedonic drain loop. Delivered signals are mirrored onto the
    // bus as algedonic_signal events for S4 consumers and the store.
    {
        let algedonic = algedonic.clone();
        let bus = bus.clone();
        let health = health.clone();
        let mut delivered = algedonic.subscribe();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(50));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        algedonic.drain();
                        health.heartbeat("algedonic");
                    }
                    signal = delivered.recv() => {
                        let Ok(signal) = signal else { continue };
                        let body = serde_json::to_value(signal.as_ref())
                            .map(PayloadValue::from)
                            .unwrap_or(PayloadValue::Null);
                        bus.publish(
                            vsm_fabric::models::topics::ALGEDONIC_SIGNAL,
                            body,
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    tokio::spawn(health.clone().run());

    // Intelligence egress: matched patterns go out through the router
    // (stub-routed onto the local bus until a broker transport is
    // wired) for S4 consumers.
    {
        let bus = bus.clone();
        let router = router.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut sub = bus.subscribe(
                vsm_fabric::models::topics::PATTERN_MATCH,
                SubscribeOptions::default(),
            );
            loop {
                tokio::select! {
                    delivery = sub.recv() => {
                        let Some(delivery) = delivery else { break };
                        for delivered in delivery.into_events() {
                            let routing_key = delivered
                                .event
                                .field("pattern_name")
                                .and_then(|v| v.as_str().map(String::from))
                                .unwrap_or_else(|| "unknown".to_string());
                            if let Err(error) = router
                                .publish("vsm.intelligence", &routing_key, delivered.event.payload.clone())
                                .await
                            {
                                warn!(%error, "intelligence egress failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Index owner: the only task that touches the HNSW graph.
    let index_task = {
        let config = config.clone();
        let fusion = fusion.clone();
        let algedonic = algedonic.clone();
        let bus = bus.clone();
        let clock = clock.clone();
        let metrics = metrics.clone();
        let health = health.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            run_index_owner(
                index, config, fusion, algedonic, bus, clock, metrics, health, &mut shutdown,
            )
            .await;
        })
    };

    info!("✅ fabric node running; ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| FabricError::Transient(e.to_string()))?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = index_task.await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_index_owner(
    mut index: HnswIndex,
    config: Config,
    fusion: Arc<SemanticFusionEngine>,
    algedonic: Arc<AlgedonicChannel>,
    bus: Arc<EventBus>,
    clock: Arc<Clock>,
    metrics: Metrics,
    health: Arc<HealthMonitor>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let base_interval = Duration::from_millis(config.persist_interval_ms.max(1_000));
    let mut adaptive = AdaptiveInterval::new(base_interval);
    let mut persist_deadline = tokio::time::Instant::now() + base_interval;
    let mut last_persist = Instant::now();

    let mut feed = tokio::time::interval(Duration::from_millis(500));
    feed.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut prune = tokio::time::interval(Duration::from_secs(3600));
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = feed.tick() => {
                for pattern in fusion.drain_fresh_patterns() {
                    let vector = pattern_vector(&pattern);
                    let metadata = NodeMetadata {
                        inserted_at_ms: clock.now().physical_ms,
                        confidence: pattern.confidence,
                        tags: vec![pattern.pattern_type.clone()],
                    };
                    match index.insert(vector, metadata) {
                        Ok(_) => metrics.increment(names::HNSW_INSERTS),
                        Err(error) => warn!(%error, "pattern vector rejected"),
                    }
                }

                let pressure = index.variety_pressure(config.max_patterns);
                if pressure > config.variety_pressure_limit {
                    let removed = index.emergency_prune(
                        config.max_patterns,
                        config.variety_pressure_limit,
                        config.pattern_confidence_threshold,
                    );
                    metrics.increment(names::HNSW_EMERGENCY_PRUNES);
                    metrics.add(names::HNSW_PRUNED, removed as u64);
                    algedonic.emit(pain_signal(
                        "hnsw_variety_pressure",
                        0.5,
                        Urgency::Medium,
                        "s3",
                        clock.now(),
                    ));
                }
                health.heartbeat("hnsw");
            }
            _ = tokio::time::sleep_until(persist_deadline) => {
                persist_index(&index, &config, &algedonic, &bus, &clock, &metrics);
                let elapsed = last_persist.elapsed();
                last_persist = Instant::now();
                let next = adaptive.next_interval(index.insertions_total(), elapsed);
                info!(interval_secs = next.as_secs(), "next persist scheduled");
                persist_deadline = tokio::time::Instant::now() + next;
            }
            _ = prune.tick() => {
                let stats = index.prune_max_age(config.prune_max_age_ms, wall_ms());
                if stats.nodes_removed > 0 {
                    metrics.add(names::HNSW_PRUNED, stats.nodes_removed as u64);
                }
            }
            _ = shutdown.changed() => {
                persist_index(&index, &config, &algedonic, &bus, &clock, &metrics);
                info!("index owner stopped");
                return;
            }
        }
    }
}

fn persist_index(
    index: &HnswIndex,
    config: &Config,
    algedonic: &Arc<AlgedonicChannel>,
    bus: &Arc<EventBus>,
    clock: &Arc<Clock>,
    metrics: &Metrics,
) {
    if let Err(error) = save_index(index, &config.persist_path, wall_ms()) {
        metrics.increment(names::HNSW_PERSIST_FAILURES);
        warn!(%error, "index persistence failed, will retry next tick");
        algedonic.emit(pain_signal(
            "index_persistence",
            0.7,
            Urgency::High,
            "s3",
            clock.now(),
        ));
        bus.publish(
            "index_persist_failed",
            payload(vec![
                ("phase", PayloadValue::Str("save".into())),
                ("error", PayloadValue::Str(error.to_string())),
            ]),
        );
    }
}

fn dump_index(path: &PathBuf) -> Result<(), FabricError> {
    let index = load_index(path, wall_ms())?;
    let report = serde_json::json!({
        "path": path.display().to_string(),
        "node_count": index.len(),
        "entry_point": index.entry_point(),
        "dimension": index.dimension(),
        "metric": format!("{:?}", index.metric()),
        "m": index.params().m,
        "ef": index.params().ef,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report)
            .context("render report")
            .map_err(|e| FabricError::Transient(e.to_string()))?
    );
    Ok(())
}

fn prune_index(config: &Config, max_age: &str) -> Result<(), FabricError> {
    let max_age = parse_duration(max_age)?;
    let mut index = load_index(&config.persist_path, wall_ms())?;
    let stats = index.prune_max_age(max_age.as_millis() as u64, wall_ms());
    save_index(&index, &config.persist_path, wall_ms())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).map_err(|e| FabricError::Transient(e.to_string()))?
    );
    Ok(())
}

fn compact_index(config: &Config) -> Result<(), FabricError> {
    let mut index = load_index(&config.persist_path, wall_ms())?;
    let stats = index.compact();
    save_index(&index, &config.persist_path, wall_ms())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).map_err(|e| FabricError::Transient(e.to_string()))?
    );
    Ok(())
}

fn print_stats(config: &Config) -> Result<(), FabricError> {
    let index_stats = match load_index(&config.persist_path, wall_ms()) {
        Ok(index) => serde_json::json!({
            "node_count": index.len(),
            "entry_point": index.entry_point(),
            "dimension": index.dimension(),
            "variety_pressure": index.variety_pressure(config.max_patterns),
        }),
        Err(PersistError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            serde_json::json!({ "node_count": 0, "snapshot": "absent" })
        }
        Err(error) => return Err(error.into()),
    };
    let report = serde_json::json!({
        "node_id": config.node_id,
        "persist_path": config.persist_path.display().to_string(),
        "hnsw": { "m": config.hnsw_m, "ef": config.hnsw_ef },
        "max_patterns": config.max_patterns,
        "index": index_stats,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| FabricError::Transient(e.to_string()))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("x12s").is_err());
        assert!(parse_duration("12w").is_err());
    }
}
