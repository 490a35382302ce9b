//! Environment-driven configuration.
//!
//! Every knob has a default suitable for a single-node deployment;
//! invalid values that would break index invariants are rejected at
//! startup rather than clamped.

use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Node identity stamped into every HLC timestamp.
    pub node_id: String,

    /// HNSW snapshot base path (sibling `.graph`/`.data`/`.levels`
    /// files are derived from it).
    pub persist_path: PathBuf,
    /// Base persistence interval; the adaptive scheduler tightens it
    /// under insertion load.
    pub persist_interval_ms: u64,
    /// Age cutoff for index pruning.
    pub prune_max_age_ms: u64,
    /// Pattern capacity used for variety pressure.
    pub max_patterns: usize,
    pub variety_pressure_limit: f64,
    pub pattern_confidence_threshold: f64,

    /// HNSW graph parameters.
    pub hnsw_m: usize,
    pub hnsw_ef: usize,

    /// Whether the AMQP transport is expected; when off, the router
    /// goes straight to the local stub path.
    pub amqp_enabled: bool,

    /// Event store rolling retention.
    pub event_retention_ms: u64,
    /// Hard per-topic cap in the event store.
    pub store_topic_cap: usize,

    /// Semantic fusion cadence and capacities.
    pub fuse_interval_ms: u64,
    pub fusion_queue_cap: usize,
    pub pattern_cache_cap: usize,
    pub pattern_ttl_ms: u64,

    /// Per-subscriber channel capacity on the bus.
    pub subscriber_channel_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            persist_path: PathBuf::from("./data/index"),
            persist_interval_ms: 300_000,
            prune_max_age_ms: 24 * 3600 * 1000,
            max_patterns: 10_000,
            variety_pressure_limit: 0.8,
            pattern_confidence_threshold: 0.5,
            hnsw_m: 16,
            hnsw_ef: 200,
            amqp_enabled: false,
            event_retention_ms: 3600 * 1000,
            store_topic_cap: 10_000,
            fuse_interval_ms: 500,
            fusion_queue_cap: 10_000,
            pattern_cache_cap: 1_000,
            pattern_ttl_ms: 3600 * 1000,
            subscriber_channel_cap: 1_024,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Config::default();
        let config = Config {
            node_id: env::var("NODE_ID").unwrap_or(defaults.node_id),
            persist_path: env::var("PERSIST_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.persist_path),
            persist_interval_ms: env_u64("PERSIST_INTERVAL_MS", defaults.persist_interval_ms),
            prune_max_age_ms: env_u64("PRUNE_MAX_AGE_MS", defaults.prune_max_age_ms),
            max_patterns: env_usize("MAX_PATTERNS", defaults.max_patterns),
            variety_pressure_limit: env::var("VARIETY_PRESSURE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.variety_pressure_limit),
            pattern_confidence_threshold: env::var("PATTERN_CONFIDENCE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.pattern_confidence_threshold),
            hnsw_m: env_usize("HNSW_M", defaults.hnsw_m),
            hnsw_ef: env_usize("HNSW_EF", defaults.hnsw_ef),
            amqp_enabled: env_bool("AMQP_ENABLED", defaults.amqp_enabled),
            event_retention_ms: env_u64("EVENT_RETENTION_SECS", defaults.event_retention_ms / 1000)
                * 1000,
            store_topic_cap: env_usize("STORE_TOPIC_CAP", defaults.store_topic_cap),
            fuse_interval_ms: env_u64("FUSE_INTERVAL_MS", defaults.fuse_interval_ms),
            fusion_queue_cap: env_usize("FUSION_QUEUE_CAP", defaults.fusion_queue_cap),
            pattern_cache_cap: env_usize("PATTERN_CACHE_CAP", defaults.pattern_cache_cap),
            pattern_ttl_ms: env_u64("PATTERN_TTL_MS", defaults.pattern_ttl_ms),
            subscriber_channel_cap: env_usize(
                "SUBSCRIBER_CHANNEL_CAP",
                defaults.subscriber_channel_cap,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would violate index or queue invariants.
    pub fn validate(&self) -> Result<()> {
        if !(2..=200).contains(&self.hnsw_m) {
            bail!("HNSW_M must be in [2, 200], got {}", self.hnsw_m);
        }
        if self.hnsw_ef < self.hnsw_m || self.hnsw_ef > 2000 {
            bail!(
                "HNSW_EF must be in [{}, 2000], got {}",
                self.hnsw_m,
                self.hnsw_ef
            );
        }
        if self.fuse_interval_ms == 0 {
            bail!("FUSE_INTERVAL_MS must be positive");
        }
        if self.fusion_queue_cap == 0 || self.pattern_cache_cap == 0 {
            bail!("fusion queue and pattern cache capacities must be positive");
        }
        if !(0.0..=1.0).contains(&self.variety_pressure_limit) {
            bail!(
                "VARIETY_PRESSURE_LIMIT must be in [0, 1], got {}",
                self.variety_pressure_limit
            );
        }
        if self.subscriber_channel_cap == 0 {
            bail!("SUBSCRIBER_CHANNEL_CAP must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_hnsw_params() {
        let mut config = Config::default();
        config.hnsw_m = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hnsw_m = 32;
        config.hnsw_ef = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hnsw_ef = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_caps() {
        let mut config = Config::default();
        config.fusion_queue_cap = 0;
        assert!(config.validate().is_err());
    }
}
