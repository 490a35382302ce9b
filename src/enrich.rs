//! LLM enrichment contract.
//!
//! Enrichment is an opaque async service that must never block a
//! component owner. Owners hand prompts to `spawn_enrichment`, which
//! runs the call on a detached task with a timeout and publishes the
//! result back onto the bus.

use crate::bus::EventBus;
use crate::models::{payload, EventBuilder, PayloadValue};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichMode {
    Summarize,
    Classify,
    Explain,
}

impl EnrichMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichMode::Summarize => "summarize",
            EnrichMode::Classify => "classify",
            EnrichMode::Explain => "explain",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichError {
    Timeout,
    Unavailable(String),
    Rejected(String),
}

impl fmt::Display for EnrichError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "enrichment timed out"),
            Self::Unavailable(reason) => write!(f, "enrichment unavailable: {reason}"),
            Self::Rejected(reason) => write!(f, "enrichment rejected: {reason}"),
        }
    }
}

impl std::error::Error for EnrichError {}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, prompt: &str, mode: EnrichMode) -> Result<String, EnrichError>;
}

/// Default enricher when no LLM service is wired: declines every
/// request without delay.
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(&self, _prompt: &str, _mode: EnrichMode) -> Result<String, EnrichError> {
        Err(EnrichError::Unavailable("no enricher configured".into()))
    }
}

/// Fire-and-forget enrichment. The result (or failure) is published
/// on `enrichment_complete` / `enrichment_failed`; the caller's loop
/// is never suspended.
pub fn spawn_enrichment(
    enricher: Arc<dyn Enricher>,
    bus: Arc<EventBus>,
    prompt: String,
    mode: EnrichMode,
    timeout: Duration,
    correlation_id: String,
) {
    tokio::spawn(async move {
        let result = tokio::time::timeout(timeout, enricher.enrich(&prompt, mode)).await;
        match result {
            Ok(Ok(text)) => {
                bus.publish_draft(
                    EventBuilder::new("enrichment_complete")
                        .source("enricher")
                        .payload(payload(vec![
                            ("correlation_id", PayloadValue::Str(correlation_id)),
                            ("mode", PayloadValue::Str(mode.as_str().to_string())),
                            ("text", PayloadValue::Str(text)),
                        ])),
                );
            }
            Ok(Err(error)) => {
                warn!(%error, "enrichment failed");
                bus.publish_draft(
                    EventBuilder::new("enrichment_failed")
                        .source("enricher")
                        .payload(payload(vec![
                            ("correlation_id", PayloadValue::Str(correlation_id)),
                            ("error", PayloadValue::Str(error.to_string())),
                        ])),
                );
            }
            Err(_) => {
                warn!("enrichment timed out");
                bus.publish_draft(
                    EventBuilder::new("enrichment_failed")
                        .source("enricher")
                        .payload(payload(vec![
                            ("correlation_id", PayloadValue::Str(correlation_id)),
                            (
                                "error",
                                PayloadValue::Str(EnrichError::Timeout.to_string()),
                            ),
                        ])),
                );
            }
        }
    });
}
