//! Semantic fusion: correlating enriched event streams into derived
//! contexts, detected patterns, and causal chains.

mod causal;
mod detectors;
mod engine;
mod rules;

pub use causal::{detect_chains, CausalChain, ChainLink, MAX_CHAIN_GAP_MS};
pub use detectors::{detect_all, pattern_vector, DetectedPattern, PATTERN_VECTOR_DIM};
pub use engine::{FusionConfig, FusionSnapshot, SemanticFusionEngine};
pub use rules::{builtin_rules, FusedContext, FusionRule};
