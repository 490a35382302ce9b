//! Declarative pattern matching over fabric events.
//!
//! Patterns are declared in a JSON DSL, compiled once into an
//! evaluator tree, then matched against live events. Temporal and
//! statistical kinds consult the event store over their window.

mod compile;
mod library;
mod matcher;
mod registry;
mod spec;
pub(crate) mod temporal;

pub use compile::{compile, CompileError, CompiledNode, CompiledPattern, CompiledValueSpec};
pub use library::{critical_patterns, domain_patterns, PatternDefinition};
pub use matcher::{Outcome, PatternEvaluator};
pub use registry::{
    AlgedonicMapping, PatternMatch, PatternRegistry, PatternStats, RegistryStats, Severity,
};
pub use spec::{
    CompareOp, EventCondition, MatchContext, PatternSpec, TrendDirection, ValueSpec,
};
