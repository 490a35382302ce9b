//! Fabric-wide error taxonomy.
//!
//! Components keep their own fine-grained error enums; this type is
//! the classification surfaced at the CLI and the health boundary,
//! carrying the exit code and retry hint for each kind.

use crate::clock::ClockError;
use crate::hnsw::PersistError;
use crate::patterns::CompileError;
use std::fmt;

#[derive(Debug)]
pub enum FabricError {
    /// Bad pattern spec or out-of-range configuration. Never retried.
    InvalidInput(String),
    /// I/O, broker unavailability, timeout. Retry after backoff.
    Transient(String),
    /// Unreadable persistence or invalid on-disk version. The loader
    /// refuses to merge; callers start fresh and raise pain.
    CorruptedState(String),
    /// Queue overflow or variety pressure past the limit.
    ResourcePressure(String),
    /// Isolated per-pattern evaluation failure.
    EvaluationError(String),
    /// Excessive backward wall-clock jump.
    ClockSkew(String),
}

impl FabricError {
    /// CLI exit code for this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            FabricError::InvalidInput(_) => 2,
            FabricError::Transient(_) => 3,
            FabricError::CorruptedState(_) => 4,
            FabricError::ResourcePressure(_)
            | FabricError::EvaluationError(_)
            | FabricError::ClockSkew(_) => 3,
        }
    }

    pub fn retry_hint(&self) -> &'static str {
        match self {
            FabricError::InvalidInput(_) => "fix the input; retrying will not help",
            FabricError::Transient(_) => "retry with backoff",
            FabricError::CorruptedState(_) => "restore from a known-good snapshot",
            FabricError::ResourcePressure(_) => "reduce load or raise capacity limits",
            FabricError::EvaluationError(_) => "inspect the offending pattern",
            FabricError::ClockSkew(_) => "check NTP; the clock was clamped",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FabricError::InvalidInput(_) => "invalid_input",
            FabricError::Transient(_) => "transient",
            FabricError::CorruptedState(_) => "corrupted_state",
            FabricError::ResourcePressure(_) => "resource_pressure",
            FabricError::EvaluationError(_) => "evaluation_error",
            FabricError::ClockSkew(_) => "clock_skew",
        }
    }
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            FabricError::InvalidInput(m)
            | FabricError::Transient(m)
            | FabricError::CorruptedState(m)
            | FabricError::ResourcePressure(m)
            | FabricError::EvaluationError(m)
            | FabricError::ClockSkew(m) => m,
        };
        write!(f, "{}: {} ({})", self.kind(), message, self.retry_hint())
    }
}

impl std::error::Error for FabricError {}

impl From<CompileError> for FabricError {
    fn from(error: CompileError) -> Self {
        FabricError::InvalidInput(error.to_string())
    }
}

impl From<PersistError> for FabricError {
    fn from(error: PersistError) -> Self {
        match error {
            PersistError::Io(e) => FabricError::Transient(e.to_string()),
            PersistError::Corrupted(reason) => FabricError::CorruptedState(reason),
            PersistError::UnsupportedVersion(v) => {
                FabricError::CorruptedState(format!("snapshot version {v}"))
            }
        }
    }
}

impl From<ClockError> for FabricError {
    fn from(error: ClockError) -> Self {
        match error {
            ClockError::Skew { .. } => FabricError::ClockSkew(error.to_string()),
            ClockError::InvalidTimestamp(_) => FabricError::InvalidInput(error.to_string()),
        }
    }
}
