//! Hybrid Logical Clock
//!
//! Single source of truth for event timestamps across the fabric.
//! Combines wall-clock milliseconds with a logical counter so that
//! events carry a total order even when the wall clock stalls or two
//! events land in the same millisecond.
//!
//! # Ordering Contract
//! - `now()` is strictly monotonic per node
//! - timestamps order lexicographically by (physical_ms, logical, node_id)
//! - `observe()` merges a remote timestamp without ever going backward

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::warn;

/// Maximum tolerated gap between the wall clock and the last issued
/// physical component before the clock reports skew.
pub const MAX_SKEW_MS: u64 = 30_000;

/// Mask selecting the 48 most significant bits of a packed timestamp.
/// 48 bits of milliseconds covers ~8,900 years; 16 bits of logical
/// counter is ample for same-millisecond bursts.
const PACK_MS_MASK: u64 = 0xFFFF_FFFF_FFFF_0000;

/// A hybrid logical timestamp.
///
/// Field order matters: the derived `Ord` gives the lexicographic
/// (physical, logical, node) order the fabric relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    pub physical_ms: u64,
    pub logical: u32,
    pub node_id: String,
}

impl HlcTimestamp {
    pub fn new(physical_ms: u64, logical: u32, node_id: impl Into<String>) -> Self {
        Self {
            physical_ms,
            logical,
            node_id: node_id.into(),
        }
    }

    /// Zero timestamp, orders before anything a live clock produces.
    pub fn zero() -> Self {
        Self::new(0, 0, "")
    }

    /// Compact 64-bit representation: 48-bit milliseconds, 16-bit
    /// logical counter. Used in the on-disk index header and anywhere
    /// a fixed-width timestamp is needed. The node id is not carried.
    pub fn pack(&self) -> u64 {
        ((self.physical_ms << 16) & PACK_MS_MASK) | (self.logical.min(0xFFFF) as u64)
    }

    /// Inverse of [`pack`]. The node id is lost in packing and comes
    /// back empty.
    pub fn unpack(value: u64) -> Self {
        Self {
            physical_ms: value >> 16,
            logical: (value & 0xFFFF) as u32,
            node_id: String::new(),
        }
    }

    /// Wall-clock distance to another timestamp, in milliseconds.
    pub fn physical_gap_ms(&self, other: &Self) -> u64 {
        self.physical_ms.abs_diff(other.physical_ms)
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.physical_ms, self.logical, self.node_id)
    }
}

impl std::str::FromStr for HlcTimestamp {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let physical_ms = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ClockError::InvalidTimestamp(s.to_string()))?;
        let logical = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ClockError::InvalidTimestamp(s.to_string()))?;
        let node_id = parts.next().unwrap_or("").to_string();
        Ok(Self {
            physical_ms,
            logical,
            node_id,
        })
    }
}

/// Errors surfaced by the clock.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockError {
    /// Wall clock jumped more than [`MAX_SKEW_MS`] away from the last
    /// issued physical component.
    Skew { wall_ms: u64, last_ms: u64 },
    /// Unparseable timestamp string.
    InvalidTimestamp(String),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skew { wall_ms, last_ms } => write!(
                f,
                "clock skew: wall {}ms vs last issued {}ms exceeds {}ms",
                wall_ms, last_ms, MAX_SKEW_MS
            ),
            Self::InvalidTimestamp(s) => write!(f, "invalid HLC timestamp '{}'", s),
        }
    }
}

impl std::error::Error for ClockError {}

#[derive(Debug, Clone, Copy, Default)]
struct LastIssued {
    physical_ms: u64,
    logical: u32,
}

/// Per-node hybrid logical clock.
///
/// Cheap to share: interior state is a single small mutex. Components
/// receive an `Arc<Clock>` at construction, never a global.
pub struct Clock {
    node_id: String,
    last: Mutex<LastIssued>,
    skew_events: std::sync::atomic::AtomicU64,
}

impl Clock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            last: Mutex::new(LastIssued::default()),
            skew_events: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Number of times the wall clock was observed outside the skew
    /// tolerance and the physical component was clamped.
    pub fn skew_events(&self) -> u64 {
        self.skew_events.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn wall_ms() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    /// Advance the issued state against an observed wall reading and
    /// return the new components.
    fn advance(last: &mut LastIssued, wall: u64) -> (u64, u32) {
        let physical = wall.max(last.physical_ms);
        let logical = if physical == last.physical_ms {
            last.logical + 1
        } else {
            0
        };
        last.physical_ms = physical;
        last.logical = logical;
        (physical, logical)
    }

    /// Issue the next timestamp, reporting skew when the wall clock
    /// has fallen more than [`MAX_SKEW_MS`] behind the last issued
    /// physical component. On `Ok` the clock state has advanced.
    pub fn now_checked(&self) -> Result<HlcTimestamp, ClockError> {
        let wall = Self::wall_ms();
        let mut last = self.last.lock();
        if wall + MAX_SKEW_MS < last.physical_ms {
            return Err(ClockError::Skew {
                wall_ms: wall,
                last_ms: last.physical_ms,
            });
        }
        let (physical, logical) = Self::advance(&mut last, wall);
        Ok(HlcTimestamp::new(physical, logical, self.node_id.clone()))
    }

    /// Issue the next timestamp for a local event.
    ///
    /// Never fails: when [`now_checked`](Self::now_checked) reports
    /// skew, the physical component is clamped to the last issued
    /// value with a warning and a counter, preserving monotonicity
    /// (the recoverable-skew policy).
    pub fn now(&self) -> HlcTimestamp {
        match self.now_checked() {
            Ok(timestamp) => timestamp,
            Err(error) => {
                self.skew_events
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(%error, "clamping to last issued timestamp");
                let mut last = self.last.lock();
                // Wall reading of zero always loses to the last issued
                // physical component, which is exactly the clamp.
                let (physical, logical) = Self::advance(&mut last, 0);
                HlcTimestamp::new(physical, logical, self.node_id.clone())
            }
        }
    }

    /// Merge a remote timestamp into the local clock and issue a
    /// timestamp that dominates both (the HLC receive rule).
    pub fn observe(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        let wall = Self::wall_ms();
        let mut last = self.last.lock();

        let prev = *last;
        let physical = wall.max(prev.physical_ms).max(remote.physical_ms);

        let logical = if physical == prev.physical_ms && physical == remote.physical_ms {
            1 + prev.logical.max(remote.logical)
        } else if physical == prev.physical_ms {
            1 + prev.logical
        } else if physical == remote.physical_ms {
            1 + remote.logical
        } else {
            0
        };

        last.physical_ms = physical;
        last.logical = logical;
        HlcTimestamp::new(physical, logical, self.node_id.clone())
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.last.lock();
        f.debug_struct("Clock")
            .field("node_id", &self.node_id)
            .field("last_physical_ms", &last.physical_ms)
            .field("last_logical", &last.logical)
            .finish()
    }
}

/// Explicit lexicographic comparison for callers that hold components
/// rather than whole timestamps.
pub fn compare_components(
    a: (u64, u32, &str),
    b: (u64, u32, &str),
) -> Ordering {
    a.0.cmp(&b.0)
        .then(a.1.cmp(&b.1))
        .then(a.2.cmp(b.2))
}
