//! Incremental HNSW approximate nearest-neighbor index.
//!
//! The graph lives in an arena of fixed-shape node records with
//! per-level neighbor lists; edges are node ids, never references.
//! Deletion tombstones records and a compaction pass reclaims slots.

mod graph;
mod index;
mod persistence;
mod pruning;

pub use graph::{GraphArena, NodeMetadata, NodeRecord};
pub use index::{DistanceMetric, HnswError, HnswIndex, HnswParams, SearchResult};
pub use persistence::{load_index, save_index, AdaptiveInterval, PersistError, SNAPSHOT_VERSION};
pub use pruning::{CompactionStats, PruneStats};
