//! Atomic HNSW snapshots.
//!
//! Four sibling files: `index` (versioned header + index metadata),
//! `index.graph` (adjacency), `index.data` (vectors + node metadata),
//! `index.levels` (id -> level map, used to cross-check the graph
//! file). Every file is written to a `.tmp` sibling, fsynced, then
//! renamed; the loader rejects partial or inconsistent snapshots.

use super::graph::{GraphArena, NodeMetadata, NodeRecord};
use super::index::{DistanceMetric, HnswIndex, HnswParams};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const SNAPSHOT_MAGIC: u32 = 0x484E_5357; // "HNSW"
pub const SNAPSHOT_VERSION: u16 = 2;

#[derive(Debug)]
pub enum PersistError {
    Io(io::Error),
    Corrupted(String),
    UnsupportedVersion(u16),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "snapshot io error: {e}"),
            Self::Corrupted(reason) => write!(f, "snapshot corrupted: {reason}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported snapshot version {v}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<io::Error> for PersistError {
    fn from(e: io::Error) -> Self {
        // A short read means a truncated file: corruption, not an
        // environment problem.
        if e.kind() == io::ErrorKind::UnexpectedEof {
            PersistError::Corrupted("unexpected end of file".to_string())
        } else {
            PersistError::Io(e)
        }
    }
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "index".to_string());
    name.push_str(suffix);
    base.with_file_name(name)
}

struct AtomicFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
}

impl AtomicFile {
    fn create(final_path: PathBuf) -> Result<Self, PersistError> {
        let tmp_path = {
            let mut name = final_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "index".to_string());
            name.push_str(".tmp");
            final_path.with_file_name(name)
        };
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Self {
            tmp_path,
            final_path,
            writer: BufWriter::new(file),
        })
    }

    fn commit(self) -> Result<(), PersistError> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| PersistError::Io(e.into_error()))?;
        file.sync_all()?;
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn write_u16(w: &mut impl Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}
fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}
fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Persist the index as a four-file snapshot rooted at `base`.
pub fn save_index(index: &HnswIndex, base: &Path, saved_at_ms: u64) -> Result<(), PersistError> {
    if let Some(parent) = base.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let graph = index.graph();
    let node_count = graph.len() as u64;

    // .data: vectors and node metadata.
    let mut data = AtomicFile::create(sibling(base, ".data"))?;
    write_u64(&mut data, node_count)?;
    for record in graph.iter_live() {
        write_u64(&mut data, record.id)?;
        write_u32(&mut data, record.vector.len() as u32)?;
        for value in &record.vector {
            data.write_all(&value.to_le_bytes())?;
        }
        let blob = serde_json::to_vec(&record.metadata)
            .map_err(|e| PersistError::Corrupted(format!("metadata encode: {e}")))?;
        write_u32(&mut data, blob.len() as u32)?;
        data.write_all(&blob)?;
    }

    // .graph: per-level adjacency.
    let mut adjacency = AtomicFile::create(sibling(base, ".graph"))?;
    write_u64(&mut adjacency, node_count)?;
    for record in graph.iter_live() {
        write_u64(&mut adjacency, record.id)?;
        write_u16(&mut adjacency, record.level)?;
        for level in 0..=record.level {
            let neighbors = record
                .neighbors
                .get(level as usize)
                .map(|n| n.as_slice())
                .unwrap_or(&[]);
            write_u32(&mut adjacency, neighbors.len() as u32)?;
            for &neighbor in neighbors {
                write_u64(&mut adjacency, neighbor)?;
            }
        }
    }

    // .levels: id -> level, for cross-checking the graph file.
    let mut levels = AtomicFile::create(sibling(base, ".levels"))?;
    write_u64(&mut levels, node_count)?;
    for record in graph.iter_live() {
        write_u64(&mut levels, record.id)?;
        write_u16(&mut levels, record.level)?;
    }

    // Header last: a valid header implies complete sibling files.
    let mut header = AtomicFile::create(base.to_path_buf())?;
    write_u32(&mut header, SNAPSHOT_MAGIC)?;
    write_u16(&mut header, SNAPSHOT_VERSION)?;
    write_u64(&mut header, saved_at_ms)?;

    let params = index.params();
    let mut blob: Vec<u8> = Vec::with_capacity(32);
    write_u64(&mut blob, node_count)?;
    write_u16(&mut blob, params.m as u16)?;
    write_u16(&mut blob, params.ef as u16)?;
    blob.push(index.metric().tag());
    write_u32(&mut blob, 0)?; // feature flags
    write_u32(&mut blob, index.dimension().unwrap_or(0) as u32)?;
    write_u64(&mut blob, index.entry_point().map(|id| id + 1).unwrap_or(0))?;
    write_u32(&mut header, blob.len() as u32)?;
    header.write_all(&blob)?;

    data.commit()?;
    adjacency.commit()?;
    levels.commit()?;
    header.commit()?;

    info!(nodes = node_count, path = %base.display(), "index snapshot written");
    Ok(())
}

struct HeaderInfo {
    version: u16,
    node_count: u64,
    m: u16,
    ef: u16,
    metric: DistanceMetric,
    dimension: Option<usize>,
    entry_point: Option<u64>,
}

fn read_header(base: &Path) -> Result<HeaderInfo, PersistError> {
    let mut reader = BufReader::new(File::open(base)?);
    let magic = read_u32(&mut reader)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(PersistError::Corrupted(format!(
            "bad magic 0x{magic:08X}"
        )));
    }
    let version = read_u16(&mut reader)?;
    if version == 0 || version > SNAPSHOT_VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }
    let _saved_at = read_u64(&mut reader)?;
    let blob_len = read_u32(&mut reader)? as usize;
    let mut blob = vec![0u8; blob_len];
    reader.read_exact(&mut blob)?;

    let mut cursor = io::Cursor::new(blob);
    let node_count = read_u64(&mut cursor)?;
    let m = read_u16(&mut cursor)?;
    let ef = read_u16(&mut cursor)?;
    let metric_tag = read_u8(&mut cursor)?;
    let metric = DistanceMetric::from_tag(metric_tag)
        .ok_or_else(|| PersistError::Corrupted(format!("unknown metric tag {metric_tag}")))?;
    let _flags = read_u32(&mut cursor)?;
    let dimension = match read_u32(&mut cursor)? {
        0 => None,
        d => Some(d as usize),
    };
    let entry_point = match read_u64(&mut cursor)? {
        0 => None,
        id => Some(id - 1),
    };

    Ok(HeaderInfo {
        version,
        node_count,
        m,
        ef,
        metric,
        dimension,
        entry_point,
    })
}

/// Load a snapshot rooted at `base`. `now_ms` backfills missing
/// insertion timestamps when migrating version 1 snapshots.
pub fn load_index(base: &Path, now_ms: u64) -> Result<HnswIndex, PersistError> {
    let header = read_header(base)?;

    // .levels first: cheap cross-check table.
    let mut levels_reader = BufReader::new(File::open(sibling(base, ".levels"))?);
    let level_count = read_u64(&mut levels_reader)?;
    if level_count != header.node_count {
        return Err(PersistError::Corrupted(format!(
            "levels file holds {} nodes, header says {}",
            level_count, header.node_count
        )));
    }
    let mut levels: std::collections::HashMap<u64, u16> = std::collections::HashMap::new();
    for _ in 0..level_count {
        let id = read_u64(&mut levels_reader)?;
        let level = read_u16(&mut levels_reader)?;
        levels.insert(id, level);
    }

    // .data: vectors and metadata.
    let mut data_reader = BufReader::new(File::open(sibling(base, ".data"))?);
    let data_count = read_u64(&mut data_reader)?;
    if data_count != header.node_count {
        return Err(PersistError::Corrupted(format!(
            "data file holds {data_count} nodes, header says {}",
            header.node_count
        )));
    }
    let mut records: std::collections::HashMap<u64, (Vec<f32>, NodeMetadata)> =
        std::collections::HashMap::new();
    for _ in 0..data_count {
        let id = read_u64(&mut data_reader)?;
        let dim = read_u32(&mut data_reader)? as usize;
        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            let mut buf = [0u8; 4];
            data_reader.read_exact(&mut buf)?;
            vector.push(f32::from_le_bytes(buf));
        }
        let blob_len = read_u32(&mut data_reader)? as usize;
        let mut blob = vec![0u8; blob_len];
        data_reader.read_exact(&mut blob)?;
        let mut metadata: NodeMetadata = serde_json::from_slice(&blob)
            .map_err(|e| PersistError::Corrupted(format!("metadata decode: {e}")))?;
        // Version 1 snapshots predate per-node timestamps.
        if header.version == 1 && metadata.inserted_at_ms == 0 {
            metadata.inserted_at_ms = now_ms;
        }
        records.insert(id, (vector, metadata));
    }

    // .graph: adjacency, validated against the levels table.
    let mut graph_reader = BufReader::new(File::open(sibling(base, ".graph"))?);
    let graph_count = read_u64(&mut graph_reader)?;
    if graph_count != header.node_count {
        return Err(PersistError::Corrupted(format!(
            "graph file holds {graph_count} nodes, header says {}",
            header.node_count
        )));
    }

    let mut arena = GraphArena::new();
    for _ in 0..graph_count {
        let id = read_u64(&mut graph_reader)?;
        let level = read_u16(&mut graph_reader)?;
        match levels.get(&id) {
            Some(&expected) if expected == level => {}
            Some(&expected) => {
                return Err(PersistError::Corrupted(format!(
                    "node {id} level {level} disagrees with levels file {expected}"
                )));
            }
            None => {
                return Err(PersistError::Corrupted(format!(
                    "node {id} missing from levels file"
                )));
            }
        }
        let mut neighbors = Vec::with_capacity(level as usize + 1);
        for _ in 0..=level {
            let count = read_u32(&mut graph_reader)? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                list.push(read_u64(&mut graph_reader)?);
            }
            neighbors.push(list);
        }
        let (vector, metadata) = records.remove(&id).ok_or_else(|| {
            PersistError::Corrupted(format!("node {id} missing from data file"))
        })?;
        arena.restore(NodeRecord {
            id,
            level,
            vector,
            metadata,
            neighbors,
            deleted: false,
        });
    }
    if !records.is_empty() {
        return Err(PersistError::Corrupted(format!(
            "{} data records missing from graph file",
            records.len()
        )));
    }

    // Entry point must be a live node at the maximal level.
    let entry = match header.entry_point {
        Some(id) if arena.contains(id) => Some(id),
        Some(id) => {
            warn!(id, "snapshot entry point missing, re-electing");
            arena.highest_level_node()
        }
        None if arena.is_empty() => None,
        None => arena.highest_level_node(),
    };
    arena.set_entry_point(entry);

    let params = HnswParams::new(header.m as usize, header.ef as usize);
    let mut index = HnswIndex::new(params, header.metric);
    index.restore_state(arena, header.dimension);
    info!(nodes = index.len(), path = %base.display(), "index snapshot loaded");
    Ok(index)
}

/// Save-interval tiers from insertion rate.
const FAST_TIER_PER_MIN: f64 = 1000.0;
const MID_TIER_PER_MIN: f64 = 100.0;

/// Tracks insertion rate and picks the next persistence interval.
pub struct AdaptiveInterval {
    base: Duration,
    last_insertions: u64,
}

impl AdaptiveInterval {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            last_insertions: 0,
        }
    }

    /// Called after each persist tick with the index's monotonic
    /// insertion counter and the elapsed time since the last call.
    pub fn next_interval(&mut self, insertions_total: u64, elapsed: Duration) -> Duration {
        let delta = insertions_total.saturating_sub(self.last_insertions);
        self.last_insertions = insertions_total;
        let minutes = elapsed.as_secs_f64() / 60.0;
        let rate = if minutes > 0.0 {
            delta as f64 / minutes
        } else {
            0.0
        };
        interval_for_rate(rate, self.base)
    }
}

pub fn interval_for_rate(rate_per_min: f64, base: Duration) -> Duration {
    if rate_per_min > FAST_TIER_PER_MIN {
        Duration::from_secs(60)
    } else if rate_per_min > MID_TIER_PER_MIN {
        Duration::from_secs(180)
    } else {
        base
    }
}
