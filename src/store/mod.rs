//! Bounded time-indexed store of recent events.
//!
//! Primary index is a BTreeMap keyed by HLC timestamp; a secondary
//! index tracks per-topic membership for `recent()` queries and
//! per-topic caps. Retention is a rolling wall-clock window, evicted
//! lazily on append.

mod event_store;

pub use event_store::{EventFilter, EventStore, StoreStats};
