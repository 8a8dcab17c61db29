//! The metadata cache interface consumed by the journal
//!
//! The cache is shared with the rest of the metadata server; the journal
//! holds a non-owning handle and calls it while holding its own state
//! lock. Implementations synchronize internally and must not call back
//! into the journal from these methods. Barriers returned by
//! [`MetadataCache::try_to_expire`] must fire their finisher from a
//! context holding no journal or cache lock.

use crate::completion::Barrier;
use crate::event::{EventType, SubtreeMap, SubtreeMapEvent};
use crate::segment::LogSegment;
use std::sync::Arc;

/// Shared handle to the metadata cache
pub type SharedCache = Arc<dyn MetadataCache>;

/// The journal's view of the metadata cache
pub trait MetadataCache: Send + Sync {
    /// Snapshot the current authority state into a fresh checkpoint
    /// event.
    fn create_subtree_map(&self) -> SubtreeMapEvent;

    /// Install a replayed checkpoint snapshot
    fn apply_subtree_map(&self, map: &SubtreeMap);

    /// Apply a replayed metadata mutation
    fn apply_update(&self, event_type: EventType, payload: &[u8]);

    /// Report the outstanding work (pending writes, cache flushes,
    /// authority transfers) that must complete before `segment`'s
    /// effects are fully absorbed. `None` means the segment is expirable
    /// right now.
    fn try_to_expire(&self, segment: &LogSegment) -> Option<Barrier>;
}
