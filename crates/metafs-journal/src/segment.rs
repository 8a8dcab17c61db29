//! Log segments
//!
//! A segment is a contiguous run of journal events delimited at its
//! start by a subtree-map checkpoint. The byte offset of that checkpoint
//! in the stream is the segment's identity.

use metafs_common::InodeNo;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct LogSegment {
    offset: u64,
    /// Events bound to this segment. The opening checkpoint is a
    /// delimiter, not an event, and is excluded.
    num_events: AtomicU64,
    /// Inodes dirtied by events in this segment; consulted when the
    /// cache decides whether the segment is expirable.
    dirty_inodes: Mutex<BTreeSet<InodeNo>>,
}

impl LogSegment {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            num_events: AtomicU64::new(0),
            dirty_inodes: Mutex::new(BTreeSet::new()),
        }
    }

    /// Stream offset of the opening checkpoint
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn num_events(&self) -> u64 {
        self.num_events.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_events(&self) {
        self.num_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record inodes an event in this segment dirtied
    pub fn note_dirty(&self, inodes: &[InodeNo]) {
        if inodes.is_empty() {
            return;
        }
        let mut dirty = self.dirty_inodes.lock();
        dirty.extend(inodes.iter().copied());
    }

    /// Snapshot of the dirty-inode set
    pub fn dirty_inodes(&self) -> BTreeSet<InodeNo> {
        self.dirty_inodes.lock().clone()
    }

    pub fn num_dirty(&self) -> usize {
        self.dirty_inodes.lock().len()
    }
}
