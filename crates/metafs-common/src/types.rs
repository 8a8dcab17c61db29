//! Core types for MetaFS
//!
//! Plain identifiers and layout types shared across the metadata server.

use crate::config::JournalConfig;
use serde::{Deserialize, Serialize};

/// Rank of a metadata server within the cluster
pub type MdsRank = u32;

/// Inode number
pub type InodeNo = u64;

/// Base inode number for per-rank journal inodes. Rank `r` journals to
/// inode `LOG_INO_BASE + r`.
pub const LOG_INO_BASE: InodeNo = 0x200;

/// Striping layout of an object-store-backed byte stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLayout {
    /// Size of each backing object, in bytes
    pub object_size: u64,
    /// Number of objects a stripe spans
    pub stripe_count: u64,
    /// Placement hint: pin backing objects to this storage node
    pub preferred_osd: Option<u32>,
}

impl StripeLayout {
    /// Create a layout with no placement hint
    pub fn new(object_size: u64, stripe_count: u64) -> Self {
        assert!(object_size > 0 && stripe_count > 0);
        Self {
            object_size,
            stripe_count,
            preferred_osd: None,
        }
    }

    /// Bytes written before the stream wraps back to the first object of
    /// the next stripe
    pub fn period(&self) -> u64 {
        self.object_size * self.stripe_count
    }
}

impl Default for StripeLayout {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024, 1)
    }
}

/// Identity and layout of a journal's backing inode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogInode {
    pub ino: InodeNo,
    pub layout: StripeLayout,
}

impl LogInode {
    /// Journal inode for the given rank, applying the local-OSD
    /// placement hint when configured.
    pub fn for_rank(rank: MdsRank, mut layout: StripeLayout, config: &JournalConfig) -> Self {
        if config.local_osd {
            layout.preferred_osd = Some(rank + config.local_osd_offset);
        }
        Self {
            ino: LOG_INO_BASE + rank as InodeNo,
            layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period() {
        assert_eq!(StripeLayout::new(1024, 4).period(), 4096);
        assert_eq!(StripeLayout::new(1024, 1).period(), 1024);
    }

    #[test]
    fn test_log_inode_for_rank() {
        let config = JournalConfig::default();
        let inode = LogInode::for_rank(3, StripeLayout::default(), &config);
        assert_eq!(inode.ino, LOG_INO_BASE + 3);
        assert_eq!(inode.layout.preferred_osd, None);
    }

    #[test]
    fn test_local_osd_hint() {
        let config = JournalConfig {
            local_osd: true,
            local_osd_offset: 100,
            ..JournalConfig::default()
        };
        let inode = LogInode::for_rank(2, StripeLayout::default(), &config);
        assert_eq!(inode.layout.preferred_osd, Some(102));
    }
}
