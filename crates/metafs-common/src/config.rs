//! Configuration types for MetaFS
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};

/// Metadata journal configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Master enable. When false the journal accepts submissions as
    /// no-ops and invokes their callbacks with success.
    pub enabled: bool,
    /// Target live-event budget for trimming (-1 disables)
    pub max_events: i64,
    /// Target segment budget, excluding segments mid-expiry (-1 disables)
    pub max_segments: i64,
    /// Cap on segments concurrently waiting on expiry barriers
    pub max_trimming: usize,
    /// Pin the journal's backing objects to the local storage node
    pub local_osd: bool,
    /// Storage-node id offset applied with `local_osd`
    pub local_osd_offset: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events: -1,
            max_segments: 32,
            max_trimming: 4,
            local_osd: false,
            local_osd_offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JournalConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_events, -1);
        assert_eq!(config.max_segments, 32);
        assert!(config.max_trimming > 0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = JournalConfig {
            max_segments: 8,
            local_osd: true,
            ..JournalConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: JournalConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.max_segments, 8);
        assert!(back.local_osd);
    }
}
