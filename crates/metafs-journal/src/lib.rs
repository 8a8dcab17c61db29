//! MetaFS Metadata Journal
//!
//! A durable, append-only log of metadata events layered over an
//! object-store-resident byte stream. The log is segment-structured:
//! each segment opens with a subtree-map checkpoint that makes replay
//! restartable from its offset. This crate implements:
//!
//! - the append/flush protocol with its segment-boundary policy
//! - online trimming that expires completed segments and reclaims bytes
//! - threaded replay that reconstructs cache state from a persisted log
//! - the `create` / `open` + `replay` / `open` + `append` lifecycles
//!
//! The raw byte stream (the "streamer") and the metadata cache are
//! external collaborators consumed through traits.

pub mod cache;
pub mod completion;
pub mod event;
pub mod journal;
pub mod metrics;
pub mod segment;
pub mod streamer;

pub use cache::{MetadataCache, SharedCache};
pub use completion::{complete_all, Barrier, Completion, Finisher};
pub use event::{
    decode_event, encode_event, EventType, LogEvent, SubtreeMap, SubtreeMapEvent, UpdateEvent,
};
pub use journal::MetaJournal;
pub use metrics::{JournalMetrics, MetricsSnapshot};
pub use segment::LogSegment;
pub use streamer::{MemStreamer, StreamBacking, StreamHead, Streamer, FRAME_OVERHEAD};
