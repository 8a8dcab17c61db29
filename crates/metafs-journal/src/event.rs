//! Journal events and their wire codec
//!
//! Every entry in the journal body is `[tag: u32 LE][payload]`. The
//! payload encoding is owned by the event type. A subtree-map checkpoint
//! opens each segment; everything else is an ordinary metadata mutation.

use crate::cache::MetadataCache;
use crate::segment::LogSegment;
use metafs_common::{Error, InodeNo, MdsRank, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Size of the `[tag]` prefix on every encoded event
pub const EVENT_TAG_SIZE: usize = 4;

/// Event type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    /// Segment-opening authority checkpoint
    SubtreeMap = 1,
    /// Generic metadata mutation
    Update = 2,
    /// Begin of a subtree import from another rank
    ImportStart = 3,
    /// Completion of a subtree import
    ImportFinish = 4,
    /// Subtree export to another rank
    Export = 5,
    /// Inode opened into the cache
    Open = 6,
    /// Deferred work committed
    Commit = 7,
}

impl EventType {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::SubtreeMap),
            2 => Some(Self::Update),
            3 => Some(Self::ImportStart),
            4 => Some(Self::ImportFinish),
            5 => Some(Self::Export),
            6 => Some(Self::Open),
            7 => Some(Self::Commit),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A journal event.
///
/// Events are single-use: the appender encodes and destroys them on
/// submit, the replayer decodes, applies, and destroys them. An event is
/// bound to its owning segment when submitted or replayed; the segment is
/// handed to [`LogEvent::update_segment`] and [`LogEvent::replay`] as a
/// non-owning reference.
pub trait LogEvent: Send {
    fn event_type(&self) -> EventType;

    /// Append the payload (everything after the tag) to `buf`
    fn encode_payload(&self, buf: &mut Vec<u8>);

    /// Record event-specific state on the owning segment. Invoked on
    /// submit, after the event is bound to the current segment.
    fn update_segment(&self, _segment: &LogSegment) {}

    /// Apply the event to the cache during replay
    fn replay(&mut self, cache: &dyn MetadataCache, segment: &Arc<LogSegment>);
}

/// Encode an event as `[tag][payload]` for the streamer
pub fn encode_event(event: &dyn LogEvent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&event.event_type().as_u32().to_le_bytes());
    event.encode_payload(&mut buf);
    buf
}

/// Decode one journal entry back into an event
pub fn decode_event(bytes: &[u8]) -> Result<Box<dyn LogEvent>> {
    if bytes.len() < EVENT_TAG_SIZE {
        return Err(Error::decode("entry shorter than event tag"));
    }
    let tag = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let event_type = EventType::from_u32(tag)
        .ok_or_else(|| Error::decode(format!("unknown event tag {tag}")))?;
    let payload = &bytes[EVENT_TAG_SIZE..];

    match event_type {
        EventType::SubtreeMap => Ok(Box::new(SubtreeMapEvent::decode(payload)?)),
        _ => Ok(Box::new(UpdateEvent::decode(event_type, payload)?)),
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let end = at
        .checked_add(4)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| Error::decode("payload truncated"))?;
    Ok(u32::from_le_bytes(bytes[at..end].try_into().unwrap()))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64> {
    let end = at
        .checked_add(8)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| Error::decode("payload truncated"))?;
    Ok(u64::from_le_bytes(bytes[at..end].try_into().unwrap()))
}

/// Snapshot of subtree authority sufficient to restart replay at the
/// checkpoint carrying it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubtreeMap {
    /// Cache epoch at snapshot time
    pub epoch: u64,
    /// Subtree root inode to authoritative rank
    pub subtrees: BTreeMap<InodeNo, MdsRank>,
}

impl SubtreeMap {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&(self.subtrees.len() as u32).to_le_bytes());
        for (ino, rank) in &self.subtrees {
            buf.extend_from_slice(&ino.to_le_bytes());
            buf.extend_from_slice(&rank.to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let epoch = read_u64(bytes, 0)?;
        let count = read_u32(bytes, 8)? as usize;
        let mut subtrees = BTreeMap::new();
        let mut at = 12;
        for _ in 0..count {
            let ino = read_u64(bytes, at)?;
            let rank = read_u32(bytes, at + 8)?;
            subtrees.insert(ino, rank);
            at += 12;
        }
        Ok(Self { epoch, subtrees })
    }
}

/// The segment-opening checkpoint event
pub struct SubtreeMapEvent {
    map: SubtreeMap,
}

impl SubtreeMapEvent {
    pub fn new(map: SubtreeMap) -> Self {
        Self { map }
    }

    pub fn map(&self) -> &SubtreeMap {
        &self.map
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            map: SubtreeMap::decode(payload)?,
        })
    }
}

impl LogEvent for SubtreeMapEvent {
    fn event_type(&self) -> EventType {
        EventType::SubtreeMap
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        self.map.encode(buf);
    }

    fn replay(&mut self, cache: &dyn MetadataCache, _segment: &Arc<LogSegment>) {
        cache.apply_subtree_map(&self.map);
    }
}

/// An ordinary metadata mutation: an opaque payload produced by the
/// cache plus the inodes it dirties.
pub struct UpdateEvent {
    event_type: EventType,
    touched: Vec<InodeNo>,
    payload: Vec<u8>,
}

impl UpdateEvent {
    pub fn new(event_type: EventType, touched: Vec<InodeNo>, payload: Vec<u8>) -> Self {
        assert_ne!(event_type, EventType::SubtreeMap);
        Self {
            event_type,
            touched,
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn decode(event_type: EventType, bytes: &[u8]) -> Result<Self> {
        let count = read_u32(bytes, 0)? as usize;
        let mut touched = Vec::with_capacity(count);
        let mut at = 4;
        for _ in 0..count {
            touched.push(read_u64(bytes, at)?);
            at += 8;
        }
        Ok(Self {
            event_type,
            touched,
            payload: bytes[at..].to_vec(),
        })
    }
}

impl LogEvent for UpdateEvent {
    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.touched.len() as u32).to_le_bytes());
        for ino in &self.touched {
            buf.extend_from_slice(&ino.to_le_bytes());
        }
        buf.extend_from_slice(&self.payload);
    }

    fn update_segment(&self, segment: &LogSegment) {
        segment.note_dirty(&self.touched);
    }

    fn replay(&mut self, cache: &dyn MetadataCache, segment: &Arc<LogSegment>) {
        // Replay rebuilds the same per-segment dirty state a live submit
        // records.
        segment.note_dirty(&self.touched);
        cache.apply_update(self.event_type, &self.payload);
    }
}
