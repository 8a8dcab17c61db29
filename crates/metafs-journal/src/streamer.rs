//! The raw streaming journal interface and an in-memory implementation
//!
//! The streamer is a byte-addressed, append-only stream over the object
//! store with three monotonically ordered offsets,
//! `expire_pos <= read_pos <= write_pos`, a durably stored head, and
//! entry-granular append/read. The journal core owns its streamer
//! exclusively; the streamer invokes completions from its own I/O
//! context, never synchronously from inside a call.
//!
//! [`MemStreamer`] backs the stream with shared process memory. Entry
//! frame format:
//!
//! ```text
//! +--------+---------+--------+
//! | Length | Payload | CRC32C |
//! | 4B     | var     | 4B     |
//! +--------+---------+--------+
//! ```

use crate::completion::{Completion, Finisher};
use bytes::Bytes;
use metafs_common::{Error, Result, StripeLayout};
use parking_lot::Mutex;
use std::sync::Arc;

/// Per-entry framing overhead added by [`MemStreamer`] (length + CRC)
pub const FRAME_OVERHEAD: usize = 8;

/// Byte-addressed append-only stream over the object store
pub trait Streamer: Send {
    /// Reset to an empty stream with all offsets zeroed and write the
    /// state in memory; used by the create lifecycle.
    fn reset(&mut self);

    /// Read the durable head and probe the stream to establish valid
    /// offsets. `on_ready` fires once the streamer is active.
    fn recover(&mut self, on_ready: Completion);

    /// Durably rewrite the head with the current offsets
    fn write_head(&mut self, on_safe: Completion);

    /// Append one entry at `write_pos`, advancing it. The entry becomes
    /// durable and readable once flushed.
    fn append_entry(&mut self, entry: Bytes);

    /// Start flushing everything appended so far. `on_safe`, if given,
    /// fires once those bytes are durable.
    fn flush(&mut self, on_safe: Option<Completion>);

    /// Read the entry at `read_pos`, advancing past it. `None` when the
    /// next entry is not yet readable.
    fn try_read_entry(&mut self) -> Result<Option<Bytes>>;

    /// Whether an entry can be read at `read_pos` right now
    fn is_readable(&self) -> bool;

    /// Whether reset or recovery has completed
    fn is_active(&self) -> bool;

    /// Register `cb` to fire once the stream becomes readable
    fn wait_for_readable(&mut self, cb: Completion);

    fn read_pos(&self) -> u64;
    fn write_pos(&self) -> u64;
    fn expire_pos(&self) -> u64;
    fn set_read_pos(&mut self, pos: u64);
    fn set_expire_pos(&mut self, pos: u64);

    fn layout(&self) -> &StripeLayout;
}

/// Durable streamer head: the offsets and layout persisted out of band
/// from the stream body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamHead {
    pub expire_pos: u64,
    pub read_pos: u64,
    pub write_pos: u64,
    pub layout: StripeLayout,
}

/// Shared in-memory backing for [`MemStreamer`] instances, standing in
/// for the object store. A new streamer over the same backing sees the
/// last durably written head and all flushed bytes.
#[derive(Default)]
pub struct StreamBacking {
    inner: Mutex<BackingState>,
}

#[derive(Default)]
struct BackingState {
    /// Flushed stream bytes, indexed from stream offset 0. Expired
    /// bytes are retained; `expire_pos` only marks them reclaimable.
    data: Vec<u8>,
    head: Option<StreamHead>,
}

impl StreamBacking {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Last durably written head, if any
    pub fn head(&self) -> Option<StreamHead> {
        self.inner.lock().head
    }

    /// Bytes durably flushed so far
    pub fn durable_len(&self) -> u64 {
        self.inner.lock().data.len() as u64
    }
}

/// In-memory streamer over a [`StreamBacking`].
///
/// Appends are buffered and become durable on flush; completions are
/// queued on the finisher and must be drained from a context holding no
/// journal lock.
pub struct MemStreamer {
    backing: Arc<StreamBacking>,
    layout: StripeLayout,
    finisher: Finisher,
    expire_pos: u64,
    read_pos: u64,
    write_pos: u64,
    /// Frames appended since the last flush
    pending: Vec<u8>,
    /// Stream offset where durable data ends and `pending` begins
    flushed_pos: u64,
    active: bool,
    read_waiters: Vec<Completion>,
}

impl MemStreamer {
    pub fn new(backing: Arc<StreamBacking>, layout: StripeLayout, finisher: Finisher) -> Self {
        Self {
            backing,
            layout,
            finisher,
            expire_pos: 0,
            read_pos: 0,
            write_pos: 0,
            pending: Vec::new(),
            flushed_pos: 0,
            active: false,
            read_waiters: Vec::new(),
        }
    }

    fn frame(entry: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(entry.len() + FRAME_OVERHEAD);
        buf.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        buf.extend_from_slice(entry);
        buf.extend_from_slice(&crc32c::crc32c(entry).to_le_bytes());
        buf
    }

    /// Parse the frame at absolute offset `pos`, bounded by `end`.
    /// Returns the payload and the offset of the next frame.
    fn entry_at(data: &[u8], pos: u64, end: u64) -> Result<Option<(Bytes, u64)>> {
        let pos = pos as usize;
        let end = (end as usize).min(data.len());
        if pos + 4 > end {
            return Ok(None);
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let payload_end = pos + 4 + len;
        if payload_end + 4 > end {
            return Ok(None);
        }
        let payload = &data[pos + 4..payload_end];
        let stored_crc = u32::from_le_bytes(data[payload_end..payload_end + 4].try_into().unwrap());
        if crc32c::crc32c(payload) != stored_crc {
            return Err(Error::streamer(format!("entry CRC mismatch at {pos}")));
        }
        Ok(Some((
            Bytes::copy_from_slice(payload),
            (payload_end + 4) as u64,
        )))
    }
}

impl Streamer for MemStreamer {
    fn reset(&mut self) {
        let mut backing = self.backing.inner.lock();
        backing.data.clear();
        backing.head = None;
        drop(backing);

        self.expire_pos = 0;
        self.read_pos = 0;
        self.write_pos = 0;
        self.flushed_pos = 0;
        self.pending.clear();
        self.active = true;
    }

    fn recover(&mut self, on_ready: Completion) {
        let result = {
            let backing = self.backing.inner.lock();
            match backing.head {
                Some(head) => {
                    self.expire_pos = head.expire_pos;
                    self.read_pos = head.read_pos;
                    // The head may be stale: probe past its write_pos for
                    // entries flushed after the last head write.
                    let durable = backing.data.len() as u64;
                    let mut write_pos = head.write_pos;
                    while let Ok(Some((_, next))) =
                        Self::entry_at(&backing.data, write_pos, durable)
                    {
                        write_pos = next;
                    }
                    self.write_pos = write_pos;
                    self.flushed_pos = write_pos;
                    self.active = true;
                    Ok(())
                }
                None => Err(Error::streamer("no journal head to recover")),
            }
        };
        self.finisher.queue(on_ready, result);
    }

    fn write_head(&mut self, on_safe: Completion) {
        let head = StreamHead {
            expire_pos: self.expire_pos,
            read_pos: self.read_pos,
            write_pos: self.write_pos,
            layout: self.layout,
        };
        self.backing.inner.lock().head = Some(head);
        self.finisher.queue(on_safe, Ok(()));
    }

    fn append_entry(&mut self, entry: Bytes) {
        assert!(self.active, "append on an inactive streamer");
        let frame = Self::frame(&entry);
        self.write_pos += frame.len() as u64;
        self.pending.extend_from_slice(&frame);
    }

    fn flush(&mut self, on_safe: Option<Completion>) {
        if !self.pending.is_empty() {
            let mut backing = self.backing.inner.lock();
            backing.data.append(&mut self.pending);
            self.flushed_pos = backing.data.len() as u64;
            drop(backing);

            for waiter in self.read_waiters.drain(..) {
                self.finisher.queue(waiter, Ok(()));
            }
        }
        if let Some(on_safe) = on_safe {
            self.finisher.queue(on_safe, Ok(()));
        }
    }

    fn try_read_entry(&mut self) -> Result<Option<Bytes>> {
        let backing = self.backing.inner.lock();
        match Self::entry_at(&backing.data, self.read_pos, self.flushed_pos)? {
            Some((payload, next)) => {
                self.read_pos = next;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    fn is_readable(&self) -> bool {
        let backing = self.backing.inner.lock();
        matches!(
            Self::entry_at(&backing.data, self.read_pos, self.flushed_pos),
            Ok(Some(_))
        )
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn wait_for_readable(&mut self, cb: Completion) {
        if self.is_readable() {
            self.finisher.queue(cb, Ok(()));
        } else {
            self.read_waiters.push(cb);
        }
    }

    fn read_pos(&self) -> u64 {
        self.read_pos
    }

    fn write_pos(&self) -> u64 {
        self.write_pos
    }

    fn expire_pos(&self) -> u64 {
        self.expire_pos
    }

    fn set_read_pos(&mut self, pos: u64) {
        assert!(pos <= self.write_pos);
        self.read_pos = pos;
    }

    fn set_expire_pos(&mut self, pos: u64) {
        assert!(pos <= self.write_pos);
        self.expire_pos = pos;
    }

    fn layout(&self) -> &StripeLayout {
        &self.layout
    }
}
