//! Fixed-budget circular store of full-state snapshots.
//!
//! This module provides the single building block every history tier is an
//! instance of: a byte-budgeted ring of variable-length opaque payloads
//! keyed by a strictly increasing frame number.
//!
//! # Design
//!
//! The store uses a two-part layout:
//! - **Index**: `VecDeque` of `(frame, start, len)` entries, oldest first
//! - **Arena**: one fixed circular byte region holding every live payload
//!
//! Payloads are streamed straight into the arena; when an in-progress write
//! runs out of free ring space, the oldest entries are evicted one at a
//! time (firing a per-eviction callback) until the write fits. Eviction is
//! strict FIFO by frame, never by access recency. Because entries are only
//! ever appended at the head and reclaimed from the tail, the live region
//! stays contiguous in ring space and free space is exactly
//! `capacity - used`.
//!
//! # Admission
//!
//! Unforced captures pass through a deterministic spacing policy driven by
//! `target_frame_length`: the store estimates how many frames apart entries
//! must be for the arena to span roughly that many frames, using the newest
//! entry's stored size as the size estimate. Forced captures bypass the
//! policy but never the byte budget.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use crate::codec;

/// Bytes per megabyte, the unit tier budgets are expressed in.
pub(crate) const MEGABYTE: usize = 1024 * 1024;

/// Upper bound accepted for any single serialized payload length read back
/// from a persisted stream.
pub(crate) const MAX_SNAPSHOT_BYTES: usize = 1 << 30;

/// Construction-time configuration for one ring store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Arena byte budget, in megabytes.
    pub buffer_mb: u32,
    /// Spacing heuristic parameter; see the module docs.
    pub target_frame_length: u32,
    /// Deflate-encode payloads on the way into the arena.
    pub use_compression: bool,
}

/// Errors raised by [`RingStateStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A capture was attempted with a frame at or below the newest stored
    /// frame. The store is left untouched.
    #[error("frame {frame} is not greater than newest stored frame {newest}")]
    NonMonotonicFrame {
        /// The offending frame.
        frame: u64,
        /// The newest frame currently stored.
        newest: u64,
    },
    /// A positional read was out of range.
    #[error("state index {index} out of range for {count} entries")]
    IndexOutOfRange {
        /// The requested position.
        index: usize,
        /// The number of live entries.
        count: usize,
    },
    /// A single payload was larger than the entire arena.
    #[error("a single state cannot exceed the {capacity}-byte arena")]
    StateTooLarge {
        /// The arena byte budget.
        capacity: usize,
    },
    /// The store configuration is unusable.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(&'static str),
    /// A persisted stream was malformed or truncated.
    #[error("corrupt history stream: {0}")]
    Corrupt(String),
    /// A stored payload failed to decode.
    #[error("stored state failed to decode: {0}")]
    DataCorruption(String),
    /// An underlying I/O operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Index record for one live payload.
#[derive(Debug, Clone, Copy)]
struct EntryInfo {
    frame: u64,
    start: usize,
    len: usize,
}

/// A fixed-byte-budget circular store of frame-keyed snapshots.
pub struct RingStateStore {
    arena: Box<[u8]>,
    index: VecDeque<EntryInfo>,
    target_spacing: u32,
    use_compression: bool,
    used: usize,
    /// Next write offset; always one past the newest entry in ring space.
    head: usize,
}

/// A payload freed by FIFO eviction, handed to the eviction callback.
///
/// The raw stored bytes are copied out of the arena before the region is
/// reused, so the payload stays readable for the duration of the callback
/// and beyond.
pub struct EvictedState {
    raw: Vec<u8>,
    compressed: bool,
}

impl EvictedState {
    /// Stored (post-transform) length in bytes.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.raw.len()
    }

    /// Write the decoded payload into `writer`.
    ///
    /// # Errors
    ///
    /// [`StoreError::DataCorruption`] when the stored bytes fail to decode,
    /// or the destination's error otherwise.
    pub fn copy_to(&self, writer: &mut dyn Write) -> Result<u64, StoreError> {
        if self.compressed {
            let mut decoder = codec::decoder(&self.raw[..]);
            io::copy(&mut decoder, writer).map_err(|e| StoreError::DataCorruption(e.to_string()))
        } else {
            writer.write_all(&self.raw)?;
            Ok(self.raw.len() as u64)
        }
    }
}

/// Streams a payload into the ring, evicting the oldest entries as needed.
struct ArenaWriter<'a, E> {
    arena: &'a mut [u8],
    index: &'a mut VecDeque<EntryInfo>,
    used: &'a mut usize,
    on_evict: &'a mut E,
    compressed: bool,
    start: usize,
    written: usize,
    /// A `StoreError` raised mid-write, smuggled past the `io::Write`
    /// signature and recovered by `capture`.
    deferred: Option<StoreError>,
}

impl<E> ArenaWriter<'_, E>
where
    E: FnMut(u64, EvictedState) -> Result<(), StoreError>,
{
    fn evict_oldest(&mut self) -> Result<(), StoreError> {
        let Some(entry) = self.index.pop_front() else {
            return Err(StoreError::StateTooLarge {
                capacity: self.arena.len(),
            });
        };
        *self.used -= entry.len;
        let (a, b) = ring_slices(self.arena, entry.start, entry.len);
        let mut raw = Vec::with_capacity(entry.len);
        raw.extend_from_slice(a);
        raw.extend_from_slice(b);
        (self.on_evict)(
            entry.frame,
            EvictedState {
                raw,
                compressed: self.compressed,
            },
        )
    }
}

impl<E> Write for ArenaWriter<'_, E>
where
    E: FnMut(u64, EvictedState) -> Result<(), StoreError>,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let capacity = self.arena.len();
        let mut offset = 0;
        while offset < buf.len() {
            let free = capacity - *self.used - self.written;
            if free == 0 {
                if let Err(err) = self.evict_oldest() {
                    self.deferred = Some(err);
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "arena write aborted",
                    ));
                }
                continue;
            }
            let pos = (self.start + self.written) % capacity;
            let chunk = free.min(capacity - pos).min(buf.len() - offset);
            self.arena[pos..pos + chunk].copy_from_slice(&buf[offset..offset + chunk]);
            self.written += chunk;
            offset += chunk;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RingStateStore {
    /// Create an empty store with the given budget and spacing policy.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] for a zero or oversized budget or a
    /// zero spacing parameter.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        if config.buffer_mb == 0 {
            return Err(StoreError::InvalidConfig(
                "buffer size must be at least one megabyte",
            ));
        }
        if config.buffer_mb > crate::settings::MAX_BUFFER_MB {
            return Err(StoreError::InvalidConfig("buffer size exceeds the maximum"));
        }
        if config.target_frame_length == 0 {
            return Err(StoreError::InvalidConfig(
                "target frame length must be greater than zero",
            ));
        }
        let capacity = config.buffer_mb as usize * MEGABYTE;
        Ok(Self {
            arena: vec![0; capacity].into_boxed_slice(),
            index: VecDeque::new(),
            target_spacing: config.target_frame_length,
            use_compression: config.use_compression,
            used: 0,
            head: 0,
        })
    }

    /// Number of live entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.index.len()
    }

    /// Arena byte budget.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Bytes occupied by live entries.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Whether payloads are stored deflate-encoded.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.use_compression
    }

    /// Frame of the newest live entry, if any.
    #[must_use]
    pub fn newest_frame(&self) -> Option<u64> {
        self.index.back().map(|e| e.frame)
    }

    /// Frame of the oldest live entry, if any.
    #[must_use]
    pub fn oldest_frame(&self) -> Option<u64> {
        self.index.front().map(|e| e.frame)
    }

    /// Live frames, oldest to newest.
    pub fn frames(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.iter().map(|e| e.frame)
    }

    /// Whether `frame` is live in this store.
    #[must_use]
    pub fn has_frame(&self, frame: u64) -> bool {
        self.index
            .binary_search_by(|e| e.frame.cmp(&frame))
            .is_ok()
    }

    /// Position and frame of the newest entry at or before `frame`.
    #[must_use]
    pub fn closest_at_or_before(&self, frame: u64) -> Option<(usize, u64)> {
        let pos = self.index.partition_point(|e| e.frame <= frame);
        pos.checked_sub(1).map(|p| (p, self.index[p].frame))
    }

    /// How many frames apart entries should be, given the current fill.
    ///
    /// Uses the newest entry's stored size as the estimate for incoming
    /// payloads: the arena then spans roughly `target_frame_length` frames
    /// once full. Always at least one.
    fn ideal_interval(&self) -> u64 {
        let Some(newest) = self.index.back() else {
            return 1;
        };
        if newest.len == 0 {
            return 1;
        }
        let raw =
            f64::from(self.target_spacing) * newest.len as f64 / self.arena.len() as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let interval = raw.round() as u64;
        interval.max(1)
    }

    fn should_capture(&self, frame: u64) -> bool {
        match self.index.back() {
            None => true,
            Some(newest) => frame - newest.frame >= self.ideal_interval(),
        }
    }

    /// Stream one snapshot into the store.
    ///
    /// `frame` must be strictly greater than every frame already stored.
    /// Unless `force` is set, the spacing policy decides whether the frame
    /// is dense enough to retain; a skipped frame returns `Ok(false)` and
    /// leaves the store untouched. Admitted payloads are produced by
    /// `write_state` directly into the arena; when the write outgrows the
    /// free ring space, the oldest entries are evicted one at a time, each
    /// reported through `on_evict` with its frame and still-readable
    /// payload before the region is reused.
    ///
    /// # Errors
    ///
    /// [`StoreError::NonMonotonicFrame`] before any mutation on a frame
    /// ordering violation; [`StoreError::StateTooLarge`] when a single
    /// payload exceeds the whole arena; any error raised by `write_state`
    /// or `on_evict`. On error the new entry is never added to the index.
    pub fn capture<W, E>(
        &mut self,
        frame: u64,
        write_state: W,
        mut on_evict: E,
        force: bool,
    ) -> Result<bool, StoreError>
    where
        W: FnOnce(&mut dyn Write) -> Result<(), StoreError>,
        E: FnMut(u64, EvictedState) -> Result<(), StoreError>,
    {
        if let Some(newest) = self.index.back() {
            if frame <= newest.frame {
                return Err(StoreError::NonMonotonicFrame {
                    frame,
                    newest: newest.frame,
                });
            }
        }
        if !force && !self.should_capture(frame) {
            return Ok(false);
        }

        let start = self.head;
        let compressed = self.use_compression;
        let mut writer = ArenaWriter {
            arena: &mut self.arena,
            index: &mut self.index,
            used: &mut self.used,
            on_evict: &mut on_evict,
            compressed,
            start,
            written: 0,
            deferred: None,
        };

        let write_result = if compressed {
            let mut encoder = codec::encoder(&mut writer);
            match write_state(&mut encoder) {
                Ok(()) => encoder.finish().map(|_| ()).map_err(StoreError::Io),
                Err(err) => Err(err),
            }
        } else {
            write_state(&mut writer)
        };

        let written = writer.written;
        let deferred = writer.deferred.take();
        if let Some(err) = deferred {
            return Err(err);
        }
        write_result?;

        debug_assert!(self.used + written <= self.arena.len());
        self.index.push_back(EntryInfo {
            frame,
            start,
            len: written,
        });
        self.used += written;
        self.head = (start + written) % self.arena.len();
        Ok(true)
    }

    /// Positional read; 0 is the oldest live entry.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexOutOfRange`] when `index >= count()`.
    pub fn get_state(&self, index: usize) -> Result<StateView<'_>, StoreError> {
        match self.index.get(index) {
            Some(entry) => Ok(StateView {
                store: self,
                entry: *entry,
            }),
            None => Err(StoreError::IndexOutOfRange {
                index,
                count: self.index.len(),
            }),
        }
    }

    /// Remove every entry whose frame exceeds `frame`, newest first.
    ///
    /// Returns how many entries were removed.
    pub fn invalidate_after(&mut self, frame: u64) -> usize {
        let mut removed = 0;
        while let Some(newest) = self.index.back().copied() {
            if newest.frame <= frame {
                break;
            }
            self.index.pop_back();
            self.used -= newest.len;
            self.head = newest.start;
            removed += 1;
        }
        if self.index.is_empty() {
            self.head = 0;
        }
        removed
    }

    /// Drop entries whose frame fails the predicate, compacting the arena.
    ///
    /// Relative order of survivors is preserved.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(u64) -> bool,
    {
        let mut arena = vec![0u8; self.arena.len()].into_boxed_slice();
        let mut index = VecDeque::with_capacity(self.index.len());
        let mut pos = 0;
        for entry in &self.index {
            if !keep(entry.frame) {
                continue;
            }
            let (a, b) = ring_slices(&self.arena, entry.start, entry.len);
            arena[pos..pos + a.len()].copy_from_slice(a);
            arena[pos + a.len()..pos + entry.len].copy_from_slice(b);
            index.push_back(EntryInfo {
                frame: entry.frame,
                start: pos,
                len: entry.len,
            });
            pos += entry.len;
        }
        self.arena = arena;
        self.index = index;
        self.used = pos;
        self.head = pos % self.arena.len();
    }

    /// Serialize the whole store.
    ///
    /// Layout: `[capacity u64][target_spacing u32][compression u8]
    /// [count u32][(frame u64, len u32)...][payload bytes oldest..newest]`,
    /// all little-endian.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    pub fn save_state(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(&(self.arena.len() as u64).to_le_bytes())?;
        writer.write_all(&self.target_spacing.to_le_bytes())?;
        writer.write_all(&[u8::from(self.use_compression)])?;
        writer.write_all(&(self.index.len() as u32).to_le_bytes())?;
        for entry in &self.index {
            writer.write_all(&entry.frame.to_le_bytes())?;
            writer.write_all(&(entry.len as u32).to_le_bytes())?;
        }
        for entry in &self.index {
            let (a, b) = ring_slices(&self.arena, entry.start, entry.len);
            writer.write_all(a)?;
            writer.write_all(b)?;
        }
        Ok(())
    }

    /// Reconstruct a store serialized by [`save_state`](Self::save_state).
    ///
    /// The result has the same count and the same `(frame, payload)` pair
    /// at every position as the original; the arena is re-laid compactly.
    /// Reconstruction is all-or-nothing.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] on any malformed or truncated stream.
    pub fn create(reader: &mut dyn Read) -> Result<Self, StoreError> {
        let capacity = read_u64(reader)? as usize;
        if capacity == 0 || capacity > crate::settings::MAX_BUFFER_MB as usize * MEGABYTE {
            return Err(StoreError::Corrupt(format!(
                "implausible arena capacity {capacity}"
            )));
        }
        let target_spacing = read_u32(reader)?;
        if target_spacing == 0 {
            return Err(StoreError::Corrupt("zero target spacing".into()));
        }
        let use_compression = read_u8(reader)? != 0;
        let count = read_u32(reader)? as usize;

        let mut index = VecDeque::with_capacity(count.min(1 << 20));
        let mut used = 0usize;
        let mut last_frame = None;
        for _ in 0..count {
            let frame = read_u64(reader)?;
            if last_frame.is_some_and(|last| frame <= last) {
                return Err(StoreError::Corrupt(format!(
                    "non-monotonic frame {frame} in serialized index"
                )));
            }
            last_frame = Some(frame);
            let len = read_u32(reader)? as usize;
            if used + len > capacity {
                return Err(StoreError::Corrupt(
                    "serialized entries exceed the arena capacity".into(),
                ));
            }
            index.push_back(EntryInfo {
                frame,
                start: used,
                len,
            });
            used += len;
        }

        let mut arena = vec![0u8; capacity].into_boxed_slice();
        reader
            .read_exact(&mut arena[..used])
            .map_err(truncated)?;

        let head = used % capacity;
        Ok(Self {
            arena,
            index,
            target_spacing,
            use_compression,
            used,
            head,
        })
    }
}

impl std::fmt::Debug for RingStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStateStore")
            .field("capacity", &self.arena.len())
            .field("used", &self.used)
            .field("count", &self.index.len())
            .field("target_spacing", &self.target_spacing)
            .field("use_compression", &self.use_compression)
            .finish()
    }
}

/// A positional view of one stored snapshot.
pub struct StateView<'a> {
    store: &'a RingStateStore,
    entry: EntryInfo,
}

impl StateView<'_> {
    /// Frame this snapshot was captured at.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.entry.frame
    }

    /// Stored (post-transform) length in bytes.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.entry.len
    }

    /// Reader over the raw stored bytes, straight from the arena.
    #[must_use]
    pub fn raw_reader(&self) -> RingReader<'_> {
        let (first, second) =
            ring_slices(&self.store.arena, self.entry.start, self.entry.len);
        RingReader { first, second }
    }

    /// Write the decoded payload into `writer`.
    ///
    /// # Errors
    ///
    /// [`StoreError::DataCorruption`] when the stored bytes fail to decode,
    /// or the destination's error otherwise.
    pub fn copy_to(&self, writer: &mut dyn Write) -> Result<u64, StoreError> {
        if self.store.use_compression {
            let mut decoder = codec::decoder(self.raw_reader());
            io::copy(&mut decoder, writer)
                .map_err(|e| StoreError::DataCorruption(e.to_string()))
        } else {
            let mut reader = self.raw_reader();
            io::copy(&mut reader, writer).map_err(StoreError::Io)
        }
    }

    /// Decoded payload as an owned vector.
    ///
    /// # Errors
    ///
    /// Same conditions as [`copy_to`](Self::copy_to).
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::with_capacity(self.entry.len);
        self.copy_to(&mut out)?;
        Ok(out)
    }
}

/// Zero-copy reader over an entry's (possibly wrapping) arena region.
pub struct RingReader<'a> {
    first: &'a [u8],
    second: &'a [u8],
}

impl Read for RingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.first.is_empty() {
            self.first = std::mem::take(&mut self.second);
        }
        let n = self.first.len().min(buf.len());
        buf[..n].copy_from_slice(&self.first[..n]);
        self.first = &self.first[n..];
        Ok(n)
    }
}

/// Split an entry's ring region into up to two contiguous slices.
fn ring_slices(arena: &[u8], start: usize, len: usize) -> (&[u8], &[u8]) {
    let capacity = arena.len();
    let end = start + len;
    if end <= capacity {
        (&arena[start..end], &[])
    } else {
        (&arena[start..], &arena[..end - capacity])
    }
}

pub(crate) fn truncated(err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        StoreError::Corrupt("unexpected end of stream".into())
    } else {
        StoreError::Io(err)
    }
}

pub(crate) fn read_u8(reader: &mut dyn Read) -> Result<u8, StoreError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf[0])
}

pub(crate) fn read_u32(reader: &mut dyn Read) -> Result<u32, StoreError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(reader: &mut dyn Read) -> Result<u64, StoreError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_le_bytes(buf))
}
