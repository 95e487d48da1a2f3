//! Tiered history of full-state snapshots with bounded total memory.
//!
//! [`StateHistory`] composes three [`RingStateStore`] tiers with different
//! budgets and spacings, a reserved side-table exempt from automatic
//! eviction, a frame-0 anchor installed at engage time, and a bounded cache
//! of materialized payloads.
//!
//! # Coarsening pipeline
//!
//! Every capture lands in the dense Current tier. Entries the Current tier
//! evicts are offered to the coarser Recent tier, which applies its own
//! (wider) spacing policy; entries evicted out of Recent survive into the
//! Ancient tier only when their frame is a multiple of the configured
//! interval, and are dropped permanently otherwise. Recent history is
//! therefore dense, old history sparse, and total memory is the sum of
//! three fixed byte budgets.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::cache::{DecompressionCache, DEFAULT_CACHE_ENTRIES};
use crate::codec;
use crate::settings::{HistorySettings, SettingsError};
use crate::statable::Statable;
use crate::store::{
    read_u32, read_u64, read_u8, RingStateStore, StoreConfig, StoreError, MAX_SNAPSHOT_BYTES,
    MEGABYTE,
};

/// Errors raised by [`StateHistory`] operations.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// An operation that needs the frame-0 anchor ran before `engage`.
    #[error("history is not engaged; call engage() with the initial state first")]
    NotEngaged,
    /// `engage` was called a second time.
    #[error("history is already engaged")]
    AlreadyEngaged,
    /// A tier or reserved-store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The settings are unusable.
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    /// A persisted stream carries settings that differ from the supplied
    /// ones; the history is not restored.
    #[error("serialized settings do not match the supplied settings")]
    SettingsMismatch,
    /// A persisted stream was malformed or truncated.
    #[error("corrupt history stream: {0}")]
    Corrupt(String),
    /// An underlying I/O operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The result of a closest-frame query: the winning frame and its decoded
/// payload.
#[derive(Debug, Clone)]
pub struct ClosestState {
    frame: u64,
    bytes: Bytes,
}

impl ClosestState {
    /// Frame the payload was captured at.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// The decoded payload.
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume the result, keeping only the payload.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Reader over the decoded payload, for `Statable::load_state`.
    pub fn reader(&self) -> impl Read + '_ {
        self.bytes.as_ref()
    }
}

/// Where a closest-frame winner lives; the anchor is the implicit
/// fallback when no store holds a candidate.
enum Source {
    Reserved(Bytes),
    Current(usize),
    Recent(usize),
    Ancient(usize),
}

/// A tiered, bounded-memory history of full-state snapshots.
pub struct StateHistory {
    settings: HistorySettings,
    /// Frame-0 fallback; present once `engage` has run.
    anchor: Option<Bytes>,
    current: RingStateStore,
    recent: RingStateStore,
    ancient: RingStateStore,
    /// Reserved snapshots, exempt from every budget; payloads are stored
    /// codec-encoded like tier payloads.
    reserved: BTreeMap<u64, Bytes>,
    cache: DecompressionCache,
}

impl StateHistory {
    /// Create an empty, not-yet-engaged history.
    ///
    /// # Errors
    ///
    /// [`HistoryError::Settings`] when the settings fail validation.
    pub fn new(settings: HistorySettings) -> Result<Self, HistoryError> {
        settings.validate()?;
        Ok(Self {
            current: RingStateStore::new(&Self::current_config(&settings))?,
            recent: RingStateStore::new(&Self::recent_config(&settings))?,
            ancient: RingStateStore::new(&Self::ancient_config(&settings))?,
            reserved: BTreeMap::new(),
            cache: DecompressionCache::new(DEFAULT_CACHE_ENTRIES),
            anchor: None,
            settings,
        })
    }

    fn current_config(settings: &HistorySettings) -> StoreConfig {
        StoreConfig {
            buffer_mb: settings.current_buffer_mb,
            target_frame_length: settings.current_target_frame_length,
            use_compression: settings.use_compression,
        }
    }

    fn recent_config(settings: &HistorySettings) -> StoreConfig {
        StoreConfig {
            buffer_mb: settings.recent_buffer_mb,
            target_frame_length: settings.recent_target_frame_length,
            use_compression: settings.use_compression,
        }
    }

    fn ancient_config(settings: &HistorySettings) -> StoreConfig {
        StoreConfig {
            buffer_mb: settings.ancient_buffer_mb,
            // The ancient tier admits by interval, not by spacing; captures
            // into it are forced, so the spacing parameter is inert.
            target_frame_length: settings.ancient_state_interval,
            use_compression: settings.use_compression,
        }
    }

    /// The settings this history was built with.
    #[must_use]
    pub fn settings(&self) -> &HistorySettings {
        &self.settings
    }

    /// Whether `engage` has installed the frame-0 anchor.
    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.anchor.is_some()
    }

    /// Install the frame-0 anchor. Must run exactly once, before the first
    /// capture; every closest-frame query can fall back to it.
    ///
    /// # Errors
    ///
    /// [`HistoryError::AlreadyEngaged`] on a second call.
    pub fn engage(&mut self, initial_state: impl Into<Bytes>) -> Result<(), HistoryError> {
        if self.anchor.is_some() {
            return Err(HistoryError::AlreadyEngaged);
        }
        let bytes = initial_state.into();
        tracing::debug!(len = bytes.len(), "engaged history with frame-0 anchor");
        self.anchor = Some(bytes);
        Ok(())
    }

    /// Capture the source's state at `frame` through the coarsening
    /// pipeline.
    ///
    /// Returns whether the Current tier actually retained the frame; a
    /// frame thinned out by the spacing policy returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::NotEngaged`] before `engage`;
    /// [`StoreError::NonMonotonicFrame`] when `frame` does not exceed the
    /// newest frame in the Current tier; any serialization or codec error.
    pub fn capture(&mut self, frame: u64, source: &dyn Statable) -> Result<bool, HistoryError> {
        if self.anchor.is_none() {
            return Err(HistoryError::NotEngaged);
        }
        let interval = u64::from(self.settings.ancient_state_interval);
        let Self {
            current,
            recent,
            ancient,
            ..
        } = self;
        let stored = current.capture(
            frame,
            |w| source.save_state(w).map_err(StoreError::Io),
            |demoted_frame, demoted| {
                recent.capture(
                    demoted_frame,
                    |w| demoted.copy_to(w).map(|_| ()),
                    |old_frame, old| {
                        if old_frame % interval == 0 {
                            ancient.capture(
                                old_frame,
                                |w| old.copy_to(w).map(|_| ()),
                                |_, _| Ok(()),
                                true,
                            )?;
                        }
                        Ok(())
                    },
                    false,
                )?;
                Ok(())
            },
            false,
        )?;
        Ok(stored)
    }

    /// Capture the source's state at `frame` directly into the reserved
    /// set, bypassing every tier and byte budget. Reserved snapshots are
    /// only removed by [`evict_reserved`](Self::evict_reserved) or
    /// [`invalidate_after`](Self::invalidate_after).
    ///
    /// # Errors
    ///
    /// [`HistoryError::NotEngaged`] before `engage`;
    /// [`StoreError::NonMonotonicFrame`] when `frame` does not exceed the
    /// newest live reserved frame; any serialization error.
    pub fn capture_reserved(
        &mut self,
        frame: u64,
        source: &dyn Statable,
    ) -> Result<(), HistoryError> {
        if self.anchor.is_none() {
            return Err(HistoryError::NotEngaged);
        }
        if let Some((&newest, _)) = self.reserved.last_key_value() {
            if frame <= newest {
                return Err(StoreError::NonMonotonicFrame { frame, newest }.into());
            }
        }
        let mut buf = Vec::new();
        if self.settings.use_compression {
            let mut encoder = codec::encoder(&mut buf);
            source.save_state(&mut encoder)?;
            encoder.finish()?;
        } else {
            source.save_state(&mut buf)?;
        }
        self.reserved.insert(frame, Bytes::from(buf));
        Ok(())
    }

    /// Remove one reserved snapshot. Returns whether it was present.
    pub fn evict_reserved(&mut self, frame: u64) -> bool {
        let removed = self.reserved.remove(&frame).is_some();
        if removed {
            self.cache.remove(frame);
        }
        removed
    }

    /// The snapshot with the greatest stored frame at or below `frame`.
    ///
    /// Searches reserved, then the three tiers, and finally the anchor, so
    /// the query is total for every engaged history. A reserved frame wins
    /// a tie against an automatic tier. The payload is served through the
    /// decompression cache.
    ///
    /// # Errors
    ///
    /// [`HistoryError::NotEngaged`] before `engage`; codec failures
    /// surface as [`StoreError::DataCorruption`].
    pub fn get_state_closest_to(&mut self, frame: u64) -> Result<ClosestState, HistoryError> {
        if self.anchor.is_none() {
            return Err(HistoryError::NotEngaged);
        }

        let mut best: Option<(u64, Source)> = None;
        if let Some((&f, raw)) = self.reserved.range(..=frame).next_back() {
            best = Some((f, Source::Reserved(raw.clone())));
        }
        let tiers = [
            (&self.current, Source::Current as fn(usize) -> Source),
            (&self.recent, Source::Recent as fn(usize) -> Source),
            (&self.ancient, Source::Ancient as fn(usize) -> Source),
        ];
        for (store, make) in tiers {
            if let Some((pos, f)) = store.closest_at_or_before(frame) {
                if best.as_ref().map_or(true, |(bf, _)| f > *bf) {
                    best = Some((f, make(pos)));
                }
            }
        }
        let Some((winner, source)) = best else {
            let bytes = self.anchor.clone().ok_or(HistoryError::NotEngaged)?;
            return Ok(ClosestState { frame: 0, bytes });
        };
        if let Some(bytes) = self.cache.get(winner) {
            return Ok(ClosestState {
                frame: winner,
                bytes,
            });
        }

        let bytes = match source {
            Source::Reserved(raw) => self.decode_reserved(&raw)?,
            Source::Current(pos) => Bytes::from(self.current.get_state(pos)?.to_bytes()?),
            Source::Recent(pos) => Bytes::from(self.recent.get_state(pos)?.to_bytes()?),
            Source::Ancient(pos) => Bytes::from(self.ancient.get_state(pos)?.to_bytes()?),
        };
        self.cache.insert(winner, bytes.clone());
        Ok(ClosestState {
            frame: winner,
            bytes,
        })
    }

    fn decode_reserved(&self, raw: &Bytes) -> Result<Bytes, HistoryError> {
        if !self.settings.use_compression {
            return Ok(raw.clone());
        }
        let mut out = Vec::new();
        codec::decoder(raw.as_ref())
            .read_to_end(&mut out)
            .map_err(|e| StoreError::DataCorruption(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    /// Whether `frame` itself is retained anywhere in the history.
    #[must_use]
    pub fn has_state(&self, frame: u64) -> bool {
        if self.anchor.is_none() {
            return false;
        }
        frame == 0
            || self.reserved.contains_key(&frame)
            || self.current.has_frame(frame)
            || self.recent.has_frame(frame)
            || self.ancient.has_frame(frame)
    }

    /// The greatest frame presently retained, across every tier, the
    /// reserved set, and the anchor. `None` before `engage`.
    #[must_use]
    pub fn last(&self) -> Option<u64> {
        self.anchor.as_ref()?;
        let mut last = 0u64;
        for store in [&self.current, &self.recent, &self.ancient] {
            if let Some(frame) = store.newest_frame() {
                last = last.max(frame);
            }
        }
        if let Some((&frame, _)) = self.reserved.last_key_value() {
            last = last.max(frame);
        }
        Some(last)
    }

    /// Number of distinct retained frames across the union of every store;
    /// a frame present both in a tier and in reserved counts once.
    #[must_use]
    pub fn count(&self) -> usize {
        let mut frames = BTreeSet::new();
        if self.anchor.is_some() {
            frames.insert(0);
        }
        frames.extend(self.reserved.keys().copied());
        for store in [&self.current, &self.recent, &self.ancient] {
            frames.extend(store.frames());
        }
        frames.len()
    }

    /// Remove every snapshot whose frame exceeds `frame`, in every tier,
    /// in the reserved set, and in the decompression cache. Required
    /// whenever the authoritative timeline is rewritten at or before
    /// `frame`: snapshots past the edit point are no longer valid futures.
    pub fn invalidate_after(&mut self, frame: u64) {
        let removed = self.current.invalidate_after(frame)
            + self.recent.invalidate_after(frame)
            + self.ancient.invalidate_after(frame);
        let stale_reserved = match frame.checked_add(1) {
            Some(cut) => self.reserved.split_off(&cut),
            // Nothing can exceed u64::MAX.
            None => BTreeMap::new(),
        };
        self.cache.retain_at_or_before(frame);
        tracing::debug!(
            frame,
            tier_removed = removed,
            reserved_removed = stale_reserved.len(),
            "invalidated history after frame"
        );
    }

    /// Serialize settings, anchor, all three tiers, and the reserved set.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    pub fn save_state(&self, writer: &mut dyn Write) -> Result<(), HistoryError> {
        self.settings.write_to(writer)?;
        match &self.anchor {
            Some(bytes) => {
                writer.write_all(&[1])?;
                writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
                writer.write_all(bytes)?;
            }
            None => writer.write_all(&[0])?,
        }
        self.current.save_state(writer)?;
        self.recent.save_state(writer)?;
        self.ancient.save_state(writer)?;
        writer.write_all(&(self.reserved.len() as u32).to_le_bytes())?;
        for (&frame, bytes) in &self.reserved {
            writer.write_all(&frame.to_le_bytes())?;
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(bytes)?;
        }
        Ok(())
    }

    /// Reconstruct a history serialized by [`save_state`](Self::save_state).
    ///
    /// `is_stale` lets the caller mark stored frames as already invalid
    /// (for example, ones that fail an external freshness check); any frame
    /// it returns `true` for is dropped during reconstruction instead of
    /// restored. The anchor is never dropped. Reconstruction is
    /// all-or-nothing: on any error no history is returned.
    ///
    /// # Errors
    ///
    /// [`HistoryError::SettingsMismatch`] when the serialized settings
    /// differ from `settings`; [`HistoryError::Corrupt`] (or
    /// [`StoreError::Corrupt`]) on a malformed or truncated stream.
    pub fn create<F>(
        reader: &mut dyn Read,
        settings: HistorySettings,
        mut is_stale: F,
    ) -> Result<Self, HistoryError>
    where
        F: FnMut(u64) -> bool,
    {
        settings.validate()?;
        let stored = HistorySettings::read_from(reader).map_err(truncated)?;
        if stored != settings {
            return Err(HistoryError::SettingsMismatch);
        }

        let anchor = match read_u8(reader)? {
            0 => None,
            1 => {
                let len = read_u64(reader)? as usize;
                if len > MAX_SNAPSHOT_BYTES {
                    return Err(HistoryError::Corrupt(format!(
                        "implausible anchor length {len}"
                    )));
                }
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf).map_err(truncated)?;
                Some(Bytes::from(buf))
            }
            other => {
                return Err(HistoryError::Corrupt(format!(
                    "invalid anchor marker {other}"
                )))
            }
        };

        let mut current = RingStateStore::create(reader)?;
        let mut recent = RingStateStore::create(reader)?;
        let mut ancient = RingStateStore::create(reader)?;
        check_tier(&current, stored.current_buffer_mb, stored.use_compression, "current")?;
        check_tier(&recent, stored.recent_buffer_mb, stored.use_compression, "recent")?;
        check_tier(&ancient, stored.ancient_buffer_mb, stored.use_compression, "ancient")?;
        current.retain(|f| !is_stale(f));
        recent.retain(|f| !is_stale(f));
        ancient.retain(|f| !is_stale(f));

        let reserved_count = read_u32(reader)? as usize;
        let mut reserved = BTreeMap::new();
        let mut last_frame = None;
        for _ in 0..reserved_count {
            let frame = read_u64(reader)?;
            if last_frame.is_some_and(|last| frame <= last) {
                return Err(HistoryError::Corrupt(format!(
                    "non-monotonic reserved frame {frame}"
                )));
            }
            last_frame = Some(frame);
            let len = read_u32(reader)? as usize;
            if len > MAX_SNAPSHOT_BYTES {
                return Err(HistoryError::Corrupt(format!(
                    "implausible reserved payload length {len}"
                )));
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).map_err(truncated)?;
            if !is_stale(frame) {
                reserved.insert(frame, Bytes::from(buf));
            }
        }

        Ok(Self {
            settings: stored,
            anchor,
            current,
            recent,
            ancient,
            reserved,
            cache: DecompressionCache::new(DEFAULT_CACHE_ENTRIES),
        })
    }
}

impl std::fmt::Debug for StateHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHistory")
            .field("engaged", &self.anchor.is_some())
            .field("current", &self.current)
            .field("recent", &self.recent)
            .field("ancient", &self.ancient)
            .field("reserved", &self.reserved.len())
            .finish()
    }
}

fn check_tier(
    store: &RingStateStore,
    buffer_mb: u32,
    compression: bool,
    name: &str,
) -> Result<(), HistoryError> {
    if store.capacity() != buffer_mb as usize * MEGABYTE || store.is_compressed() != compression {
        return Err(HistoryError::Corrupt(format!(
            "{name} tier geometry disagrees with the serialized settings"
        )));
    }
    Ok(())
}

fn truncated(err: io::Error) -> HistoryError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        HistoryError::Corrupt("unexpected end of stream".into())
    } else {
        HistoryError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test double for the state-serializable collaborator: a frame id up
    /// front, then inert padding.
    struct StateSource {
        frame: u64,
        padding: usize,
    }

    impl StateSource {
        fn new(padding: usize) -> Self {
            Self { frame: 0, padding }
        }

        fn frame_in(bytes: &[u8]) -> u64 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            u64::from_le_bytes(buf)
        }
    }

    impl Statable for StateSource {
        fn save_state(&self, writer: &mut dyn Write) -> io::Result<()> {
            writer.write_all(&self.frame.to_le_bytes())?;
            writer.write_all(&vec![0u8; self.padding])
        }

        fn load_state(&mut self, reader: &mut dyn Read) -> io::Result<()> {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            self.frame = u64::from_le_bytes(buf);
            let mut padding = vec![0u8; self.padding];
            reader.read_exact(&mut padding)
        }
    }

    fn small_settings() -> HistorySettings {
        HistorySettings {
            current_buffer_mb: 1,
            current_target_frame_length: 10_000,
            recent_buffer_mb: 1,
            recent_target_frame_length: 100_000,
            ancient_buffer_mb: 1,
            ancient_state_interval: 50_000,
            use_compression: false,
        }
    }

    fn engaged_history(source: &StateSource) -> StateHistory {
        let mut history = StateHistory::new(small_settings()).unwrap();
        let mut initial = Vec::new();
        source.save_state(&mut initial).unwrap();
        history.engage(initial).unwrap();
        history
    }

    #[test]
    fn capture_requires_engage() {
        let mut history = StateHistory::new(small_settings()).unwrap();
        let source = StateSource::new(1000);
        assert!(matches!(
            history.capture(1, &source),
            Err(HistoryError::NotEngaged)
        ));
        assert!(matches!(
            history.get_state_closest_to(0),
            Err(HistoryError::NotEngaged)
        ));
    }

    #[test]
    fn double_engage_rejected() {
        let mut history = StateHistory::new(small_settings()).unwrap();
        history.engage(vec![0u8; 8]).unwrap();
        assert!(matches!(
            history.engage(vec![0u8; 8]),
            Err(HistoryError::AlreadyEngaged)
        ));
    }

    #[test]
    fn spacing_policy_sets_last_and_count() {
        // 1008-byte states against a 1 MiB current tier with spacing
        // 10000: the tier retains every 10th frame, so 1..=19 leaves
        // frames {1, 11} plus the anchor.
        let mut source = StateSource::new(1000);
        let mut history = engaged_history(&source);
        for frame in 1..20u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        assert_eq!(history.last(), Some(11));
        assert_eq!(history.count(), 3);
        assert!(history.has_state(11));
        assert!(!history.has_state(12));
        assert_eq!(history.get_state_closest_to(20).unwrap().frame(), 11);
    }

    #[test]
    fn reserved_outranks_the_dense_window() {
        let mut source = StateSource::new(1000);
        let mut history = engaged_history(&source);
        source.frame = 1000;
        history.capture_reserved(1000, &source).unwrap();
        for frame in 1..20u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        assert_eq!(history.last(), Some(1000));
        assert!(history.has_state(1000));
        let closest = history.get_state_closest_to(1001).unwrap();
        assert_eq!(closest.frame(), 1000);
        assert_eq!(StateSource::frame_in(closest.bytes()), 1000);
    }

    #[test]
    fn reserved_wins_frame_ties() {
        let mut source = StateSource::new(100);
        let mut history = engaged_history(&source);
        source.frame = 1;
        history.capture(1, &source).unwrap();
        // Same frame reserved with a distinguishable payload.
        let mut tagged = StateSource::new(100);
        tagged.frame = 1;
        history.capture_reserved(1, &tagged).unwrap();
        let closest = history.get_state_closest_to(1).unwrap();
        assert_eq!(closest.frame(), 1);
    }

    #[test]
    fn count_includes_reserved_and_anchor_once() {
        let mut source = StateSource::new(1000);
        let mut history = engaged_history(&source);
        source.frame = 1000;
        history.capture_reserved(1000, &source).unwrap();
        for frame in 1..20u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        // anchor + {1, 11} + reserved 1000
        assert_eq!(history.count(), 4);
    }

    #[test]
    fn capture_reserved_rejects_non_monotonic() {
        let mut source = StateSource::new(100);
        let mut history = engaged_history(&source);
        history.capture_reserved(10, &source).unwrap();
        assert!(matches!(
            history.capture_reserved(10, &source),
            Err(HistoryError::Store(StoreError::NonMonotonicFrame { .. }))
        ));
        // Eviction lowers the floor again.
        assert!(history.evict_reserved(10));
        history.capture_reserved(5, &source).unwrap();
    }

    #[test]
    fn invalidate_after_removes_reserved_and_cached() {
        let mut source = StateSource::new(1000);
        let mut history = engaged_history(&source);
        source.frame = 1000;
        history.capture_reserved(1000, &source).unwrap();
        for frame in 1..10u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        // Materialize 1000 into the cache before the cut.
        assert_eq!(history.get_state_closest_to(1000).unwrap().frame(), 1000);
        history.invalidate_after(999);
        assert!(!history.has_state(1000));
        assert!(history.get_state_closest_to(1000).unwrap().frame() < 1000);
    }

    #[test]
    fn invalidation_keeps_the_anchor_reachable() {
        let mut source = StateSource::new(1000);
        let mut history = engaged_history(&source);
        for frame in 1..10u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        history.invalidate_after(0);
        assert_eq!(history.count(), 1);
        assert_eq!(history.get_state_closest_to(u64::MAX).unwrap().frame(), 0);
        // The timeline restarts below the old captures.
        source.frame = 1;
        history.capture(1, &source).unwrap();
        assert_eq!(history.last(), Some(1));
    }

    #[test]
    fn closest_payload_matches_key_across_tiers() {
        let mut source = StateSource::new(1000);
        let mut history = engaged_history(&source);
        for frame in 0..=10_440u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        let closest = history.get_state_closest_to(10_440).unwrap();
        assert!(closest.frame() <= 10_440);
        assert_eq!(StateSource::frame_in(closest.bytes()), closest.frame());
        // A second query is served from the cache with identical results.
        let again = history.get_state_closest_to(10_440).unwrap();
        assert_eq!(again.frame(), closest.frame());
        assert_eq!(again.bytes(), closest.bytes());
    }

    #[test]
    fn save_create_round_trip_preserves_membership() {
        let mut source = StateSource::new(500);
        let mut history = engaged_history(&source);
        source.frame = 2000;
        history.capture_reserved(2000, &source).unwrap();
        for frame in 1..500u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }

        let mut buf = Vec::new();
        history.save_state(&mut buf).unwrap();
        let mut restored =
            StateHistory::create(&mut buf.as_slice(), *history.settings(), |_| false).unwrap();

        assert_eq!(restored.settings(), history.settings());
        assert_eq!(restored.count(), history.count());
        assert_eq!(restored.last(), history.last());
        for frame in 0..2100u64 {
            assert_eq!(restored.has_state(frame), history.has_state(frame));
        }
        let a = history.get_state_closest_to(2100).unwrap();
        let b = restored.get_state_closest_to(2100).unwrap();
        assert_eq!(a.frame(), b.frame());
        assert_eq!(a.bytes(), b.bytes());
    }

    #[test]
    fn save_create_round_trip_without_engage() {
        let history = StateHistory::new(small_settings()).unwrap();
        let mut buf = Vec::new();
        history.save_state(&mut buf).unwrap();
        let restored =
            StateHistory::create(&mut buf.as_slice(), small_settings(), |_| false).unwrap();
        assert!(!restored.is_engaged());
        assert_eq!(restored.settings(), &small_settings());
        assert_eq!(restored.count(), 0);
    }

    #[test]
    fn create_rejects_mismatched_settings() {
        let history = StateHistory::new(small_settings()).unwrap();
        let mut buf = Vec::new();
        history.save_state(&mut buf).unwrap();
        let mut other = small_settings();
        other.current_buffer_mb = 2;
        assert!(matches!(
            StateHistory::create(&mut buf.as_slice(), other, |_| false),
            Err(HistoryError::SettingsMismatch)
        ));
    }

    #[test]
    fn create_drops_frames_marked_stale() {
        let mut source = StateSource::new(500);
        let mut history = engaged_history(&source);
        source.frame = 3000;
        history.capture_reserved(3000, &source).unwrap();
        for frame in 1..100u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        let kept: Vec<u64> = (0..3001).filter(|f| history.has_state(*f)).collect();

        let mut buf = Vec::new();
        history.save_state(&mut buf).unwrap();
        let restored =
            StateHistory::create(&mut buf.as_slice(), *history.settings(), |f| f >= 50).unwrap();

        for frame in kept {
            let expected = frame < 50 || frame == 0;
            assert_eq!(restored.has_state(frame), expected, "frame {frame}");
        }
        assert!(!restored.has_state(3000));
        // The anchor survives the predicate.
        assert!(restored.has_state(0));
    }

    #[test]
    fn create_rejects_truncated_stream() {
        let mut source = StateSource::new(500);
        let mut history = engaged_history(&source);
        for frame in 1..50u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        let mut buf = Vec::new();
        history.save_state(&mut buf).unwrap();
        buf.truncate(buf.len() - 100);
        let err = StateHistory::create(&mut buf.as_slice(), *history.settings(), |_| false)
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::Corrupt(_) | HistoryError::Store(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn compressed_history_round_trips() {
        let mut settings = small_settings();
        settings.use_compression = true;
        let mut history = StateHistory::new(settings).unwrap();
        let mut source = StateSource::new(1000);
        let mut initial = Vec::new();
        source.save_state(&mut initial).unwrap();
        history.engage(initial).unwrap();

        source.frame = 40;
        history.capture_reserved(40, &source).unwrap();
        for frame in 1..30u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        let closest = history.get_state_closest_to(40).unwrap();
        assert_eq!(closest.frame(), 40);
        assert_eq!(StateSource::frame_in(closest.bytes()), 40);
        assert_eq!(closest.bytes().len(), 1008);

        let mut buf = Vec::new();
        history.save_state(&mut buf).unwrap();
        let mut restored =
            StateHistory::create(&mut buf.as_slice(), settings, |_| false).unwrap();
        let closest = restored.get_state_closest_to(40).unwrap();
        assert_eq!(StateSource::frame_in(closest.bytes()), 40);
    }

    #[test]
    fn load_state_round_trips_through_closest_query() {
        let mut source = StateSource::new(64);
        let mut history = engaged_history(&source);
        for frame in 1..10u64 {
            source.frame = frame;
            history.capture(frame, &source).unwrap();
        }
        let closest = history.get_state_closest_to(5).unwrap();
        let mut revived = StateSource::new(64);
        revived.load_state(&mut closest.reader()).unwrap();
        assert_eq!(revived.frame, closest.frame());
    }
}
