//! The engine façade: lifecycle, write serialisation, and the reader path.
//!
//! A single reader-writer lock covers the keydir and the active segment's
//! append offset together (see `DESIGN.md`): writers take the write side,
//! readers the read side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::codec::{self, Limits};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::keydir::{Keydir, KeydirEntry};
use crate::recovery;
use crate::segment::{ActiveSegment, LogStatistics, Segment};

/// A handle to an open store. Cheaply `Clone`-able: every clone shares the
/// same underlying state through an `Arc`, so any number of threads can hold
/// one and call `get`/`set`/`delete` concurrently.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    conf: Config,
    closed: AtomicBool,
    state: RwLock<State>,
}

struct State {
    keydir: Keydir,
    segments: HashMap<u64, Segment>,
    active_id: u64,
}

impl Engine {
    #[tracing::instrument(skip(conf), fields(dir = %dir.display()))]
    pub(crate) fn open(dir: &Path, conf: Config) -> Result<Engine> {
        let limits = Limits {
            max_key_size: conf.max_key_size.as_u64(),
            max_value_size: conf.max_value_size.as_u64(),
        };
        let recovered = recovery::recover(dir, conf.clock.as_ref(), &limits)?;

        let mut segments = recovered.segments;
        // The clock-derived id recovery proposes can collide with an
        // existing segment if the clock runs backward (or is low-resolution)
        // between a close() and the next open() of the same directory.
        // Creating the active segment under a colliding id would silently
        // overwrite that segment's data file and discard its recovered
        // LogStatistics, so the id is advanced past every id already on disk.
        let active_id = match segments.keys().copied().max() {
            Some(max_id) if recovered.active_id <= max_id => {
                warn!(
                    proposed_active_id = recovered.active_id,
                    max_existing_id = max_id,
                    "clock-derived active segment id collided with an existing segment; advancing past it"
                );
                max_id + 1
            }
            _ => recovered.active_id,
        };
        let active = ActiveSegment::create(dir, active_id)?;
        segments.insert(active_id, Segment::Active(active));

        debug!(active_id, segments = segments.len(), "store opened");

        let state = State {
            keydir: recovered.keydir,
            segments,
            active_id,
        };
        Ok(Engine {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                conf,
                closed: AtomicBool::new(false),
                state: RwLock::new(state),
            }),
        })
    }

    /// Looks up `key`. Returns `None` for an absent key or a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let state = self.inner.state.read();
        let entry = match state.keydir.lookup(key) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if entry.is_tombstone() {
            return Ok(None);
        }
        let segment = state.segments.get(&entry.segment_id).ok_or_else(|| {
            Error::corrupt(entry.segment_id, entry.value_pos as u64, "keydir references a segment with no open handle")
        })?;
        segment
            .read_at(entry.value_pos as u64, entry.value_size as u64)
            .map(Some)
            .map_err(|e| as_corrupt_on_short_read(e, entry.segment_id, entry.value_pos as u64))
    }

    /// Writes `value` for `key`, appending unconditionally (no dedup against
    /// the current value: that would cost a disk seek on every write).
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.write();
        self.append_record(&mut state, key, Some(value))
    }

    /// Appends a tombstone for `key` iff it is currently present and live.
    /// Returns whether a tombstone was written.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.inner.state.write();
        match state.keydir.lookup(key) {
            None => Ok(false),
            Some(entry) if entry.is_tombstone() => Ok(false),
            Some(_) => {
                self.append_record(&mut state, key, None)?;
                Ok(true)
            }
        }
    }

    /// Flushes and fsyncs the active segment.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.write();
        Self::active_mut(&mut state)?.sync()
    }

    /// A snapshot of per-segment live/dead key accounting, for an operator
    /// (or a future merge pass) to decide what to compact.
    pub fn stats(&self) -> Result<HashMap<u64, LogStatistics>> {
        self.ensure_open()?;
        let state = self.inner.state.read();
        Ok(state.segments.iter().map(|(id, segment)| (*id, segment.stats())).collect())
    }

    /// Flushes, fsyncs, and releases every segment handle. Idempotent: a
    /// second call is a no-op. Every subsequent operation on this (or any
    /// clone of this) handle fails with `Error::Closed`. If closing more than
    /// one handle fails, the first error is returned and the rest are still
    /// attempted.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.inner.state.write();
        let segments = std::mem::take(&mut state.segments);
        let mut first_err = None;
        for (id, segment) in segments {
            if let Err(e) = segment.close() {
                warn!(segment_id = id, error = %e, "error closing segment");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn active_mut(state: &mut State) -> Result<&mut ActiveSegment> {
        match state.segments.get_mut(&state.active_id) {
            Some(Segment::Active(active)) => Ok(active),
            _ => Err(Error::corrupt(state.active_id, 0, "active segment id does not reference an active handle")),
        }
    }

    #[tracing::instrument(skip(self, state, key, value))]
    fn append_record(&self, state: &mut State, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let timestamp = self.inner.conf.clock.now_nanos();
        let encoded = codec::encode_record(key, value, timestamp);
        let active_id = state.active_id;

        let record_start = {
            let active = Self::active_mut(state)?;
            let start = active.append(&encoded)?;
            if self.inner.conf.sync_on_write {
                active.sync()?;
            } else {
                active.flush()?;
            }
            start
        };

        debug!(
            segment_id = active_id,
            offset = record_start,
            key_len = key.len(),
            value_len = value.map(|v| v.len()),
            "appended record"
        );

        let value_size = value.map(|v| v.len() as i64).unwrap_or(-1);
        let value_pos = codec::value_offset(record_start, key.len() as u64);
        let entry = KeydirEntry {
            segment_id: active_id,
            value_size,
            value_pos: value_pos as i64,
            timestamp,
        };

        if let Some(segment) = state.segments.get_mut(&active_id) {
            if value.is_some() {
                segment.stats_mut().add_live();
            } else {
                segment.stats_mut().add_dead(codec::value_offset(0, key.len() as u64));
            }
        }

        if let Some(prior) = state.keydir.insert_or_replace(key.to_vec(), entry) {
            let prior_len = codec::value_offset(0, key.len() as u64) + prior.value_size.max(0) as u64;
            if let Some(prior_segment) = state.segments.get_mut(&prior.segment_id) {
                prior_segment.stats_mut().overwrite(prior_len);
            }
        }

        self.maybe_rotate(state)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, state))]
    fn maybe_rotate(&self, state: &mut State) -> Result<()> {
        let needs_rotation = match state.segments.get(&state.active_id) {
            Some(Segment::Active(active)) => active.size() > self.inner.conf.max_segment_size.as_u64(),
            _ => false,
        };
        if !needs_rotation {
            return Ok(());
        }

        let old_id = state.active_id;
        let old_segment = state
            .segments
            .remove(&old_id)
            .ok_or_else(|| Error::corrupt(old_id, 0, "active segment handle missing during rotation"))?;
        let active = match old_segment {
            Segment::Active(active) => active,
            Segment::Immutable(_) => {
                return Err(Error::corrupt(old_id, 0, "segment recorded as active was already immutable"))
            }
        };
        let size = active.size();
        let immutable = active.into_immutable()?;
        state.segments.insert(old_id, Segment::Immutable(immutable));

        let new_id = self.inner.conf.clock.now_nanos() as u64;
        let new_active = ActiveSegment::create(&self.inner.dir, new_id)?;
        state.segments.insert(new_id, Segment::Active(new_active));
        state.active_id = new_id;
        debug!(old_id, new_id, size, "rotated active segment");
        Ok(())
    }
}

/// A short read past the end of a segment is reported as `Io` by
/// `ActiveSegment::read_at` (a `read_exact_at` short read) but the contract
/// for the reader path promises `Corrupt`, matching how `ImmutableSegment`
/// already reports an out-of-bounds read.
fn as_corrupt_on_short_read(err: Error, segment_id: u64, offset: u64) -> Error {
    match err {
        Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::corrupt(segment_id, offset, "short read: value truncated on disk")
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use bytesize::ByteSize;

    fn open(dir: &Path) -> Engine {
        Config::default().clock(Arc::new(ManualClock::new(1, 1))).open(dir).unwrap()
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.set(b"key", b"value").unwrap();
        assert_eq!(engine.get(b"key").unwrap(), Some(Bytes::from_static(b"value")));
        assert_eq!(engine.get(b"missing").unwrap(), None);
    }

    #[test]
    fn empty_value_is_distinct_from_absent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.set(b"key4", b"").unwrap();
        assert_eq!(engine.get(b"key4").unwrap(), Some(Bytes::new()));
        assert_eq!(engine.get(b"key5").unwrap(), None);
    }

    #[test]
    fn delete_then_get_returns_absent_and_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.set(b"key", b"value").unwrap();
        assert!(engine.delete(b"key").unwrap());
        assert_eq!(engine.get(b"key").unwrap(), None);
        assert!(!engine.delete(b"key").unwrap());
        assert!(!engine.delete(b"never-existed").unwrap());
    }

    #[test]
    fn overwrite_then_read_returns_latest_value() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.set(b"key", b"value").unwrap();
        engine.set(b"key", b"valuenew").unwrap();
        assert_eq!(engine.get(b"key").unwrap(), Some(Bytes::from_static(b"valuenew")));
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.set(b"key", b"value").unwrap();
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.get(b"key"), Err(Error::Closed)));
        assert!(matches!(engine.set(b"key", b"x"), Err(Error::Closed)));
    }

    #[test]
    fn reopening_after_close_recovers_all_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine.set(b"key", b"value").unwrap();
            engine.set(b"key2", b"value2").unwrap();
            engine.close().unwrap();
        }
        let engine = open(dir.path());
        assert_eq!(engine.get(b"key").unwrap(), Some(Bytes::from_static(b"value")));
        assert_eq!(engine.get(b"key2").unwrap(), Some(Bytes::from_static(b"value2")));
    }

    #[test]
    fn reopen_with_a_clock_that_repeats_its_id_does_not_clobber_the_recovered_segment() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine.set(b"key", b"value").unwrap();
            engine.set(b"key2", b"value2").unwrap();
            engine.close().unwrap();
        }
        // `open()` mints a fresh `ManualClock::new(1, 1)` every call, so this
        // reopen proposes the same active id (1) that the first session's
        // segment was already recovered under.
        let engine = open(dir.path());
        let stats = engine.stats().unwrap();
        assert_eq!(stats.get(&1).map(|s| s.live_keys), Some(2), "the recovered segment's stats must survive the reopen");
        assert!(stats.len() >= 2, "the new active segment must get an id distinct from the recovered one");
        assert_eq!(engine.get(b"key").unwrap(), Some(Bytes::from_static(b"value")));
        assert_eq!(engine.get(b"key2").unwrap(), Some(Bytes::from_static(b"value2")));
    }

    #[test]
    fn rotation_splits_writes_across_segments_and_both_remain_readable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Config::default()
            .clock(Arc::new(ManualClock::new(1, 1)))
            .max_segment_size(ByteSize::b(1))
            .open(dir.path())
            .unwrap();
        engine.set(b"a", b"1").unwrap();
        engine.set(b"b", b"2").unwrap();
        let stats = engine.stats().unwrap();
        assert!(stats.len() >= 2, "expected rotation to have produced at least two segments");
        assert_eq!(engine.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(engine.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
    }
}
