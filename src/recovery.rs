//! Rebuilds the keydir and the segment handle map from whatever a directory
//! holds when the engine opens it.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::debug;

use crate::clock::Clock;
use crate::codec::{self, Limits};
use crate::error::Result;
use crate::keydir::{Keydir, KeydirEntry};
use crate::scanner;
use crate::segment::{data_file_path, ImmutableSegment, Segment};

/// Everything the engine façade needs once recovery finishes.
pub struct Recovered {
    pub keydir: Keydir,
    pub segments: HashMap<u64, Segment>,
    pub active_id: u64,
}

/// Runs the full open-time recovery protocol: hint files first, then a key
/// scan of any data file not covered by a hint, then creation of a fresh
/// active segment.
#[tracing::instrument(skip(clock, limits))]
pub fn recover(dir: &Path, clock: &dyn Clock, limits: &Limits) -> Result<Recovered> {
    let dir_entries = scanner::scan(dir)?;
    let mut keydir = Keydir::new();
    let mut stats: HashMap<u64, crate::segment::LogStatistics> = HashMap::new();
    let mut covered_by_hint = HashSet::new();

    for (segment_id, hint_path) in &dir_entries.hint_files {
        populate_from_hint(*segment_id, hint_path, &mut keydir, &mut stats, limits)?;
        covered_by_hint.insert(*segment_id);
    }

    let mut segments: HashMap<u64, Segment> = HashMap::new();
    for (segment_id, _data_path) in &dir_entries.data_files {
        if !covered_by_hint.contains(segment_id) {
            populate_from_data_file(dir, *segment_id, &mut keydir, &mut stats, limits)?;
        }
        let mut handle = ImmutableSegment::open(dir, *segment_id)?;
        if let Some(segment_stats) = stats.get(segment_id) {
            *handle.stats_mut() = *segment_stats;
        }
        segments.insert(*segment_id, Segment::Immutable(handle));
    }

    let active_id = clock.now_nanos() as u64;
    debug!(active_id, existing_segments = segments.len(), "recovery complete, opening active segment");

    Ok(Recovered { keydir, segments, active_id })
}

/// Records that `entry` superseded whatever was previously in the keydir for
/// its key, crediting the displaced segment's dead-key counters.
fn record_overwrite(
    keydir: &mut Keydir,
    stats: &mut HashMap<u64, crate::segment::LogStatistics>,
    key: Vec<u8>,
    entry: KeydirEntry,
    entry_len: u64,
) {
    if let Some(prior_segment) = keydir.insert_if_newer(key, entry) {
        stats.entry(prior_segment).or_default().overwrite(entry_len);
    }
}

fn populate_from_hint(
    segment_id: u64,
    hint_path: &Path,
    keydir: &mut Keydir,
    stats: &mut HashMap<u64, crate::segment::LogStatistics>,
    limits: &Limits,
) -> Result<()> {
    let file = File::open(hint_path)?;
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    while let Some(hint) = codec::decode_hint(&mut reader, segment_id, offset, limits)? {
        let entry = KeydirEntry {
            segment_id,
            value_size: hint.value_size,
            value_pos: hint.value_pos as i64,
            timestamp: hint.timestamp,
        };
        if hint.value_size < 0 {
            stats.entry(segment_id).or_default().add_dead(hint.len);
        } else {
            stats.entry(segment_id).or_default().add_live();
        }
        record_overwrite(keydir, stats, hint.key.to_vec(), entry, hint.len);
        offset += hint.len;
    }
    Ok(())
}

fn populate_from_data_file(
    dir: &Path,
    segment_id: u64,
    keydir: &mut Keydir,
    stats: &mut HashMap<u64, crate::segment::LogStatistics>,
    limits: &Limits,
) -> Result<()> {
    let file = File::open(data_file_path(dir, segment_id))?;
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    while let Some(record) = codec::decode_record_skip_value(&mut reader, segment_id, offset, limits)? {
        let entry = KeydirEntry {
            segment_id,
            value_size: record.value_size,
            value_pos: record.value_pos as i64,
            timestamp: record.timestamp,
        };
        if record.value_size < 0 {
            stats.entry(segment_id).or_default().add_dead(record.len);
        } else {
            stats.entry(segment_id).or_default().add_live();
        }
        record_overwrite(keydir, stats, record.key.to_vec(), entry, record.len);
        offset += record.len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::{encode_hint, encode_record};
    use std::fs;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn recovers_from_scratch_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(100, 1);
        let recovered = recover(dir.path(), &clock, &limits()).unwrap();
        assert!(recovered.keydir.is_empty());
        assert!(recovered.segments.is_empty());
        assert_eq!(recovered.active_id, 100);
    }

    #[test]
    fn scans_a_data_file_without_a_hint() {
        let dir = tempfile::tempdir().unwrap();
        let data = encode_record(b"a", Some(b"1"), 10);
        fs::write(dir.path().join("5.keychain.data"), &data).unwrap();

        let clock = ManualClock::new(200, 1);
        let recovered = recover(dir.path(), &clock, &limits()).unwrap();
        let entry = recovered.keydir.lookup(b"a").unwrap();
        assert_eq!(entry.segment_id, 5);
        assert_eq!(entry.timestamp, 10);
        assert!(recovered.segments.contains_key(&5));
    }

    #[test]
    fn prefers_hint_file_over_scanning_data() {
        // Data file intentionally contains a different (stale) view; the hint
        // file must win without the data file's values ever being scanned.
        let dir = tempfile::tempdir().unwrap();
        let data = encode_record(b"a", Some(b"stale"), 1);
        fs::write(dir.path().join("5.keychain.data"), &data).unwrap();
        let hint = encode_hint(b"a", 99, 1, 24);
        fs::write(dir.path().join("5.keychain.hint"), &hint).unwrap();

        let clock = ManualClock::new(200, 1);
        let recovered = recover(dir.path(), &clock, &limits()).unwrap();
        let entry = recovered.keydir.lookup(b"a").unwrap();
        assert_eq!(entry.timestamp, 99);
    }

    #[test]
    fn tombstone_in_later_segment_wins_over_earlier_live_write() {
        let dir = tempfile::tempdir().unwrap();
        let live = encode_record(b"a", Some(b"1"), 1);
        fs::write(dir.path().join("1.keychain.data"), &live).unwrap();
        let tombstone = encode_record(b"a", None, 2);
        fs::write(dir.path().join("2.keychain.data"), &tombstone).unwrap();

        let clock = ManualClock::new(200, 1);
        let recovered = recover(dir.path(), &clock, &limits()).unwrap();
        let entry = recovered.keydir.lookup(b"a").unwrap();
        assert!(entry.is_tombstone());
    }

    #[test]
    fn recovery_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20u8 {
            let data = encode_record(format!("k{i}").as_bytes(), Some(b"v"), i as i64);
            fs::write(dir.path().join(format!("{i}.keychain.data")), &data).unwrap();
        }

        let clock1 = ManualClock::new(1000, 1);
        let first = recover(dir.path(), &clock1, &limits()).unwrap();
        let clock2 = ManualClock::new(2000, 1);
        let second = recover(dir.path(), &clock2, &limits()).unwrap();

        let mut first_entries: Vec<_> = first.keydir.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let mut second_entries: Vec<_> = second.keydir.iter().map(|(k, v)| (k.clone(), *v)).collect();
        first_entries.sort_by(|a, b| a.0.cmp(&b.0));
        second_entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(first_entries, second_entries);
    }

    #[test]
    fn overwritten_key_bumps_dead_stats_on_the_displaced_segment() {
        let dir = tempfile::tempdir().unwrap();
        let first = encode_record(b"a", Some(b"1"), 1);
        fs::write(dir.path().join("1.keychain.data"), &first).unwrap();
        let second = encode_record(b"a", Some(b"2"), 2);
        fs::write(dir.path().join("2.keychain.data"), &second).unwrap();

        let clock = ManualClock::new(200, 1);
        let recovered = recover(dir.path(), &clock, &limits()).unwrap();
        let seg1_stats = recovered.segments[&1].stats();
        assert_eq!(seg1_stats.dead_keys, 1);
        assert_eq!(seg1_stats.live_keys, 0);
        let seg2_stats = recovered.segments[&2].stats();
        assert_eq!(seg2_stats.live_keys, 1);
    }
}
