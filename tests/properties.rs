//! Property tests covering round-trip reads, tombstone dominance over an
//! earlier live write, and empty values staying distinct from absent keys.

use proptest::{collection, prelude::*};

use keychain::Config;

#[test]
fn round_trip_arbitrary_key_value_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Config::default().open(dir.path()).unwrap();

    proptest!(|(key in collection::vec(any::<u8>(), 0..64),
                value in collection::vec(any::<u8>(), 0..256))| {
        engine.set(&key, &value).unwrap();
        let read_back = engine.get(&key).unwrap();
        prop_assert_eq!(Some(value), read_back.map(|b| b.to_vec()));
    });
}

#[test]
fn delete_after_set_is_always_absent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Config::default().open(dir.path()).unwrap();

    proptest!(|(key in collection::vec(any::<u8>(), 1..64),
                value in collection::vec(any::<u8>(), 0..256))| {
        engine.set(&key, &value).unwrap();
        prop_assert!(engine.delete(&key).unwrap());
        prop_assert_eq!(engine.get(&key).unwrap(), None);
    });
}

#[test]
fn empty_value_reads_back_as_empty_not_absent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Config::default().open(dir.path()).unwrap();

    proptest!(|(key in collection::vec(any::<u8>(), 1..64))| {
        engine.set(&key, &[]).unwrap();
        prop_assert_eq!(engine.get(&key).unwrap().as_deref(), Some(&b""[..]));
    });
}

#[test]
fn tombstone_written_in_one_session_dominates_a_live_write_from_an_earlier_one() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = Config::default().open(dir.path()).unwrap();
        engine.set(b"a", b"1").unwrap();
        engine.close().unwrap();
    }
    {
        let engine = Config::default().open(dir.path()).unwrap();
        engine.delete(b"a").unwrap();
        engine.close().unwrap();
    }

    let engine = Config::default().open(dir.path()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), None);
}

#[test]
fn rebuilds_ten_thousand_keys_across_many_small_segments() {
    use bytesize::ByteSize;

    let dir = tempfile::tempdir().unwrap();
    {
        let engine = Config::default().max_segment_size(ByteSize::kib(64)).open(dir.path()).unwrap();
        for i in 0..10_000 {
            engine.set(format!("key{i}").as_bytes(), format!("value{i}").as_bytes()).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = Config::default().open(dir.path()).unwrap();
    for i in 0..10_000 {
        let value = engine.get(format!("key{i}").as_bytes()).unwrap().unwrap();
        assert_eq!(value, format!("value{i}").as_bytes());
    }
}
