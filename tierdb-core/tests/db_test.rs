//! End-to-end tests against the public `Db` API

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tierdb_core::{
    ColumnFamilyDescriptor, ColumnFamilyOptions, CompactRangeOptions, Db, FlushOptions,
    MergeOperator, Options, ReadOptions, TierError, WriteBatch, WriteOptions,
};

fn small_options() -> Options {
    let mut options = Options::default();
    options.column_family.write_buffer_size = 8 * 1024;
    options.column_family.target_file_size_base = 16 * 1024;
    options.column_family.max_bytes_for_level_base = 64 * 1024;
    options
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

fn value(i: usize, round: usize) -> Vec<u8> {
    format!("value-{}-{}-{}", i, round, "x".repeat(64)).into_bytes()
}

fn scan(db: &Db, opts: &ReadOptions) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.iter(opts).unwrap();
    iter.seek_to_first().unwrap();
    iter.collect_remaining().unwrap()
}

struct Counter;

impl MergeOperator for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn full_merge(&self, _key: &[u8], existing: Option<&[u8]>, operands: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut total: i64 = match existing {
            Some(v) => std::str::from_utf8(v).ok()?.parse().ok()?,
            None => 0,
        };
        for op in operands {
            total += std::str::from_utf8(op).ok()?.parse::<i64>().ok()?;
        }
        Some(total.to_string().into_bytes())
    }
}

#[test]
fn test_reopen_replays_wal() {
    let dir = TempDir::new().unwrap();
    let w = WriteOptions::default();
    {
        let db = Db::open(Options::default(), dir.path()).unwrap();
        db.put(&w, b"a", b"1").unwrap();
        db.put(&w, b"b", b"2").unwrap();
        db.delete(&w, b"a").unwrap();
    }

    let db = Db::open(Options::default(), dir.path()).unwrap();
    let r = ReadOptions::default();
    assert_eq!(db.get(&r, b"a").unwrap(), None);
    assert_eq!(db.get(&r, b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.latest_sequence_number(), 3);
    // replayed data lands in level 0
    assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("1"));

    // new writes continue the sequence
    db.put(&w, b"c", b"3").unwrap();
    assert_eq!(db.latest_sequence_number(), 4);
}

#[test]
fn test_reopen_many_times_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let w = WriteOptions::default();
    for round in 0..4 {
        let db = Db::open(small_options(), dir.path()).unwrap();
        for i in 0..300 {
            db.put(&w, &key(i), &value(i, round)).unwrap();
        }
        if round % 2 == 0 {
            db.flush(&FlushOptions::default()).unwrap();
        }
    }

    let db = Db::open(small_options(), dir.path()).unwrap();
    let r = ReadOptions::default();
    for i in 0..300 {
        assert_eq!(db.get(&r, &key(i)).unwrap(), Some(value(i, 3)));
    }
    assert_eq!(scan(&db, &r).len(), 300);
}

#[test]
fn test_snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(), dir.path()).unwrap();
    let w = WriteOptions::default();

    for i in 0..100 {
        db.put(&w, &key(i), &value(i, 0)).unwrap();
    }
    let snapshot = db.get_snapshot();
    for i in 0..100 {
        if i % 2 == 0 {
            db.delete(&w, &key(i)).unwrap();
        } else {
            db.put(&w, &key(i), &value(i, 1)).unwrap();
        }
    }
    db.flush(&FlushOptions::default()).unwrap();
    db.compact_range(&CompactRangeOptions::default(), None, None).unwrap();

    let at_snapshot = ReadOptions::default().with_snapshot(&snapshot);
    for i in 0..100 {
        assert_eq!(db.get(&at_snapshot, &key(i)).unwrap(), Some(value(i, 0)));
    }
    assert_eq!(scan(&db, &at_snapshot).len(), 100);

    let latest = ReadOptions::default();
    let expected: Vec<_> = (1..100).step_by(2).map(|i| (key(i), value(i, 1))).collect();
    assert_eq!(scan(&db, &latest), expected);

    db.release_snapshot(snapshot);
    db.compact_range(&CompactRangeOptions::default(), None, None).unwrap();
    assert_eq!(scan(&db, &latest).len(), 50);
}

#[test]
fn test_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open(small_options(), dir.path()).unwrap());
    let threads = 4;
    let per_thread = 500;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let w = WriteOptions::default();
                for i in 0..per_thread {
                    let k = format!("t{}-{:05}", t, i);
                    db.put(&w, k.as_bytes(), &value(i, t)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.latest_sequence_number(), (threads * per_thread) as u64);
    let r = ReadOptions::default();
    for t in 0..threads {
        for i in (0..per_thread).step_by(37) {
            let k = format!("t{}-{:05}", t, i);
            assert_eq!(db.get(&r, k.as_bytes()).unwrap(), Some(value(i, t)));
        }
    }
    assert_eq!(scan(&db, &r).len(), threads * per_thread);
}

#[test]
fn test_compaction_is_transparent() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(), dir.path()).unwrap();
    let w = WriteOptions::default();

    for round in 0..3 {
        for i in 0..400 {
            db.put(&w, &key(i), &value(i, round)).unwrap();
        }
        db.flush(&FlushOptions::default()).unwrap();
    }
    for i in (0..400).step_by(10) {
        db.delete(&w, &key(i)).unwrap();
    }

    let r = ReadOptions::default();
    let before = scan(&db, &r);
    assert_eq!(before.len(), 360);

    db.compact_range(&CompactRangeOptions::default(), None, None).unwrap();
    assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("0"));
    assert_eq!(scan(&db, &r), before);
    for i in 0..400 {
        let expected = if i % 10 == 0 { None } else { Some(value(i, 2)) };
        assert_eq!(db.get(&r, &key(i)).unwrap(), expected);
    }

    drop(db);
    let db = Db::open(small_options(), dir.path()).unwrap();
    assert_eq!(scan(&db, &r), before);
}

#[test]
fn test_compact_range_to_target_level() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(), dir.path()).unwrap();
    let w = WriteOptions::default();
    for i in 0..200 {
        db.put(&w, &key(i), &value(i, 0)).unwrap();
    }

    let opts = CompactRangeOptions {
        change_level: true,
        target_level: Some(3),
        ..Default::default()
    };
    db.compact_range(&opts, None, None).unwrap();
    assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("0"));
    assert_ne!(db.property("tierdb.num-files-at-level3").as_deref(), Some("0"));
    assert_eq!(scan(&db, &ReadOptions::default()).len(), 200);

    let bad = CompactRangeOptions {
        change_level: true,
        target_level: Some(99),
        ..Default::default()
    };
    assert!(matches!(
        db.compact_range(&bad, None, None),
        Err(TierError::InvalidArgument(_))
    ));
}

#[test]
fn test_column_families_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let w = WriteOptions::default();
    {
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let users = db.create_column_family("users", ColumnFamilyOptions::default()).unwrap();
        let scratch = db.create_column_family("scratch", ColumnFamilyOptions::default()).unwrap();
        db.put(&w, b"k", b"default").unwrap();
        db.put_cf(&w, &users, b"k", b"users").unwrap();
        db.put_cf(&w, &scratch, b"k", b"scratch").unwrap();

        let mut batch = WriteBatch::new();
        batch.put_cf(&users, b"k2", b"users2");
        batch.delete(b"k");
        db.write(&w, batch).unwrap();

        db.drop_column_family(&scratch).unwrap();
        assert!(db.put_cf(&w, &scratch, b"x", b"y").is_err());
    }

    let descriptors = vec![
        ColumnFamilyDescriptor::new("default", ColumnFamilyOptions::default()),
        ColumnFamilyDescriptor::new("users", ColumnFamilyOptions::default()),
    ];
    let (db, handles) = Db::open_cf(Options::default(), dir.path(), descriptors).unwrap();
    assert_eq!(handles.len(), 2);
    assert!(db.column_family("scratch").is_none());

    let r = ReadOptions::default();
    assert_eq!(db.get(&r, b"k").unwrap(), None);
    assert_eq!(db.get_cf(&r, &handles[1], b"k").unwrap(), Some(b"users".to_vec()));
    assert_eq!(db.get_cf(&r, &handles[1], b"k2").unwrap(), Some(b"users2".to_vec()));

    let missing = vec![ColumnFamilyDescriptor::new("scratch", ColumnFamilyOptions::default())];
    drop(db);
    assert!(Db::open_cf(Options::default(), dir.path(), missing).is_err());
}

#[test]
fn test_merge_counter_across_flushes() {
    let dir = TempDir::new().unwrap();
    let mut options = small_options();
    options.column_family.merge_operator = Some(Arc::new(Counter));
    let w = WriteOptions::default();
    {
        let db = Db::open(options.clone(), dir.path()).unwrap();
        db.put(&w, b"hits", b"10").unwrap();
        db.merge(&w, b"hits", b"5").unwrap();
        db.flush(&FlushOptions::default()).unwrap();
        db.merge(&w, b"hits", b"-3").unwrap();
        db.merge(&w, b"fresh", b"7").unwrap();
        let r = ReadOptions::default();
        assert_eq!(db.get(&r, b"hits").unwrap(), Some(b"12".to_vec()));
        assert_eq!(db.get(&r, b"fresh").unwrap(), Some(b"7".to_vec()));
    }

    let db = Db::open(options, dir.path()).unwrap();
    db.compact_range(&CompactRangeOptions::default(), None, None).unwrap();
    let r = ReadOptions::default();
    assert_eq!(db.get(&r, b"hits").unwrap(), Some(b"12".to_vec()));
    assert_eq!(
        scan(&db, &r),
        vec![(b"fresh".to_vec(), b"7".to_vec()), (b"hits".to_vec(), b"12".to_vec())]
    );
}

#[test]
fn test_seek_and_multi_get_after_compaction() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(), dir.path()).unwrap();
    let w = WriteOptions::default();
    for i in 0..500 {
        db.put(&w, &key(i), &value(i, 0)).unwrap();
    }
    db.compact_range(&CompactRangeOptions::default(), None, None).unwrap();

    let r = ReadOptions::default();
    let mut iter = db.iter(&r).unwrap();
    iter.seek(&key(250)).unwrap();
    assert!(iter.valid());
    assert_eq!(iter.key(), key(250).as_slice());
    assert_eq!(iter.collect_remaining().unwrap().len(), 250);

    let k1 = key(1);
    let k499 = key(499);
    let results = db.multi_get(&r, &[k1.as_slice(), b"nope", k499.as_slice()]);
    assert_eq!(results[0].as_ref().unwrap(), &Some(value(1, 0)));
    assert_eq!(results[1].as_ref().unwrap(), &None);
    assert_eq!(results[2].as_ref().unwrap(), &Some(value(499, 0)));
}

#[test]
fn test_repeated_compact_range_over_many_files() {
    let dir = TempDir::new().unwrap();
    let mut options = Options::default();
    options.column_family.write_buffer_size = 64 * 1024;
    options.column_family.target_file_size_base = 16 * 1024;
    options.column_family.disable_auto_compactions = true;
    let db = Arc::new(Db::open(options, dir.path()).unwrap());
    let w = WriteOptions::default();
    let payload = |i: usize| format!("{:080}", i).into_bytes();
    for i in 0..3000 {
        db.put(&w, &key(i), &payload(i)).unwrap();
    }
    db.flush(&FlushOptions::default()).unwrap();

    // the bottom level is compacted into itself one file's worth at a time
    for round in 0..2 {
        let (tx, rx) = mpsc::channel();
        let worker = {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let result = db.compact_range(&CompactRangeOptions::default(), None, None);
                let _ = tx.send(result.is_ok());
            })
        };
        let finished = rx.recv_timeout(Duration::from_secs(60));
        assert_eq!(finished, Ok(true), "compact_range round {} did not finish", round);
        worker.join().unwrap();

        let l1: usize = db
            .property("tierdb.num-files-at-level1")
            .unwrap()
            .parse()
            .unwrap();
        assert!(l1 >= 2);
        assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("0"));
    }

    let r = ReadOptions::default();
    for i in 0..3000 {
        assert_eq!(db.get(&r, &key(i)).unwrap(), Some(payload(i)));
    }
    assert_eq!(scan(&db, &r).len(), 3000);
}
