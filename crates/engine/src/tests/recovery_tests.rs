use super::helpers::{count_files_with_suffix, open_store, wait_until};
use crate::{Manifest, Store, MANIFEST_FILENAME};
use anyhow::Result;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn reopen_replays_unflushed_writes_from_wal() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 1024 * 1024);
        store.set(b"a", b"1")?;
        store.set(b"b", b"2")?;
        store.delete(b"a")?;
        // close() does not flush the memtable; the WAL is the only copy.
        store.close()?;
    }

    let store = open_store(dir.path(), 1024 * 1024);
    assert_eq!(store.get(b"a")?, None);
    assert_eq!(store.get(b"b")?, Some(b"2".to_vec()));
    store.close()
}

#[test]
fn crash_without_close_recovers_acknowledged_writes() -> Result<()> {
    let dir = tempdir()?;

    {
        // fsync on: every acknowledged set is durable.
        let store = Store::open(dir.path(), 1024 * 1024, true)?;
        for i in 0..10 {
            store.set(format!("k{:02}", i).as_bytes(), format!("v{:02}", i).as_bytes())?;
        }
        // Dropped without close: simulated crash before any flush.
    }

    let store = open_store(dir.path(), 1024 * 1024);
    assert_eq!(store.get(b"k07")?, Some(b"v07".to_vec()));
    assert_eq!(store.get(b"k00")?, Some(b"v00".to_vec()));
    store.close()
}

#[test]
fn reopen_after_flush_reads_from_segments() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 60);
        for i in 0..20 {
            store.set(format!("flushed{:02}", i).as_bytes(), b"persisted")?;
        }
        assert!(wait_until(Duration::from_secs(5), || {
            let stats = store.stats();
            !stats.immutable_pending && stats.tiers.iter().sum::<usize>() >= 1
        }));
        store.close()?;
    }

    let store = open_store(dir.path(), 60);
    for i in 0..20 {
        let key = format!("flushed{:02}", i);
        assert_eq!(
            store.get(key.as_bytes())?,
            Some(b"persisted".to_vec()),
            "{} must survive the restart",
            key
        );
    }
    store.close()
}

#[test]
fn orphan_files_are_deleted_on_startup() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 1024 * 1024);
        store.set(b"k", b"v")?;
        store.close()?;
    }

    // Plant files the manifest knows nothing about: a fake segment (as if a
    // flush died mid-write), a stale WAL, an index leftover, and a manifest
    // temp from an interrupted rewrite.
    std::fs::write(dir.path().join("sst_9999.db"), b"partial garbage")?;
    std::fs::write(dir.path().join("wal_9999.log"), b"stale")?;
    std::fs::write(dir.path().join("leftover.idx"), b"stale")?;
    std::fs::write(dir.path().join("MANIFEST.tmp"), b"{}")?;
    // Unowned suffixes are none of our business.
    std::fs::write(dir.path().join("notes.txt"), b"keep me")?;

    let store = open_store(dir.path(), 1024 * 1024);
    assert!(!dir.path().join("sst_9999.db").exists());
    assert!(!dir.path().join("wal_9999.log").exists());
    assert!(!dir.path().join("leftover.idx").exists());
    assert!(!dir.path().join("MANIFEST.tmp").exists());
    assert!(dir.path().join("notes.txt").exists());

    assert_eq!(store.get(b"k")?, Some(b"v".to_vec()));
    store.close()
}

#[test]
fn manifest_matches_filesystem_after_clean_start() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 60);
        for i in 0..30 {
            store.set(format!("inv{:02}", i).as_bytes(), b"xxxxxxxx")?;
        }
        assert!(wait_until(Duration::from_secs(5), || {
            !store.stats().immutable_pending
        }));
        store.close()?;
    }

    let store = open_store(dir.path(), 60);

    let manifest = Manifest::load(dir.path())?.expect("manifest must exist");
    let mut referenced: Vec<String> = manifest
        .tiers
        .iter()
        .flat_map(|t| t.segments.iter().cloned())
        .collect();
    referenced.push(manifest.active_wal.clone());
    referenced.sort();

    let mut on_disk: Vec<String> = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|n| n.ends_with(".db") || n.ends_with(".log"))
        .collect();
    on_disk.sort();

    assert_eq!(referenced, on_disk);
    store.close()
}

#[test]
fn missing_manifest_bootstraps_from_directory() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 60);
        for i in 0..20 {
            store.set(format!("boot{:02}", i).as_bytes(), b"persisted")?;
        }
        assert!(wait_until(Duration::from_secs(5), || {
            let stats = store.stats();
            !stats.immutable_pending && stats.tiers.iter().sum::<usize>() >= 1
        }));
        store.close()?;
    }

    // Lose the manifest (and the now-unreferenced WAL bookkeeping): the
    // engine adopts discovered segments into tier 0.
    std::fs::remove_file(dir.path().join(MANIFEST_FILENAME))?;

    let store = open_store(dir.path(), 60);
    let stats = store.stats();
    assert!(stats.tiers.iter().sum::<usize>() >= 1);
    assert_eq!(store.get(b"boot00")?, Some(b"persisted".to_vec()));

    // The synthesized manifest was written out and ids keep advancing.
    let manifest = Manifest::load(dir.path())?.expect("bootstrap manifest written");
    assert!(manifest.next_entry_id >= 1);
    store.close()
}

#[test]
fn corrupt_manifest_refuses_to_start() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 1024 * 1024);
        store.set(b"k", b"v")?;
        store.close()?;
    }

    std::fs::write(dir.path().join(MANIFEST_FILENAME), b"{not json")?;
    assert!(Store::open(dir.path(), 1024 * 1024, false).is_err());
    Ok(())
}

#[test]
fn corrupt_wal_refuses_to_start() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 1024 * 1024);
        store.set(b"k", b"v")?;
        store.close()?;
    }

    // Flip a bit in the only WAL frame.
    let manifest = Manifest::load(dir.path())?.expect("manifest exists");
    let wal_path = dir.path().join(&manifest.active_wal);
    let mut bytes = std::fs::read(&wal_path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&wal_path, &bytes)?;

    assert!(Store::open(dir.path(), 1024 * 1024, false).is_err());
    Ok(())
}

#[test]
fn truncated_wal_tail_recovers_the_prefix() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 1024 * 1024);
        store.set(b"kept", b"v1")?;
        store.set(b"tail", b"v2")?;
        store.close()?;
    }

    let manifest = Manifest::load(dir.path())?.expect("manifest exists");
    let wal_path = dir.path().join(&manifest.active_wal);
    let bytes = std::fs::read(&wal_path)?;
    std::fs::write(&wal_path, &bytes[..bytes.len() - 3])?;

    let store = open_store(dir.path(), 1024 * 1024);
    assert_eq!(store.get(b"kept")?, Some(b"v1".to_vec()));
    assert_eq!(store.get(b"tail")?, None, "crash tail is dropped");
    store.close()
}

#[test]
fn exactly_one_wal_after_settled_restart() -> Result<()> {
    let dir = tempdir()?;

    {
        let store = open_store(dir.path(), 60);
        for i in 0..30 {
            store.set(format!("walcount{:02}", i).as_bytes(), b"xxxxxxxx")?;
        }
        assert!(wait_until(Duration::from_secs(5), || {
            !store.stats().immutable_pending
        }));
        store.close()?;
    }

    assert_eq!(count_files_with_suffix(dir.path(), ".log"), 1);

    let store = open_store(dir.path(), 60);
    assert_eq!(count_files_with_suffix(dir.path(), ".log"), 1);
    store.close()
}
