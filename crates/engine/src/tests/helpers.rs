use crate::Store;
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens a store with fsync disabled; tests exercise ordering, not disks.
pub fn open_store(dir: &Path, threshold: u64) -> Store {
    Store::open(dir, threshold, false).expect("store should open")
}

/// Polls `cond` until it holds or `timeout` elapses. Background flushes and
/// merges finish on their own schedule; tests wait instead of sleeping a
/// fixed amount.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

pub fn count_files_with_suffix(dir: &Path, suffix: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .map(|n| n.ends_with(suffix))
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}

/// Writes `n` filler keys with a payload sized to churn rotations.
pub fn fill(store: &Store, prefix: &str, n: usize, value_len: usize) {
    let value = vec![b'x'; value_len];
    for i in 0..n {
        store
            .set(format!("{}{:04}", prefix, i).as_bytes(), &value)
            .expect("fill set should succeed");
    }
}
