use tempfile::TempDir;
use vcache::{Config, VCache};

/// Fresh store in a scratch directory. Keep the `TempDir` alive for the
/// duration of the test; dropping it removes the files.
pub fn open_store() -> (TempDir, VCache) {
    let dir = tempfile::tempdir().unwrap();
    let store = VCache::open(dir.path()).unwrap();
    (dir, store)
}

/// As [`open_store`], with explicit tuning.
#[allow(dead_code)]
pub fn open_store_with(cfg: Config) -> (TempDir, VCache) {
    let dir = tempfile::tempdir().unwrap();
    let store = VCache::open_with(dir.path(), cfg).unwrap();
    (dir, store)
}

/// Reopen the same directory. The previous handle must be dropped first or
/// this fails on the store lock.
#[allow(dead_code)]
pub fn reopen(dir: &TempDir) -> VCache {
    VCache::open(dir.path()).unwrap()
}
