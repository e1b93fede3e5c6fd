use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, trace};

use crate::error::StoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock timeout used when a store is persisted right after creation.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// A table persisted as a single file and rewritten as a whole.
///
/// Concurrent writers go through [`Persisted::update`]: lock, load the current
/// file, mutate, write back, unlock. Writers touching disjoint cells commute.
pub trait Persisted: Sized {
    fn path(&self) -> &Path;

    /// Decode the file at `path` without taking the lock. Safe against
    /// concurrent writers because files are only ever replaced by rename.
    fn load(path: &Path) -> Result<Self>;

    fn encode(&self) -> Result<Vec<u8>>;

    /// Write the file assuming the caller already holds the lock.
    fn write_unlocked(&self) -> Result<()> {
        atomic_write(self.path(), &self.encode()?)
    }

    fn save(&self, timeout: Duration) -> Result<()> {
        let _lock = StoreLock::acquire(self.path(), timeout)?;
        self.write_unlocked()
    }

    /// Locked load-mutate-save transaction.
    fn update<R>(
        path: &Path,
        timeout: Duration,
        mutate: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let _lock = StoreLock::acquire(path, timeout)?;
        let mut store = Self::load(path)?;
        let result = mutate(&mut store)?;
        store.write_unlocked()?;
        Ok(result)
    }
}

/// Exclusive lock on the `.lock` file next to a data store. Unlocks on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Block until the lock for `store` is held or `timeout` elapsed.
    pub fn acquire(store: &Path, timeout: Duration) -> Result<StoreLock> {
        let path = sibling(store, ".lock");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {parent:?}"))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("opening lock file {path:?}"))?;
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    trace!("Acquired {path:?} after {:?}", start.elapsed());
                    return Ok(StoreLock { file, path });
                }
                Err(e)
                    if e.raw_os_error()
                        == fs2::lock_contended_error().raw_os_error() => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("locking {path:?}"));
                }
            }
            if start.elapsed() >= timeout {
                return Err(StoreError::LockTimeout { path, timeout }.into());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        trace!("Released {:?}", self.path);
    }
}

/// Replace `path` with `bytes` so readers see either the old or the new file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {parent:?}"))?;
    }
    let tmp_path = sibling(path, ".tmp");
    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("creating {tmp_path:?}"))?;
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    drop(tmp);
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {tmp_path:?} to {path:?}"))?;
    debug!("Wrote {} bytes to {path:?}", bytes.len());
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("store"));
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_lock_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("data.csv");
        let held = StoreLock::acquire(&store, Duration::from_secs(1)).unwrap();
        assert!(held.path().ends_with("data.csv.lock"));

        let (tx, rx) = mpsc::channel();
        let store_clone = store.clone();
        thread::spawn(move || {
            let result =
                StoreLock::acquire(&store_clone, Duration::from_millis(200));
            tx.send(result.map(|_| ()).map_err(|e| {
                e.downcast_ref::<StoreError>().cloned()
            }))
            .unwrap();
        });
        let result = rx.recv().unwrap();
        assert!(matches!(
            result,
            Err(Some(StoreError::LockTimeout { .. }))
        ));

        drop(held);
        assert!(StoreLock::acquire(&store, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("table.csv");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("nested").join("table.csv.tmp").exists());
    }
}
