//! Directory Locker
//!
//! Coordinates shared/exclusive access to on-disk cache directories across
//! the threads of this process and across separate processes on the host.
//!
//! # Design
//!
//! ```text
//! ┌────────────────────────────── process ───────────────────────────────┐
//! │  DirectoryLocker (one Mutex)                                          │
//! │  ┌──────────────────────┬────────────┬───────┬──────────────────────┐ │
//! │  │ canonical path       │ mode       │ holds │ sentinel file handle │ │
//! │  └──────────────────────┴────────────┴───────┴──────────────────────┘ │
//! └──────────────────────────────────┬───────────────────────────────────┘
//!                                    │ flock(2) / LockFileEx
//!                          <dir>/.tiercache.lock
//! ```
//!
//! The OS advisory lock on the sentinel is held if and only if the hold count
//! of its table row is non-zero. Every operation is a single attempt; a
//! conflicting holder is reported as [`Error::LockConflict`] immediately.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::FileExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Sentinel file name inside each guarded directory
pub const LOCK_FILE_NAME: &str = ".tiercache.lock";

static GLOBAL: Lazy<Arc<DirectoryLocker>> = Lazy::new(|| Arc::new(DirectoryLocker::new()));

/// Requested access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// One row of the lock table
struct HeldLock {
    sentinel: File,
    mode: LockMode,
    holds: usize,
}

/// Process-wide table of directory locks
pub struct DirectoryLocker {
    table: Mutex<HashMap<PathBuf, HeldLock>>,
}

impl DirectoryLocker {
    /// A locker with its own table
    ///
    /// Two lockers in one process contend with each other exactly like two
    /// processes would, since each opens its own sentinel handles.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// The locker shared by everything in this process
    pub fn global() -> Arc<DirectoryLocker> {
        GLOBAL.clone()
    }

    /// Try once to lock `dir`
    ///
    /// Shared requests are reentrant while this table holds the directory
    /// shared. Exclusive requests succeed only when nobody holds the
    /// directory at all.
    pub fn lock_directory(&self, dir: &Path, mode: LockMode) -> Result<()> {
        self.acquire(dir, mode).map(|_| ())
    }

    /// Lock `dir`, returning the canonical path the hold is recorded under
    fn acquire(&self, dir: &Path, mode: LockMode) -> Result<PathBuf> {
        let canonical = dir.canonicalize()?;
        let mut table = self.table.lock();

        if let Some(held) = table.get_mut(&canonical) {
            if held.mode == LockMode::Shared && mode == LockMode::Shared {
                held.holds += 1;
                debug!(dir = %canonical.display(), holds = held.holds, "reentrant shared lock");
                return Ok(canonical);
            }
            return Err(Error::LockConflict {
                path: canonical,
                mode,
            });
        }

        let sentinel = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(canonical.join(LOCK_FILE_NAME))?;

        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&sentinel),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&sentinel),
        };
        match attempt {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                debug!(dir = %canonical.display(), %mode, "directory held by another process");
                return Err(Error::LockConflict {
                    path: canonical,
                    mode,
                });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(dir = %canonical.display(), %mode, "directory locked");
        table.insert(
            canonical.clone(),
            HeldLock {
                sentinel,
                mode,
                holds: 1,
            },
        );
        Ok(canonical)
    }

    /// Release one hold on `dir`
    ///
    /// The OS lock is dropped with the last hold. Unlocking a directory this
    /// table does not hold is a no-op.
    pub fn unlock_directory(&self, dir: &Path) {
        if let Ok(canonical) = dir.canonicalize() {
            self.release(&canonical);
        }
    }

    fn release(&self, canonical: &Path) {
        let mut table = self.table.lock();

        let Some(held) = table.get_mut(canonical) else {
            return;
        };
        held.holds -= 1;
        if held.holds > 0 {
            return;
        }

        if let Some(released) = table.remove(canonical) {
            if let Err(e) = FileExt::unlock(&released.sentinel) {
                warn!(dir = %canonical.display(), error = %e, "failed to release directory lock");
            }
            debug!(dir = %canonical.display(), "directory unlocked");
        }
    }

    /// Lock `dir` and release it when the guard drops
    pub fn guard(&self, dir: &Path, mode: LockMode) -> Result<DirectoryGuard<'_>> {
        let dir = self.acquire(dir, mode)?;
        Ok(DirectoryGuard { locker: self, dir })
    }

    /// Like [`guard`](Self::guard), but the guard owns a handle on the locker
    /// and can cross threads and tasks
    pub fn owned_guard(self: &Arc<Self>, dir: &Path, mode: LockMode) -> Result<OwnedDirectoryGuard> {
        let dir = self.acquire(dir, mode)?;
        Ok(OwnedDirectoryGuard {
            locker: self.clone(),
            dir,
        })
    }

    /// Holds this table currently has on `dir` (0 if unlocked)
    pub fn holds(&self, dir: &Path) -> usize {
        let Ok(canonical) = dir.canonicalize() else {
            return 0;
        };
        self.table
            .lock()
            .get(&canonical)
            .map(|held| held.holds)
            .unwrap_or(0)
    }

    /// Mode of the lock this table holds on `dir`, if any
    pub fn mode(&self, dir: &Path) -> Option<LockMode> {
        let canonical = dir.canonicalize().ok()?;
        self.table.lock().get(&canonical).map(|held| held.mode)
    }
}

impl Default for DirectoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DirectoryLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_map()
            .entries(table.iter().map(|(p, h)| (p, (h.mode, h.holds))))
            .finish()
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

/// Scoped hold on a directory
#[derive(Debug)]
pub struct DirectoryGuard<'a> {
    locker: &'a DirectoryLocker,
    dir: PathBuf,
}

impl Drop for DirectoryGuard<'_> {
    fn drop(&mut self) {
        self.locker.release(&self.dir);
    }
}

/// Scoped hold on a directory that owns its locker handle
#[derive(Debug)]
pub struct OwnedDirectoryGuard {
    locker: Arc<DirectoryLocker>,
    dir: PathBuf,
}

impl Drop for OwnedDirectoryGuard {
    fn drop(&mut self) {
        self.locker.release(&self.dir);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_nested_shared_locks() {
        let dir = TempDir::new().unwrap();
        let locker = DirectoryLocker::new();

        for _ in 0..3 {
            locker.lock_directory(dir.path(), LockMode::Shared).unwrap();
        }
        assert_eq!(locker.holds(dir.path()), 3);

        locker.unlock_directory(dir.path());
        locker.unlock_directory(dir.path());
        assert_eq!(locker.holds(dir.path()), 1);

        // Still held: another table cannot take it exclusively
        let other = DirectoryLocker::new();
        assert_matches!(
            other.lock_directory(dir.path(), LockMode::Exclusive),
            Err(Error::LockConflict { mode: LockMode::Exclusive, .. })
        );

        locker.unlock_directory(dir.path());
        assert_eq!(locker.holds(dir.path()), 0);
        other.lock_directory(dir.path(), LockMode::Exclusive).unwrap();
        other.unlock_directory(dir.path());
    }

    #[test]
    fn test_exclusive_blocks_everyone() {
        let dir = TempDir::new().unwrap();
        let locker = DirectoryLocker::new();
        let other = DirectoryLocker::new();

        locker.lock_directory(dir.path(), LockMode::Exclusive).unwrap();

        assert!(locker
            .lock_directory(dir.path(), LockMode::Shared)
            .unwrap_err()
            .is_lock_conflict());
        assert!(locker
            .lock_directory(dir.path(), LockMode::Exclusive)
            .unwrap_err()
            .is_lock_conflict());
        assert!(other
            .lock_directory(dir.path(), LockMode::Shared)
            .unwrap_err()
            .is_lock_conflict());

        locker.unlock_directory(dir.path());
        other.lock_directory(dir.path(), LockMode::Shared).unwrap();
        other.unlock_directory(dir.path());
    }

    #[test]
    fn test_exclusive_denied_while_shared_elsewhere() {
        let dir = TempDir::new().unwrap();
        let locker = DirectoryLocker::new();
        let other = DirectoryLocker::new();

        other.lock_directory(dir.path(), LockMode::Shared).unwrap();
        locker.lock_directory(dir.path(), LockMode::Shared).unwrap();
        assert!(locker
            .lock_directory(dir.path(), LockMode::Exclusive)
            .is_err());
        assert_eq!(locker.mode(dir.path()), Some(LockMode::Shared));

        locker.unlock_directory(dir.path());
        other.unlock_directory(dir.path());
    }

    #[test]
    fn test_excess_unlock_is_noop() {
        let dir = TempDir::new().unwrap();
        let locker = DirectoryLocker::new();

        locker.unlock_directory(dir.path());
        locker.lock_directory(dir.path(), LockMode::Shared).unwrap();
        locker.unlock_directory(dir.path());
        locker.unlock_directory(dir.path());
        locker.unlock_directory(Path::new("/definitely/not/here"));

        assert_eq!(locker.holds(dir.path()), 0);
        locker.lock_directory(dir.path(), LockMode::Exclusive).unwrap();
        locker.unlock_directory(dir.path());
    }

    #[test]
    fn test_paths_are_canonicalized() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let locker = DirectoryLocker::new();

        locker
            .lock_directory(&dir.path().join("sub"), LockMode::Exclusive)
            .unwrap();
        let dotted = dir.path().join("sub").join("..").join("sub");
        assert!(locker.lock_directory(&dotted, LockMode::Shared).is_err());
        locker.unlock_directory(&dotted);
        assert_eq!(locker.holds(&dir.path().join("sub")), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let locker = DirectoryLocker::new();
        {
            let _guard = locker.guard(dir.path(), LockMode::Exclusive).unwrap();
            assert_eq!(locker.mode(dir.path()), Some(LockMode::Exclusive));
        }
        assert_eq!(locker.holds(dir.path()), 0);
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_owned_guard_moves_across_threads() {
        let dir = TempDir::new().unwrap();
        let locker = Arc::new(DirectoryLocker::new());

        let guard = locker.owned_guard(dir.path(), LockMode::Shared).unwrap();
        let path = dir.path().to_path_buf();
        let denied = std::thread::spawn(move || {
            let other = DirectoryLocker::new();
            let denied = other.lock_directory(&path, LockMode::Exclusive).is_err();
            drop(guard);
            denied
        })
        .join()
        .unwrap();

        assert!(denied);
        assert_eq!(locker.holds(dir.path()), 0);
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let locker = DirectoryLocker::new();
        assert_matches!(
            locker.lock_directory(Path::new("/no/such/tiercache/dir"), LockMode::Shared),
            Err(Error::Io(_))
        );
    }

    #[test]
    fn test_concurrent_shared_locks_from_threads() {
        let dir = TempDir::new().unwrap();
        let locker = Arc::new(DirectoryLocker::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locker = locker.clone();
                let path = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    locker.lock_directory(&path, LockMode::Shared).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locker.holds(dir.path()), 8);
    }
}
