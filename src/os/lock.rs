//! # Byte-Range Locks
//!
//! Advisory POSIX `fcntl` record locks over a byte range of the store file.
//! The transaction layer takes an exclusive lock on a single byte of the
//! file header (the writer slot) to serialise writers across processes;
//! readers never lock.
//!
//! ## Semantics
//!
//! - [`RangeLock::lock`] blocks (`F_SETLKW`), retrying on `EINTR`.
//! - [`RangeLock::try_lock`] is non-blocking (`F_SETLK`) and returns
//!   `Ok(false)` when another process holds a conflicting lock.
//! - [`RangeLock::unlock`] is idempotent; the lock is also released when
//!   the guard drops. Moving a `RangeLock` transfers ownership of the held
//!   lock, so it can be stored inside the transaction that relies on it.
//!
//! ## POSIX Caveat
//!
//! fcntl locks belong to the (process, inode) pair, not to the file
//! descriptor: two handles onto the same file within one process do not
//! conflict, and closing any descriptor for the inode drops the process's
//! locks. Cross-process exclusion — the property the store needs — is
//! reliable. In-process exclusion is enforced separately by the borrow
//! checker (`Transaction::begin` takes `&mut Database`).

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use eyre::{Result, WrapErr};

use crate::error::StoreError;
use crate::os::file::FileHandle;

/// Shared-read or exclusive-write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    SharedRead,
    ExclusiveWrite,
}

impl LockKind {
    fn as_fcntl_type(self) -> libc::c_short {
        match self {
            LockKind::SharedRead => libc::F_RDLCK as libc::c_short,
            LockKind::ExclusiveWrite => libc::F_WRLCK as libc::c_short,
        }
    }
}

/// A scoped holder for one advisory byte-range lock.
#[derive(Debug)]
pub struct RangeLock {
    file: Arc<FileHandle>,
    offset: u64,
    len: u64,
    kind: LockKind,
    held: bool,
}

impl RangeLock {
    pub fn new(file: Arc<FileHandle>, offset: u64, len: u64, kind: LockKind) -> RangeLock {
        debug_assert!(len > 0);
        RangeLock {
            file,
            offset,
            len,
            kind,
            held: false,
        }
    }

    /// Acquires the lock, blocking until it is available.
    pub fn lock(&mut self) -> Result<()> {
        if self.held {
            return Ok(());
        }
        fcntl_lock(
            self.file.file().as_raw_fd(),
            self.kind.as_fcntl_type(),
            self.offset,
            self.len,
            true,
        )
        .wrap_err_with(|| {
            format!(
                "failed to lock bytes [{}, {}) of '{}'",
                self.offset,
                self.offset + self.len,
                self.file.path().display()
            )
        })?;
        self.held = true;
        Ok(())
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Ok(false)` if another process holds a conflicting lock.
    pub fn try_lock(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        let acquired = fcntl_lock(
            self.file.file().as_raw_fd(),
            self.kind.as_fcntl_type(),
            self.offset,
            self.len,
            false,
        )
        .wrap_err_with(|| {
            format!(
                "failed to probe lock on bytes [{}, {}) of '{}'",
                self.offset,
                self.offset + self.len,
                self.file.path().display()
            )
        })?;
        self.held = acquired;
        Ok(acquired)
    }

    /// Releases the lock. Unlocking a lock that is not held is a no-op.
    pub fn unlock(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        fcntl_lock(
            self.file.file().as_raw_fd(),
            libc::F_UNLCK as libc::c_short,
            self.offset,
            self.len,
            false,
        )
        .wrap_err_with(|| {
            format!(
                "failed to unlock bytes [{}, {}) of '{}'",
                self.offset,
                self.offset + self.len,
                self.file.path().display()
            )
        })?;
        self.held = false;
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(err) = self.unlock() {
                tracing::warn!(
                    path = %self.file.path().display(),
                    error = %err,
                    "failed to release byte-range lock on drop"
                );
            }
        }
    }
}

/// Issues one fcntl record-lock operation.
///
/// Returns `Ok(true)` if the lock was applied, `Ok(false)` if a non-blocking
/// request found a conflicting lock, and `Err` for real failures.
fn fcntl_lock(fd: RawFd, lock_type: libc::c_short, offset: u64, len: u64, blocking: bool) -> Result<bool> {
    let flock = libc::flock {
        l_type: lock_type,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: offset as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };

    loop {
        // SAFETY: fcntl reads the flock struct, which lives on this stack
        // frame for the duration of the call; fd is a raw descriptor whose
        // validity is guaranteed by the FileHandle the caller holds.
        let rc = unsafe { libc::fcntl(fd, cmd, &flock) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EACCES) | Some(libc::EAGAIN) if !blocking => {
                return if lock_type == libc::F_UNLCK as libc::c_short {
                    // Unlock never conflicts; treat as released.
                    Ok(true)
                } else {
                    Ok(false)
                };
            }
            _ => return Err(StoreError::Io(err).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::file::FileHandle;
    use tempfile::tempdir;

    fn open_handle(path: &std::path::Path) -> Arc<FileHandle> {
        Arc::new(FileHandle::create_new(path).unwrap())
    }

    #[test]
    fn lock_unlock_round_trip() {
        let dir = tempdir().unwrap();
        let file = open_handle(&dir.path().join("t.db"));
        file.write_at(0, &[0u8; 64]).unwrap();

        let mut lock = RangeLock::new(Arc::clone(&file), 0, 1, LockKind::ExclusiveWrite);
        assert!(!lock.is_held());
        lock.lock().unwrap();
        assert!(lock.is_held());
        lock.unlock().unwrap();
        assert!(!lock.is_held());
        // Idempotent.
        lock.unlock().unwrap();
    }

    #[test]
    fn try_lock_succeeds_when_free() {
        let dir = tempdir().unwrap();
        let file = open_handle(&dir.path().join("t.db"));
        file.write_at(0, &[0u8; 64]).unwrap();

        let mut lock = RangeLock::new(file, 4, 1, LockKind::ExclusiveWrite);
        assert!(lock.try_lock().unwrap());
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempdir().unwrap();
        let file = open_handle(&dir.path().join("t.db"));
        file.write_at(0, &[0u8; 64]).unwrap();

        {
            let mut lock = RangeLock::new(Arc::clone(&file), 0, 1, LockKind::ExclusiveWrite);
            lock.lock().unwrap();
        }
        // The same process can always re-lock; this checks the held flag
        // path rather than cross-process conflict (fcntl locks do not
        // conflict within one process).
        let mut again = RangeLock::new(file, 0, 1, LockKind::ExclusiveWrite);
        assert!(again.try_lock().unwrap());
    }
}
