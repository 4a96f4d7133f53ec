//! # File Handle
//!
//! Owns the store's backing file and exposes exactly the operations the
//! storage layer consumes: positioned reads and writes, seek/tell, size,
//! truncate, sync, atomic non-replacing rename, and temporary-file creation.
//!
//! ## Open Dispositions
//!
//! [`FileHandle::open`] combines three orthogonal choices:
//!
//! - [`CreateDisposition`]: `CreateNew` (fail if present), `OpenExisting`,
//!   or `OpenAlways` (create if absent).
//! - [`Access`]: `ReadOnly` or `ReadWrite`.
//! - [`Presence`]: `MustExist` turns a missing file into an error;
//!   `AllowNotFound` yields `Ok(None)` so callers can probe.
//!
//! ## Non-Replacing Rename
//!
//! [`FileHandle::rename_noreplace`] must never clobber an existing
//! destination. On Linux this uses `renameat2(RENAME_NOREPLACE)`, which is
//! atomic in the kernel. Elsewhere on POSIX it falls back to
//! hard-link-then-unlink, which is equally atomic but leaves a transient
//! extra directory entry. A destination collision is reported as
//! [`StoreError::Exists`] in both cases.
//!
//! ## Temporary Files
//!
//! Temporary files are created in the first configured directory out of
//! `TMPDIR`, `TMP`, `TEMP`, `TEMPDIR`, defaulting to `/tmp`, and are deleted
//! when the returned handle drops.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tempfile::NamedTempFile;

use crate::error::StoreError;

/// Whether `open` may create the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    /// Create the file; fail with `Exists` if it is already present.
    CreateNew,
    /// Open an existing file only.
    OpenExisting,
    /// Open the file, creating it first if it does not exist.
    OpenAlways,
}

/// Read-only or read-write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// How a missing file is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// A missing file is an error.
    MustExist,
    /// A missing file yields `Ok(None)`.
    AllowNotFound,
}

/// An open store file.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl FileHandle {
    /// Opens `path` according to the given disposition, access, and
    /// presence policy.
    pub fn open(
        path: impl AsRef<Path>,
        create: CreateDisposition,
        access: Access,
        presence: Presence,
    ) -> Result<Option<FileHandle>> {
        let path = path.as_ref();
        let writable = access == Access::ReadWrite;

        ensure!(
            writable || create == CreateDisposition::OpenExisting,
            "cannot create '{}' read-only",
            path.display()
        );

        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        match create {
            CreateDisposition::CreateNew => {
                options.create_new(true);
            }
            CreateDisposition::OpenExisting => {}
            CreateDisposition::OpenAlways => {
                options.create(true);
            }
        }

        let file = match options.open(path) {
            Ok(file) => file,
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && presence == Presence::AllowNotFound =>
            {
                return Ok(None);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Exists {
                    path: path.to_path_buf(),
                })
                .wrap_err_with(|| format!("failed to create '{}'", path.display()));
            }
            Err(err) => {
                return Err(StoreError::Io(err))
                    .wrap_err_with(|| format!("failed to open '{}'", path.display()));
            }
        };

        Ok(Some(FileHandle {
            file,
            path: path.to_path_buf(),
            writable,
        }))
    }

    /// Opens an existing file, treating absence as an error.
    pub fn open_existing(path: impl AsRef<Path>, access: Access) -> Result<FileHandle> {
        let path = path.as_ref();
        Self::open(path, CreateDisposition::OpenExisting, access, Presence::MustExist)?
            .ok_or_else(|| eyre::eyre!("'{}' does not exist", path.display()))
    }

    /// Creates a new file, failing if it already exists.
    pub fn create_new(path: impl AsRef<Path>) -> Result<FileHandle> {
        let path = path.as_ref();
        Self::open(
            path,
            CreateDisposition::CreateNew,
            Access::ReadWrite,
            Presence::MustExist,
        )?
        .ok_or_else(|| eyre::eyre!("create_new('{}') returned no handle", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset).wrap_err_with(|| {
            format!(
                "failed to read {} bytes at offset {} from '{}'",
                buf.len(),
                offset,
                self.path.display()
            )
        })
    }

    /// Writes all of `buf` at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset).wrap_err_with(|| {
            format!(
                "failed to write {} bytes at offset {} to '{}'",
                buf.len(),
                offset,
                self.path.display()
            )
        })
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.file
            .seek(pos)
            .wrap_err_with(|| format!("seek failed on '{}'", self.path.display()))
    }

    pub fn tell(&mut self) -> Result<u64> {
        self.seek(SeekFrom::Current(0))
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?
            .len())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .wrap_err_with(|| format!("failed to truncate '{}' to {} bytes", self.path.display(), size))
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    /// Atomically renames this file to `to`, failing with
    /// [`StoreError::Exists`] if the destination is already present.
    pub fn rename_noreplace(&mut self, to: impl AsRef<Path>) -> Result<()> {
        let to = to.as_ref();
        rename_noreplace(&self.path, to)?;
        self.path = to.to_path_buf();
        Ok(())
    }
}

/// Atomic non-replacing rename.
///
/// Prefers the kernel-level `renameat2(RENAME_NOREPLACE)` where available,
/// falling back to hard-link-then-unlink on filesystems and platforms
/// without it.
pub fn rename_noreplace(from: &Path, to: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_from = CString::new(from.as_os_str().as_bytes())
            .wrap_err("source path contains an interior NUL byte")?;
        let c_to = CString::new(to.as_os_str().as_bytes())
            .wrap_err("destination path contains an interior NUL byte")?;

        // SAFETY: renameat2 only inspects the two NUL-terminated paths, both
        // of which outlive the call; RENAME_NOREPLACE makes the kernel fail
        // with EEXIST rather than clobbering the destination.
        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                c_from.as_ptr(),
                libc::AT_FDCWD,
                c_to.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EEXIST) => {
                return Err(StoreError::Exists {
                    path: to.to_path_buf(),
                }
                .into());
            }
            // Kernel or filesystem without RENAME_NOREPLACE support.
            Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) => {}
            _ => {
                return Err(StoreError::Io(err)).wrap_err_with(|| {
                    format!(
                        "failed to rename '{}' to '{}'",
                        from.display(),
                        to.display()
                    )
                });
            }
        }
    }

    link_then_unlink(from, to)
}

/// Hard-link-then-unlink rename: `link()` fails atomically if the
/// destination exists, after which removing the source completes the move.
fn link_then_unlink(from: &Path, to: &Path) -> Result<()> {
    match std::fs::hard_link(from, to) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(StoreError::Exists {
                path: to.to_path_buf(),
            }
            .into());
        }
        Err(err) => {
            return Err(StoreError::Io(err)).wrap_err_with(|| {
                format!("failed to link '{}' to '{}'", from.display(), to.display())
            });
        }
    }
    std::fs::remove_file(from)
        .wrap_err_with(|| format!("failed to unlink '{}' after rename", from.display()))
}

/// Temporary-file directories in the order they are consulted.
pub fn temp_directories() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = ["TMPDIR", "TMP", "TEMP", "TEMPDIR"]
        .iter()
        .filter_map(|name| std::env::var_os(name))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .collect();
    dirs.push(PathBuf::from("/tmp"));
    dirs
}

/// Creates a named temporary file that is deleted when the handle drops.
pub fn create_temporary(prefix: &str) -> Result<NamedTempFile> {
    let mut last_err = None;
    for dir in temp_directories() {
        match tempfile::Builder::new().prefix(prefix).tempfile_in(&dir) {
            Ok(file) => return Ok(file),
            Err(err) => last_err = Some((dir, err)),
        }
    }
    let (dir, err) = last_err.expect("temp_directories is never empty");
    Err(StoreError::Io(err))
        .wrap_err_with(|| format!("failed to create temporary file in '{}'", dir.display()))
}
