//! # Database
//!
//! The top-level handle onto one store file. A [`Database`] owns the file,
//! the mapping set, and the current view of the revision chain.
//!
//! ## Open Modes
//!
//! - [`Database::create`] lays down a fresh file: header plus the initial
//!   revision-0 trailer, then opens it read-write.
//! - [`Database::open`] opens an existing file read-write.
//! - [`Database::open_read_only`] maps the file for reading only; any
//!   number of read-only handles may coexist with one writer, in this
//!   process or others.
//!
//! ## Reader Model
//!
//! A reader loads the footer pointer once at open (or on [`refresh`]) and
//! treats every byte below it as immutable — which the format guarantees —
//! so no locks are taken on the read path. Because the footer slot is
//! written atomically and only ever advances, a reader either sees the old
//! revision or the complete new one; torn state is impossible.
//!
//! ## Revision Traversal
//!
//! HEAD is the newest committed trailer. Older revisions stay reachable by
//! walking each trailer's `prev` link; [`Database::sync_to_revision`]
//! re-points the handle's *view* at an older trailer, after which index
//! loads and root lookups answer as of that revision. The view never
//! affects what a transaction appends.
//!
//! [`refresh`]: Database::refresh

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::address::{Address, TypedAddress};
use crate::database::layout::{
    timestamp_ms, FileHeader, HeaderBlock, Trailer, FILE_HEADER_SIZE, FOOTER_SLOT_OFFSET,
    TRAILER_SIZE,
};
use crate::error::StoreError;
use crate::index::{
    CompilationIndex, DebugLineHeaderIndex, Extent, FragmentIndex, IndexKind, NameIndex, PathIndex,
};
use crate::os::file::{Access, FileHandle};
use crate::storage::{Bytes, RegionFactory, Storage};

/// Read-only or read-write database access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// A handle onto one store file.
#[derive(Debug)]
pub struct Database {
    pub(crate) storage: Storage,
    pub(crate) path: PathBuf,
    pub(crate) writable: bool,
    /// Newest committed trailer.
    pub(crate) head: TypedAddress<Trailer>,
    /// Trailer the handle currently answers queries from; equals `head`
    /// unless rewound by `sync_to_revision`.
    pub(crate) view: TypedAddress<Trailer>,
    /// One past the last byte this handle may address: the end of HEAD, or
    /// the tail of the open transaction while one is active.
    pub(crate) logical_size: u64,
}

impl Database {
    /// Creates a new store file at `path` and opens it read-write.
    ///
    /// Fails with [`StoreError::Exists`] if the file is already present.
    pub fn create(path: impl AsRef<Path>) -> Result<Database> {
        Self::create_with(path, RegionFactory::default())
    }

    /// As [`Database::create`], with explicit region geometry.
    pub fn create_with(path: impl AsRef<Path>, factory: RegionFactory) -> Result<Database> {
        let path = path.as_ref();
        let file = FileHandle::create_new(path)
            .wrap_err_with(|| format!("failed to create store '{}'", path.display()))?;

        let now = timestamp_ms();
        let initial = Trailer::new(TypedAddress::NULL, 0, now, 0, Default::default());
        let header = FileHeader::new(
            now,
            *uuid::Uuid::new_v4().as_bytes(),
            Address::new(FILE_HEADER_SIZE as u64),
        );

        file.write_at(0, header.as_bytes())?;
        file.write_at(FILE_HEADER_SIZE as u64, initial.as_bytes())?;
        file.sync()?;

        info!(path = %path.display(), "created store");
        Self::open_handle(file, factory)
    }

    /// Opens an existing store file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        Self::open_with(path, AccessMode::ReadWrite, RegionFactory::default())
    }

    /// Opens an existing store file read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Database> {
        Self::open_with(path, AccessMode::ReadOnly, RegionFactory::default())
    }

    /// As [`Database::open`], with explicit access mode and region geometry.
    pub fn open_with(
        path: impl AsRef<Path>,
        access: AccessMode,
        factory: RegionFactory,
    ) -> Result<Database> {
        let path = path.as_ref();
        let file_access = match access {
            AccessMode::ReadOnly => Access::ReadOnly,
            AccessMode::ReadWrite => Access::ReadWrite,
        };
        let file = FileHandle::open_existing(path, file_access)
            .wrap_err_with(|| format!("failed to open store '{}'", path.display()))?;
        Self::open_handle(file, factory)
    }

    fn open_handle(file: FileHandle, factory: RegionFactory) -> Result<Database> {
        let path = file.path().to_path_buf();
        let writable = file.is_writable();

        let mut header_bytes = [0u8; FILE_HEADER_SIZE];
        file.read_at(0, &mut header_bytes)
            .wrap_err_with(|| format!("failed to read header of '{}'", path.display()))?;
        let header = FileHeader::from_bytes(&header_bytes)?;
        let footer = header.footer();

        let file_size = file.size()?;
        ensure!(
            footer.absolute() >= FILE_HEADER_SIZE as u64
                && footer.absolute() + TRAILER_SIZE as u64 <= file_size,
            StoreError::corrupt(
                "file header",
                FOOTER_SLOT_OFFSET,
                format!(
                    "footer pointer {:#x} outside file of {} bytes",
                    footer.absolute(),
                    file_size
                )
            )
        );

        let logical_size = footer.absolute() + TRAILER_SIZE as u64;
        let mut storage = Storage::new(Arc::new(file), factory, writable);
        storage.map_bytes(0, logical_size)?;

        let mut db = Database {
            storage,
            path,
            writable,
            head: footer,
            view: footer,
            logical_size,
        };

        // Integrity-check the head trailer before handing the database out.
        let head = db.trailer_at(footer)?;
        debug!(
            path = %db.path.display(),
            revision = head.revision(),
            size = db.logical_size,
            "opened store"
        );
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Address of the newest committed trailer.
    pub fn head(&self) -> TypedAddress<Trailer> {
        self.head
    }

    /// Revision number of the newest committed trailer.
    pub fn head_revision(&self) -> Result<u64> {
        Ok(self.trailer_at(self.head)?.revision())
    }

    /// The trailer the handle currently answers queries from.
    pub fn view(&self) -> TypedAddress<Trailer> {
        self.view
    }

    /// Re-reads the footer slot, picking up revisions committed by another
    /// process since the handle was opened.
    ///
    /// Resets the view to the new HEAD.
    pub fn refresh(&mut self) -> Result<()> {
        let footer = Address::new(
            self.storage
                .atomic_load_u64(Address::new(FOOTER_SLOT_OFFSET))?,
        );

        if footer == self.head.to_address() {
            self.view = self.head;
            return Ok(());
        }

        let file_size = self.storage.file().size()?;
        ensure!(
            footer.absolute() >= FILE_HEADER_SIZE as u64
                && footer.absolute() + TRAILER_SIZE as u64 <= file_size,
            StoreError::corrupt(
                "file header",
                FOOTER_SLOT_OFFSET,
                format!(
                    "footer pointer {:#x} outside file of {} bytes",
                    footer.absolute(),
                    file_size
                )
            )
        );

        let new_logical = footer.absolute() + TRAILER_SIZE as u64;
        self.storage.map_bytes(self.logical_size, new_logical)?;
        self.logical_size = new_logical;
        self.head = TypedAddress::new(footer);
        self.view = self.head;
        self.trailer_at(self.head)?;
        Ok(())
    }

    /// Fetches `[addr, addr + len)` from the store with bounds checking.
    pub fn read_bytes(&self, addr: Address, len: usize) -> Result<Bytes> {
        ensure!(
            addr.absolute() >= FILE_HEADER_SIZE as u64
                && addr.absolute() + len as u64 <= self.logical_size,
            StoreError::bad_address(addr.absolute(), "range lies outside the allocated store")
        );
        self.storage.bytes_at(addr, len)
    }

    /// Reads a fixed-layout value at `addr` by copy.
    pub fn read_copy<T: FromBytes>(&self, addr: TypedAddress<T>) -> Result<T> {
        let bytes = self.read_bytes(addr.to_address(), std::mem::size_of::<T>())?;
        T::read_from_bytes(&bytes).map_err(|e| eyre::eyre!("failed to decode value: {:?}", e))
    }

    /// Parses and integrity-checks the trailer at `addr`.
    pub fn trailer_at(&self, addr: TypedAddress<Trailer>) -> Result<Trailer> {
        let bytes = self.read_bytes(addr.to_address(), TRAILER_SIZE)?;
        Trailer::from_bytes(&bytes, addr.to_address())
    }

    /// Walks the revision chain from HEAD back to the creation trailer.
    pub fn revisions(&self) -> Revisions<'_> {
        Revisions {
            db: self,
            next: Some(self.head),
        }
    }

    /// Re-points the view at revision `revision`.
    ///
    /// Index loads and root lookups subsequently answer as of that
    /// revision. `refresh` returns the view to HEAD.
    pub fn sync_to_revision(&mut self, revision: u64) -> Result<()> {
        let mut cursor = self.head;
        loop {
            let trailer = self.trailer_at(cursor)?;
            match trailer.revision().cmp(&revision) {
                std::cmp::Ordering::Equal => {
                    self.view = cursor;
                    return Ok(());
                }
                std::cmp::Ordering::Less => {
                    eyre::bail!(
                        "revision {} does not exist (head is {})",
                        revision,
                        self.trailer_at(self.head)?.revision()
                    );
                }
                std::cmp::Ordering::Greater => {
                    cursor = trailer.prev();
                    ensure!(
                        !cursor.is_null(),
                        "revision chain ended before revision {}",
                        revision
                    );
                }
            }
        }
    }

    /// Header-block address of `kind` as of the current view, if the index
    /// has ever been flushed.
    pub fn index_root(&self, kind: IndexKind) -> Result<Option<TypedAddress<HeaderBlock>>> {
        let trailer = self.trailer_at(self.view)?;
        let root = trailer.index_root(kind as usize);
        Ok(if root.is_null() {
            None
        } else {
            Some(TypedAddress::new(root))
        })
    }

    /// Loads the fragment index (content digest → extent) at the current
    /// view.
    pub fn fragment_index(&self) -> Result<FragmentIndex> {
        FragmentIndex::load(self, self.index_root(IndexKind::Fragments)?)
    }

    /// Loads the compilation index (content digest → extent) at the current
    /// view.
    pub fn compilation_index(&self) -> Result<CompilationIndex> {
        CompilationIndex::load(self, self.index_root(IndexKind::Compilations)?)
    }

    /// Loads the interned-name set at the current view.
    pub fn name_index(&self) -> Result<NameIndex> {
        NameIndex::load(self, self.index_root(IndexKind::Names)?)
    }

    /// Loads the interned-path set at the current view.
    pub fn path_index(&self) -> Result<PathIndex> {
        PathIndex::load(self, self.index_root(IndexKind::Paths)?)
    }

    /// Loads the debug-line-header index at the current view.
    pub fn debug_line_header_index(&self) -> Result<DebugLineHeaderIndex> {
        DebugLineHeaderIndex::load(self, self.index_root(IndexKind::DebugLineHeaders)?)
    }

    /// Fetches the bytes of a content-addressed record, validating the
    /// extent against the allocated store.
    pub fn get_extent(&self, extent: Extent) -> Result<Bytes> {
        let addr = Address::new(extent.addr());
        ensure!(
            !addr.is_null(),
            StoreError::bad_address(0, "null extent address")
        );
        self.read_bytes(addr, extent.size() as usize)
            .wrap_err("extent lies outside the store")
    }

}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.writable {
            return;
        }
        // The file grows in region-sized strides while open; give the bytes
        // back on close so the on-disk size matches the committed size.
        // Another process may be mid-transaction with reservations past our
        // logical size, so only trim while holding the writer lock.
        let mut lock = crate::os::lock::RangeLock::new(
            Arc::clone(self.storage.file_handle()),
            crate::database::layout::WRITER_LOCK_OFFSET,
            1,
            crate::os::lock::LockKind::ExclusiveWrite,
        );
        match lock.try_lock() {
            Ok(true) => {
                if let Err(err) = self.storage.file().truncate(self.logical_size) {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "failed to trim store to logical size on close"
                    );
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to probe the writer lock on close"
                );
            }
        }
    }
}

/// Iterator over the revision chain, newest first.
pub struct Revisions<'db> {
    db: &'db Database,
    next: Option<TypedAddress<Trailer>>,
}

impl Iterator for Revisions<'_> {
    type Item = Result<(TypedAddress<Trailer>, Trailer)>;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next?;
        match self.db.trailer_at(addr) {
            Ok(trailer) => {
                let prev = trailer.prev();
                self.next = if prev.is_null() { None } else { Some(prev) };
                Some(Ok((addr, trailer)))
            }
            Err(err) => {
                self.next = None;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_writes_header_and_initial_trailer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        let db = Database::create(&path).unwrap();
        assert_eq!(db.head_revision().unwrap(), 0);
        assert_eq!(db.head().absolute(), FILE_HEADER_SIZE as u64);

        let trailer = db.trailer_at(db.head()).unwrap();
        assert_eq!(trailer.size(), 0);
        assert!(trailer.prev().is_null());
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        Database::create(&path).unwrap();

        let err = Database::create(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Exists { .. })
        ));
    }

    #[test]
    fn reopen_sees_the_same_creation_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let created = Database::create(&path).unwrap();
        let head = created.head();
        drop(created);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.head(), head);
        assert_eq!(db.head_revision().unwrap(), 0);
    }

    #[test]
    fn close_trims_file_to_logical_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let expected = {
            let db = Database::create(&path).unwrap();
            db.logical_size
        };
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn read_only_open_rejects_out_of_bounds_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        drop(Database::create(&path).unwrap());

        let db = Database::open_read_only(&path).unwrap();
        assert!(!db.is_writable());
        let err = db
            .read_bytes(Address::new(db.logical_size), 1)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::BadAddress { .. })
        ));
    }

    #[test]
    fn corrupted_footer_is_rejected_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        drop(Database::create(&path).unwrap());

        // Point the footer slot past the end of the file.
        {
            use std::os::unix::fs::FileExt;
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap();
            file.write_all_at(&u64::MAX.to_le_bytes(), FOOTER_SLOT_OFFSET)
                .unwrap();
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn revisions_iterates_to_the_creation_trailer() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("t.db")).unwrap();

        let chain: Vec<_> = db.revisions().collect::<Result<_>>().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].1.revision(), 0);
    }

    #[test]
    fn sync_to_missing_revision_fails() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("t.db")).unwrap();
        assert!(db.sync_to_revision(0).is_ok());
        assert!(db.sync_to_revision(3).is_err());
    }
}
