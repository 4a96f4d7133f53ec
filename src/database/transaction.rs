//! # Transactions
//!
//! A [`Transaction`] is the only way bytes enter the store. It wraps an
//! append-only sequence of allocations that ends in either [`commit`] or
//! rollback-on-drop.
//!
//! ## Writer Exclusion
//!
//! Beginning a transaction acquires an exclusive fcntl byte-range lock on
//! the writer byte of the file header, serialising writers across
//! processes; [`Database::try_begin`] fails fast with
//! [`StoreError::LockUnavailable`] when another writer holds it. Within the
//! process, `begin` takes `&mut Database`, so the borrow checker rules out
//! a second in-process writer (and any stale in-process read view) at
//! compile time — the same discipline the storage layer's grow path relies
//! on.
//!
//! After the lock is acquired the handle refreshes its footer pointer, so
//! the transaction always extends the true HEAD even if another process
//! committed since this handle last looked.
//!
//! ## Commit Protocol
//!
//! ```text
//! 1. callers flush dirty indexes; each flush yields a header block whose
//!    address is recorded with set_root()
//! 2. the appended byte range is sealed read-only (page protection)
//! 3. the trailer is appended: prev, revision + 1, timestamp, size,
//!    index-root table, crc32, signature
//! 4. mapped ranges are flushed, then ONE atomic 8-byte store publishes
//!    the trailer address in the header's footer slot
//! 5. the writer lock is released (guard drop)
//! ```
//!
//! Step 4 is the commit point: a crash on either side of it leaves the
//! file with a valid footer — the old one or the new one — and readers can
//! never observe a torn revision.
//!
//! ## Rollback
//!
//! Dropping a transaction without committing shrinks the mapping set back
//! to the pre-transaction size and restores the handle's logical size.
//! Nothing was published, so the file contents below the footer are
//! untouched; the file itself is trimmed when the database closes.
//!
//! [`commit`]: Transaction::commit

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, warn};
use zerocopy::{Immutable, IntoBytes};

use crate::address::{Address, TypedAddress, MAX_STORE_SIZE};
use crate::database::database::Database;
use crate::database::layout::{
    timestamp_ms, HeaderBlock, Trailer, FOOTER_SLOT_OFFSET, TRAILER_SIZE, WRITER_LOCK_OFFSET,
};
use crate::error::StoreError;
use crate::index::{IndexKind, INDEX_ROOT_SLOTS};
use crate::os::lock::{LockKind, RangeLock};

/// An open write transaction.
pub struct Transaction<'db> {
    db: &'db mut Database,
    /// Held for the whole transaction; released on drop.
    _lock: RangeLock,
    /// Logical size of the store when the transaction began.
    first: u64,
    prev_footer: TypedAddress<Trailer>,
    prev_revision: u64,
    roots: [u64; INDEX_ROOT_SLOTS],
    committed: bool,
}

impl Database {
    /// Begins a write transaction, blocking until the writer lock is
    /// available.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        let mut lock = self.writer_lock()?;
        lock.lock().wrap_err("failed to acquire the writer lock")?;
        Transaction::start(self, lock)
    }

    /// Begins a write transaction without blocking.
    ///
    /// Fails with [`StoreError::LockUnavailable`] if another process holds
    /// the writer lock.
    pub fn try_begin(&mut self) -> Result<Transaction<'_>> {
        let mut lock = self.writer_lock()?;
        if !lock.try_lock()? {
            return Err(StoreError::LockUnavailable)
                .wrap_err_with(|| format!("cannot write to '{}'", self.path().display()));
        }
        Transaction::start(self, lock)
    }

    fn writer_lock(&self) -> Result<RangeLock> {
        ensure!(
            self.is_writable(),
            "store '{}' is open read-only",
            self.path().display()
        );
        Ok(RangeLock::new(
            std::sync::Arc::clone(self.storage.file_handle()),
            WRITER_LOCK_OFFSET,
            1,
            LockKind::ExclusiveWrite,
        ))
    }
}

impl<'db> Transaction<'db> {
    fn start(db: &'db mut Database, lock: RangeLock) -> Result<Transaction<'db>> {
        debug_assert!(lock.is_held());

        // Another process may have committed since this handle last read
        // the footer; the new transaction must extend the true HEAD.
        db.refresh()
            .wrap_err("failed to refresh the footer pointer at transaction start")?;

        let head = db.trailer_at(db.head())?;
        Ok(Transaction {
            first: db.logical_size,
            prev_footer: db.head(),
            prev_revision: head.revision(),
            roots: head.index_roots(),
            db,
            _lock: lock,
            committed: false,
        })
    }

    /// Read access to the database while the transaction is open.
    pub fn db(&self) -> &Database {
        self.db
    }

    /// Bytes appended by this transaction so far.
    pub fn size(&self) -> u64 {
        self.db.logical_size - self.first
    }

    /// Reserves `size` bytes at an address padded to `align` (a power of
    /// two), growing the mapping set on demand.
    ///
    /// The returned range may be written freely until [`commit`].
    ///
    /// [`commit`]: Transaction::commit
    pub fn alloc(&mut self, size: u64, align: u64) -> Result<Address> {
        ensure!(
            align.is_power_of_two(),
            "allocation alignment {} is not a power of two",
            align
        );

        let old_logical = self.db.logical_size;
        let addr = Address::new(old_logical).align_up(align);
        let new_logical = addr.absolute() + size;
        ensure!(
            new_logical <= MAX_STORE_SIZE,
            "store is full: {} bytes requested of a {} byte address space",
            new_logical,
            MAX_STORE_SIZE
        );

        self.db.storage.map_bytes(old_logical, new_logical)?;
        self.db.logical_size = new_logical;
        Ok(addr)
    }

    /// Writes `data` at `addr`, which must lie within this transaction's
    /// appended range.
    pub fn write(&mut self, addr: Address, data: &[u8]) -> Result<()> {
        ensure!(
            addr.absolute() >= self.first
                && addr.absolute() + data.len() as u64 <= self.db.logical_size,
            StoreError::bad_address(
                addr.absolute(),
                "write outside the open transaction's range"
            )
        );
        self.db.storage.write_from(addr, data)
    }

    /// Allocates and writes `data` in one step.
    pub fn put_bytes(&mut self, data: &[u8], align: u64) -> Result<Address> {
        let addr = self.alloc(data.len() as u64, align)?;
        self.db.storage.write_from(addr, data)?;
        Ok(addr)
    }

    /// Allocates and writes one fixed-layout value.
    pub fn put<T: IntoBytes + Immutable>(&mut self, value: &T, align: u64) -> Result<TypedAddress<T>> {
        Ok(TypedAddress::new(self.put_bytes(value.as_bytes(), align)?))
    }

    /// Records the flushed header block of `kind` for the trailer's root
    /// table. Kinds never set inherit the previous revision's roots.
    pub fn set_root(&mut self, kind: IndexKind, block: TypedAddress<HeaderBlock>) {
        self.roots[kind as usize] = block.absolute();
    }

    /// The root-table entry `kind` will have after commit.
    pub fn root(&self, kind: IndexKind) -> Address {
        Address::new(self.roots[kind as usize])
    }

    /// Commits the transaction and returns the new revision number.
    pub fn commit(mut self) -> Result<u64> {
        let end = self.db.logical_size;
        let appended = end - self.first;
        let revision = self.prev_revision + 1;

        // Seal the appended bytes before the trailer goes down; the trailer
        // itself lands beyond the sealed range.
        self.db.storage.protect(self.first, end)?;

        let trailer = Trailer::new(
            self.prev_footer,
            revision,
            timestamp_ms(),
            appended,
            self.roots,
        );
        let trailer_addr = self.put(&trailer, 8)?;

        // Make every appended byte durable before publishing it, then the
        // single atomic footer store *is* the commit.
        self.db
            .storage
            .flush_range(self.first, self.db.logical_size)?;
        self.db
            .storage
            .atomic_store_u64(Address::new(FOOTER_SLOT_OFFSET), trailer_addr.absolute())?;
        self.db.storage.flush_range(0, FOOTER_SLOT_OFFSET + 8)?;

        self.db.head = trailer_addr;
        self.db.view = trailer_addr;
        debug_assert_eq!(
            self.db.logical_size,
            trailer_addr.absolute() + TRAILER_SIZE as u64
        );

        self.committed = true;
        debug!(
            path = %self.db.path().display(),
            revision,
            bytes = appended,
            "committed revision"
        );
        Ok(revision)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let end = self.db.logical_size;
        debug!(
            path = %self.db.path().display(),
            bytes = end - self.first,
            "rolling back abandoned transaction"
        );
        // Re-open any pages the commit path sealed before failing, then
        // give back the reservations. Nothing was published: the footer
        // still names the previous trailer.
        if let Err(err) = self.db.storage.unprotect(self.first, end) {
            warn!(error = %err, "failed to unseal rolled-back pages");
        }
        self.db.storage.shrink(self.first);
        self.db.logical_size = self.first;
    }
}
