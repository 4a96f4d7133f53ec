//! # Storage and the Segment Address Table
//!
//! [`Storage`] owns the mapping set for one store file and translates
//! 64-bit store addresses into raw memory. The translation table — the
//! segment address table (SAT) — has one entry per possible 4 MiB segment,
//! each holding the segment's base pointer and a shared handle to the
//! region that maps it.
//!
//! ## Invariants
//!
//! 1. SAT entry `i` is populated iff byte range `[i*SEG, (i+1)*SEG)` is
//!    mapped.
//! 2. Every SAT entry points into exactly the region recorded beside it.
//! 3. Regions are contiguous and ordered by file offset; the physical size
//!    is the end of the last region.
//!
//! ## Growth and Shrink
//!
//! [`Storage::map_bytes`] grows the mapping set through the region factory
//! when the logical size outruns the physical size, then populates the new
//! SAT entries. Abandoned transactions call it with a smaller size, which
//! drops every region lying entirely at or beyond the new end. Outstanding
//! read views keep dropped regions alive through their `Arc` until the
//! views die.
//!
//! ## Spanning Requests
//!
//! Regions are contiguous in the file but not in the address space, so a
//! byte range can straddle a region boundary. Such requests are broken into
//! per-region chunks ([`Storage::read_into`] / [`Storage::write_from`]);
//! a straddle-free request is served zero-copy as a [`SharedBytes`] view.
//! The `always-spanning` cargo feature (or [`Storage::set_always_spanning`]
//! in tests) forces every request down the chunked path to keep it honest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use tracing::trace;

use crate::address::{Address, SEGMENT_COUNT, SEGMENT_SIZE};
use crate::database::layout::FILE_HEADER_SIZE;
use crate::error::StoreError;
use crate::os::file::FileHandle;
use crate::storage::factory::RegionFactory;
use crate::storage::region::{page_size, RegionPtr};

/// One segment's translation entry.
#[derive(Debug, Clone)]
struct SatEntry {
    /// Base pointer of the segment's bytes; always lies within `region`.
    base: *mut u8,
    /// The region that maps this segment.
    region: RegionPtr,
}

impl SatEntry {
    #[cfg(debug_assertions)]
    fn is_valid(&self) -> bool {
        let base = self.region.base() as usize;
        let ptr = self.base as usize;
        ptr >= base && ptr + SEGMENT_SIZE as usize <= base + self.region.size() as usize
    }
}

/// A zero-copy view of mapped store bytes.
///
/// Holds a shared handle to the owning region, so the mapping outlives the
/// view even if the storage shrinks underneath it.
#[derive(Debug)]
pub struct SharedBytes {
    _region: RegionPtr,
    ptr: *const u8,
    len: usize,
}

impl std::ops::Deref for SharedBytes {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len name mapped bytes inside `_region`, which this
        // view keeps alive; the bytes are committed store content and thus
        // immutable for the lifetime of the view.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

// SAFETY: the view is an immutable window onto committed (never rewritten)
// bytes and owns an Arc to the mapping that backs them.
unsafe impl Send for SharedBytes {}
// SAFETY: as above.
unsafe impl Sync for SharedBytes {}

/// Bytes fetched from the store: a zero-copy mapped view when the range
/// lies in one region, an owned copy when it spans regions.
#[derive(Debug)]
pub enum Bytes {
    Mapped(SharedBytes),
    Owned(Box<[u8]>),
}

impl std::ops::Deref for Bytes {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            Bytes::Mapped(view) => view,
            Bytes::Owned(buf) => buf,
        }
    }
}

/// Process-local mapping state for one store file.
#[derive(Debug)]
pub struct Storage {
    file: Arc<FileHandle>,
    factory: RegionFactory,
    regions: Vec<RegionPtr>,
    sat: Box<[Option<SatEntry>]>,
    writable: bool,
    always_spanning: bool,
}

// SAFETY: the raw pointers cached in the SAT belong to regions owned by
// this Storage; mutation is confined to the single writer that holds
// `&mut` access at the database layer, and committed bytes are immutable.
unsafe impl Send for Storage {}
// SAFETY: as above; concurrent `&self` use only reads committed bytes.
unsafe impl Sync for Storage {}

impl Storage {
    pub fn new(file: Arc<FileHandle>, factory: RegionFactory, writable: bool) -> Storage {
        let sat = (0..SEGMENT_COUNT).map(|_| None).collect();
        Storage {
            file,
            factory,
            regions: Vec::new(),
            sat,
            writable,
            always_spanning: cfg!(feature = "always-spanning"),
        }
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    pub(crate) fn file_handle(&self) -> &Arc<FileHandle> {
        &self.file
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// End of the mapped byte range.
    pub fn physical_size(&self) -> u64 {
        self.regions.last().map_or(0, |r| r.end())
    }

    /// Forces every request through the chunked spanning path.
    pub fn set_always_spanning(&mut self, on: bool) {
        self.always_spanning = on;
    }

    /// Adjusts the mapping set to accommodate `new_logical_size` bytes.
    ///
    /// Growing maps new regions and populates their SAT entries; a smaller
    /// size than `old_logical_size` shrinks instead.
    pub fn map_bytes(&mut self, old_logical_size: u64, new_logical_size: u64) -> Result<()> {
        let old_physical = self.physical_size();
        if new_logical_size > old_physical {
            let old_count = self.regions.len();
            self.factory.add(
                &self.file,
                &mut self.regions,
                old_physical,
                new_logical_size,
                self.writable,
            )?;
            self.update_master_pointers(old_count);
            return Ok(());
        }
        if new_logical_size < old_logical_size {
            self.shrink(new_logical_size);
        }
        Ok(())
    }

    /// Drops every region lying entirely at or beyond `new_size` and clears
    /// its SAT entries.
    pub fn shrink(&mut self, new_size: u64) {
        while let Some(region) = self.regions.last() {
            if region.offset() < new_size {
                break;
            }
            let first = (region.offset() / SEGMENT_SIZE) as usize;
            let count = (region.size() / SEGMENT_SIZE) as usize;
            trace!(offset = region.offset(), size = region.size(), "dropping region");
            for entry in &mut self.sat[first..first + count] {
                debug_assert!(entry.is_some());
                *entry = None;
            }
            self.regions.pop();
        }
        debug_assert!(self
            .sat
            .iter()
            .skip((self.physical_size() / SEGMENT_SIZE) as usize)
            .all(Option::is_none));
    }

    /// Populates SAT entries for regions appended after `old_region_count`.
    fn update_master_pointers(&mut self, old_region_count: usize) {
        for region in &self.regions[old_region_count..] {
            let first = (region.offset() / SEGMENT_SIZE) as usize;
            let count = (region.size() / SEGMENT_SIZE) as usize;
            for (i, entry) in self.sat[first..first + count].iter_mut().enumerate() {
                debug_assert!(entry.is_none());
                // SAFETY: i * SEGMENT_SIZE < region.size(), so the offset
                // stays inside the region's mapping.
                let base = unsafe { region.base().add(i * SEGMENT_SIZE as usize) };
                *entry = Some(SatEntry {
                    base,
                    region: Arc::clone(region),
                });
            }
        }
        #[cfg(debug_assertions)]
        for entry in self.sat.iter().flatten() {
            debug_assert!(entry.is_valid());
        }
    }

    fn sat_entry(&self, segment: u32) -> Result<&SatEntry> {
        self.sat
            .get(segment as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                StoreError::bad_address(
                    u64::from(segment) * SEGMENT_SIZE,
                    "address lies in an unmapped segment",
                )
                .into()
            })
    }

    /// Base pointer of a mapped segment.
    pub fn segment_base(&self, segment: u32) -> Result<*mut u8> {
        let entry = self.sat_entry(segment)?;
        #[cfg(debug_assertions)]
        debug_assert!(entry.is_valid());
        Ok(entry.base)
    }

    /// True iff `[addr, addr + size)` touches more than one region.
    pub fn request_spans_regions(&self, addr: Address, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        if self.always_spanning {
            return true;
        }
        let first = self.sat[addr.segment() as usize].as_ref();
        let last = self.sat[(addr.add(size - 1)).segment() as usize].as_ref();
        match (first, last) {
            (Some(a), Some(b)) => !Arc::ptr_eq(&a.region, &b.region),
            _ => true,
        }
    }

    /// Returns a zero-copy view of `[addr, addr + len)`.
    ///
    /// The range must lie within a single region; spanning requests go
    /// through [`Storage::read_into`].
    pub fn shared_at(&self, addr: Address, len: usize) -> Result<SharedBytes> {
        let entry = self.sat_entry(addr.segment())?;
        debug_assert!(
            addr.absolute() + len as u64 <= entry.region.end(),
            "shared_at range crosses a region boundary"
        );
        // SAFETY: the segment base is valid for its region and
        // addr.offset() < SEGMENT_SIZE keeps the pointer in bounds.
        let ptr = unsafe { entry.base.add(addr.offset() as usize) };
        Ok(SharedBytes {
            _region: Arc::clone(&entry.region),
            ptr,
            len,
        })
    }

    /// Invokes `chunk` once per region-contiguous piece of
    /// `[addr, addr + size)`.
    ///
    /// `chunk` receives the in-store pointer, the offset of the piece
    /// within the request, and the piece length. This is the shared core of
    /// both copy directions.
    pub(crate) fn for_each_chunk(
        &self,
        addr: Address,
        size: usize,
        mut chunk: impl FnMut(*mut u8, usize, usize),
    ) -> Result<()> {
        let mut pos = addr.absolute();
        let mut done = 0usize;
        while done < size {
            let entry = self.sat_entry(Address::new(pos).segment())?;
            let in_region = (entry.region.end() - pos) as usize;
            let len = in_region.min(size - done);
            // SAFETY: pos lies in this entry's segment and `len` does not
            // pass the end of the region's contiguous mapping.
            let ptr = unsafe { entry.base.add((pos % SEGMENT_SIZE) as usize) };
            chunk(ptr, done, len);
            pos += len as u64;
            done += len;
        }
        Ok(())
    }

    /// Copies `[addr, addr + out.len())` from the store into `out`,
    /// chunking across region boundaries.
    pub fn read_into(&self, addr: Address, out: &mut [u8]) -> Result<()> {
        let base = out.as_mut_ptr();
        self.for_each_chunk(addr, out.len(), |store, off, len| {
            // SAFETY: `store` is valid for `len` mapped bytes (see
            // for_each_chunk) and `base + off` stays within `out`; the two
            // ranges cannot overlap because `out` is ordinary heap/stack
            // memory.
            unsafe { std::ptr::copy_nonoverlapping(store, base.add(off), len) };
        })
    }

    /// Copies `data` into the store at `addr`, chunking across region
    /// boundaries.
    pub fn write_from(&self, addr: Address, data: &[u8]) -> Result<()> {
        ensure!(self.writable, "store is read-only");
        let base = data.as_ptr();
        self.for_each_chunk(addr, data.len(), |store, off, len| {
            // SAFETY: as in read_into, with the copy direction reversed;
            // the single-writer protocol guarantees no other thread or
            // process accesses these not-yet-published bytes.
            unsafe { std::ptr::copy_nonoverlapping(base.add(off), store, len) };
        })
    }

    /// Fetches `[addr, addr + len)`: zero-copy when possible, an owned
    /// buffer when the range spans regions.
    pub fn bytes_at(&self, addr: Address, len: usize) -> Result<Bytes> {
        if self.request_spans_regions(addr, len as u64) {
            let mut buf = vec![0u8; len].into_boxed_slice();
            self.read_into(addr, &mut buf)?;
            Ok(Bytes::Owned(buf))
        } else {
            Ok(Bytes::Mapped(self.shared_at(addr, len)?))
        }
    }

    /// Marks the pages covered by `[first, last)` read-only.
    ///
    /// The start is clamped past the header page so the footer-pointer slot
    /// is never protected; partial pages at either end are left writable.
    pub fn protect(&self, first: u64, last: u64) -> Result<()> {
        let page = page_size();
        let floor = (FILE_HEADER_SIZE as u64 + page - 1) & !(page - 1);
        let first = (first & !(page - 1)).max(floor);
        let last = last & !(page - 1);

        for region in self.regions.iter().rev() {
            if region.end() <= first {
                break;
            }
            let lo = first.max(region.offset());
            let hi = last.min(region.end());
            if hi > lo {
                region.read_only(lo, hi - lo)?;
            }
        }
        Ok(())
    }

    /// Restores write access to the pages covered by `[first, last)`.
    ///
    /// Mirror of [`Storage::protect`], applied when an abandoned
    /// transaction rolls back a range that had already been sealed.
    pub fn unprotect(&self, first: u64, last: u64) -> Result<()> {
        let page = page_size();
        let floor = (FILE_HEADER_SIZE as u64 + page - 1) & !(page - 1);
        let first = (first & !(page - 1)).max(floor);
        let last = last & !(page - 1);

        for region in self.regions.iter().rev() {
            if region.end() <= first {
                break;
            }
            let lo = first.max(region.offset());
            let hi = last.min(region.end());
            if hi > lo {
                region.read_write(lo, hi - lo)?;
            }
        }
        Ok(())
    }

    /// Flushes the mapped bytes of `[first, last)` to disk.
    pub fn flush_range(&self, first: u64, last: u64) -> Result<()> {
        for region in &self.regions {
            let lo = first.max(region.offset());
            let hi = last.min(region.end());
            if hi > lo {
                region.flush_range(lo, hi - lo)?;
            }
        }
        Ok(())
    }

    /// Atomically loads the u64 at `addr` with acquire ordering.
    pub fn atomic_load_u64(&self, addr: Address) -> Result<u64> {
        let ptr = self.u64_slot(addr)?;
        // SAFETY: u64_slot checked mapping and 8-byte alignment; atomics on
        // shared file mappings are the cross-process publication protocol.
        let raw = unsafe { AtomicU64::from_ptr(ptr) }.load(Ordering::Acquire);
        Ok(u64::from_le(raw))
    }

    /// Atomically stores `value` at `addr` with release ordering.
    ///
    /// This single store is the commit point of the entire format.
    pub fn atomic_store_u64(&self, addr: Address, value: u64) -> Result<()> {
        ensure!(self.writable, "store is read-only");
        let ptr = self.u64_slot(addr)?;
        // SAFETY: as in atomic_load_u64. The slot is stored little-endian
        // to match the rest of the format.
        unsafe { AtomicU64::from_ptr(ptr) }.store(value.to_le(), Ordering::Release);
        Ok(())
    }

    fn u64_slot(&self, addr: Address) -> Result<*mut u64> {
        ensure!(
            addr.absolute() % 8 == 0,
            StoreError::bad_address(addr.absolute(), "atomic slot is not 8-byte aligned")
        );
        let base = self.segment_base(addr.segment())?;
        // SAFETY: offset() < SEGMENT_SIZE, so the slot lies inside the
        // mapped segment.
        Ok(unsafe { base.add(addr.offset() as usize) }.cast())
    }

    /// The regions currently mapped (test support).
    pub fn regions(&self) -> &[RegionPtr] {
        &self.regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn storage_with(min_regions: u64) -> (tempfile::TempDir, Storage) {
        let dir = tempdir().unwrap();
        let file = Arc::new(FileHandle::create_new(dir.path().join("t.db")).unwrap());
        // One-segment regions make every segment boundary a region boundary.
        let factory = RegionFactory::new(SEGMENT_SIZE, SEGMENT_SIZE).unwrap();
        let mut storage = Storage::new(file, factory, true);
        storage.map_bytes(0, min_regions * SEGMENT_SIZE).unwrap();
        (dir, storage)
    }

    #[test]
    fn sat_entries_match_mapped_range() {
        let (_dir, storage) = storage_with(3);
        assert_eq!(storage.physical_size(), 3 * SEGMENT_SIZE);
        for seg in 0..3 {
            assert!(storage.segment_base(seg).is_ok());
        }
        assert!(storage.segment_base(3).is_err());
    }

    #[test]
    fn shrink_clears_tail_entries_only() {
        let (_dir, mut storage) = storage_with(3);
        storage.map_bytes(3 * SEGMENT_SIZE, SEGMENT_SIZE + 10).unwrap();
        // Regions at offsets 2*SEG and SEG+... : only regions entirely at or
        // beyond the new size are dropped.
        assert_eq!(storage.physical_size(), 2 * SEGMENT_SIZE);
        assert!(storage.segment_base(0).is_ok());
        assert!(storage.segment_base(1).is_ok());
        assert!(storage.segment_base(2).is_err());
    }

    #[test]
    fn spanning_detection_uses_region_identity() {
        let (_dir, storage) = storage_with(2);
        let boundary = SEGMENT_SIZE;
        assert!(!storage.request_spans_regions(Address::new(boundary - 8), 8));
        assert!(storage.request_spans_regions(Address::new(boundary - 8), 9));
        assert!(!storage.request_spans_regions(Address::new(boundary), 8));
        assert!(!storage.request_spans_regions(Address::NULL, 0));
    }

    #[test]
    fn spanning_copy_chunks_once_per_region() {
        let (_dir, storage) = storage_with(4);
        // [SEG-100, 2*SEG+100) straddles k = 2 region boundaries and must
        // copy in exactly k + 1 chunks.
        let addr = Address::new(SEGMENT_SIZE - 100);
        let size = SEGMENT_SIZE as usize + 200;
        let mut chunks = Vec::new();
        storage
            .for_each_chunk(addr, size, |_, off, len| chunks.push((off, len)))
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (0, 100));
        assert_eq!(chunks[1], (100, SEGMENT_SIZE as usize));
        assert_eq!(chunks[2], (100 + SEGMENT_SIZE as usize, 100));
    }

    #[test]
    fn spanning_write_and_read_round_trip() {
        let (_dir, storage) = storage_with(2);
        let addr = Address::new(SEGMENT_SIZE - 3);
        let data = *b"spanning-payload";

        storage.write_from(addr, &data).unwrap();
        let mut back = [0u8; 16];
        storage.read_into(addr, &mut back).unwrap();
        assert_eq!(back, data);

        match storage.bytes_at(addr, data.len()).unwrap() {
            Bytes::Owned(buf) => assert_eq!(&buf[..], &data[..]),
            Bytes::Mapped(_) => panic!("a spanning request must copy"),
        }
    }

    #[test]
    fn always_spanning_forces_owned_buffers() {
        let (_dir, mut storage) = storage_with(1);
        storage.write_from(Address::new(64), b"abc").unwrap();
        storage.set_always_spanning(true);
        assert!(storage.request_spans_regions(Address::new(64), 3));
        match storage.bytes_at(Address::new(64), 3).unwrap() {
            Bytes::Owned(buf) => assert_eq!(&buf[..], b"abc"),
            Bytes::Mapped(_) => panic!("always-spanning must copy"),
        }
    }

    #[test]
    fn shared_view_keeps_dropped_region_alive() {
        let (_dir, mut storage) = storage_with(2);
        storage
            .write_from(Address::new(SEGMENT_SIZE + 8), b"sticky")
            .unwrap();
        let view = storage.shared_at(Address::new(SEGMENT_SIZE + 8), 6).unwrap();
        storage.map_bytes(2 * SEGMENT_SIZE, 16).unwrap();
        assert!(storage.segment_base(1).is_err());
        assert_eq!(&*view, b"sticky");
    }

    #[test]
    fn atomic_slot_round_trips() {
        let (_dir, storage) = storage_with(1);
        storage.atomic_store_u64(Address::new(16), 0xFEED).unwrap();
        assert_eq!(storage.atomic_load_u64(Address::new(16)).unwrap(), 0xFEED);
        assert!(storage.atomic_store_u64(Address::new(17), 1).is_err());
    }

    #[test]
    fn cross_boundary_bytes_stay_linearly_addressable() {
        // A full-to-min transition: one 2-segment region then a 1-segment
        // region; bytes around both boundaries read back in order.
        let dir = tempdir().unwrap();
        let file = Arc::new(FileHandle::create_new(dir.path().join("t.db")).unwrap());
        let factory = RegionFactory::new(2 * SEGMENT_SIZE, SEGMENT_SIZE).unwrap();
        let mut storage = Storage::new(file, factory, true);
        storage.map_bytes(0, 3 * SEGMENT_SIZE).unwrap();
        assert_eq!(storage.regions().len(), 2);

        let addr = Address::new(2 * SEGMENT_SIZE - 4);
        storage.write_from(addr, b"linearly").unwrap();
        let mut buf = [0u8; 8];
        storage.read_into(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"linearly");
    }
}
