//! # Memory-Mapped Regions
//!
//! A [`Region`] owns one memory mapping of a contiguous file range whose
//! offset and length are whole multiples of the segment size. The store
//! never maps the whole file with a single call: the mapping set grows as
//! the file grows, and existing mappings are never moved, so pointers into
//! a region stay valid for the region's lifetime.
//!
//! ## Lifetime Model
//!
//! Regions are shared by reference counting (`Arc<Region>`). Shrinking the
//! storage drops the tail regions from the region list, but any outstanding
//! read view holds its own `Arc` and keeps the mapping alive until the last
//! view dies. This is the same discipline the underlying format relies on
//! for lock-free readers.
//!
//! ## Page Protection
//!
//! [`Region::read_only`] flips a byte range of the mapping to read-only as
//! a guard against stray writes into committed data. The range is rounded
//! outward to page boundaries because `mprotect` operates on whole pages;
//! callers are responsible for passing a range that may legally be widened
//! that way (the storage layer keeps the header page out of every protect
//! request).

use std::sync::Arc;
use std::sync::OnceLock;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};

use crate::address::SEGMENT_SIZE;
use crate::os::file::FileHandle;

/// The system page size, queried once.
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf(_SC_PAGESIZE) reads a static configuration value
        // and has no failure mode that matters here; a nonsensical result
        // is caught by the power-of-two check below.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = if size <= 0 { 4096 } else { size as u64 };
        assert!(size.is_power_of_two());
        size
    })
}

/// One memory mapping of a contiguous file range.
#[derive(Debug)]
pub struct Region {
    map: MmapRaw,
    offset: u64,
    len: u64,
}

impl Region {
    /// Maps `[offset, offset + len)` of `file`.
    ///
    /// Both `offset` and `len` must be whole multiples of the segment size.
    /// Writable mappings require the file to have been extended to cover
    /// the range first, so that every mapped page is backed.
    pub fn map(file: &FileHandle, offset: u64, len: u64, writable: bool) -> Result<Region> {
        ensure!(
            offset % SEGMENT_SIZE == 0 && len % SEGMENT_SIZE == 0 && len > 0,
            "region [{offset}, {}) is not segment-aligned",
            offset + len
        );

        let mut options = MmapOptions::new();
        options.offset(offset).len(len as usize);

        // SAFETY: mapping a file is unsafe because the underlying file can
        // change beneath the mapping. This is sound here because:
        // 1. Committed bytes of a store file are immutable by format
        //    contract; the only writer is the single lock-holding
        //    transaction in this process.
        // 2. Writable mappings are created only after the file has been
        //    extended past `offset + len`, so every page is backed.
        // 3. Read-only mappings may extend past EOF, but the storage layer
        //    bounds every dereference to the committed file size.
        let map = unsafe {
            if writable {
                options.map_raw(file.file())
            } else {
                options.map_raw_read_only(file.file())
            }
        }
        .wrap_err_with(|| {
            format!(
                "failed to map [{offset}, {}) of '{}'",
                offset + len,
                file.path().display()
            )
        })?;

        Ok(Region { map, offset, len })
    }

    /// File offset of the first mapped byte.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.len
    }

    /// File offset one past the last mapped byte.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// True if `file_offset` falls inside this region.
    #[inline]
    pub fn contains(&self, file_offset: u64) -> bool {
        file_offset >= self.offset && file_offset < self.end()
    }

    /// Flushes `[file_offset, file_offset + len)` of this mapping to disk.
    pub fn flush_range(&self, file_offset: u64, len: u64) -> Result<()> {
        debug_assert!(file_offset >= self.offset && file_offset + len <= self.end());
        let rel = (file_offset - self.offset) as usize;
        self.map
            .flush_range(rel, len as usize)
            .wrap_err("failed to flush mapped range")
    }

    /// Marks `[file_offset, file_offset + len)` read-only, rounded outward
    /// to whole pages.
    pub fn read_only(&self, file_offset: u64, len: u64) -> Result<()> {
        self.protect_range(file_offset, len, libc::PROT_READ)
    }

    /// Restores write access to `[file_offset, file_offset + len)`, rounded
    /// outward to whole pages. Used when an abandoned transaction rolls
    /// back a range it had already sealed.
    pub fn read_write(&self, file_offset: u64, len: u64) -> Result<()> {
        self.protect_range(file_offset, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    fn protect_range(&self, file_offset: u64, len: u64, prot: libc::c_int) -> Result<()> {
        debug_assert!(file_offset >= self.offset && file_offset + len <= self.end());
        if len == 0 {
            return Ok(());
        }

        let page = page_size();
        let first = (file_offset - self.offset) & !(page - 1);
        let last = ((file_offset - self.offset + len + page - 1) & !(page - 1)).min(self.len);

        // SAFETY: the computed range lies within this mapping (asserted
        // above and clamped to its length) and is page-aligned as mprotect
        // requires. Changing protection never invalidates the mapping.
        let rc = unsafe {
            libc::mprotect(
                self.base().add(first as usize).cast(),
                (last - first) as usize,
                prot,
            )
        };
        ensure!(
            rc == 0,
            "mprotect failed for region [{}, {}): {}",
            self.offset,
            self.end(),
            std::io::Error::last_os_error()
        );
        Ok(())
    }
}

// SAFETY: the raw mapping pointer is owned by this Region and the pages it
// names stay valid until Drop unmaps them; cross-thread access is governed
// by the storage layer's &/&mut discipline and the format's immutability of
// committed bytes.
unsafe impl Send for Region {}
// SAFETY: as above; `base()` hands out pointers whose aliasing rules are
// enforced by the callers, not by &Region itself.
unsafe impl Sync for Region {}

/// Shared handle to a region.
pub type RegionPtr = Arc<Region>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mapping_requires_segment_alignment() {
        let dir = tempdir().unwrap();
        let file = FileHandle::create_new(dir.path().join("t.db")).unwrap();
        file.truncate(SEGMENT_SIZE).unwrap();

        assert!(Region::map(&file, 0, SEGMENT_SIZE, true).is_ok());
        assert!(Region::map(&file, 4096, SEGMENT_SIZE, true).is_err());
        assert!(Region::map(&file, 0, 4096, true).is_err());
    }

    #[test]
    fn mapped_bytes_are_readable_and_writable() {
        let dir = tempdir().unwrap();
        let file = FileHandle::create_new(dir.path().join("t.db")).unwrap();
        file.truncate(SEGMENT_SIZE).unwrap();

        let region = Region::map(&file, 0, SEGMENT_SIZE, true).unwrap();
        // SAFETY: the region maps at least 16 backed bytes and no other
        // reference to them exists in this test.
        unsafe {
            region.base().write_bytes(0xAB, 16);
            assert_eq!(*region.base().add(15), 0xAB);
        }
        region.flush_range(0, 16).unwrap();

        let mut buf = [0u8; 16];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 16]);
    }

    #[test]
    fn region_geometry_accessors() {
        let dir = tempdir().unwrap();
        let file = FileHandle::create_new(dir.path().join("t.db")).unwrap();
        file.truncate(3 * SEGMENT_SIZE).unwrap();

        let region = Region::map(&file, SEGMENT_SIZE, 2 * SEGMENT_SIZE, true).unwrap();
        assert_eq!(region.offset(), SEGMENT_SIZE);
        assert_eq!(region.size(), 2 * SEGMENT_SIZE);
        assert_eq!(region.end(), 3 * SEGMENT_SIZE);
        assert!(region.contains(SEGMENT_SIZE));
        assert!(region.contains(3 * SEGMENT_SIZE - 1));
        assert!(!region.contains(3 * SEGMENT_SIZE));
        assert!(!region.contains(0));
    }
}
