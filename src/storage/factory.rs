//! # Region Factory
//!
//! Decides how the file is carved into memory-mapped regions as it grows.
//! Two sizes govern the policy:
//!
//! - `full_region_size` (default 4 GiB): the preferred mapping size. Large
//!   regions keep the segment address table stable and make spanning
//!   requests rare.
//! - `min_region_size` (default 4 MiB, one segment): the growth granularity
//!   for the tail of the file, so small stores do not reserve gigabytes of
//!   address space.
//!
//! [`RegionFactory::add`] extends a region list so that the concatenation
//! of all regions covers `[0, new_size)`: whole full-size regions are
//! appended while the remaining gap permits, then a single region of the
//! smallest min-size multiple that covers the rest. All offsets and sizes
//! are whole multiples of the segment size by construction.
//!
//! For a writable store the file itself is extended (`set_len`) before each
//! mapping is created, so every writable page is backed; sparse growth
//! costs no disk until pages are touched. Tests shrink both sizes to
//! exercise multi-region layouts without multi-gigabyte files.

use eyre::{ensure, Result};
use tracing::debug;

use crate::address::SEGMENT_SIZE;
use crate::os::file::FileHandle;
use crate::storage::region::{Region, RegionPtr};

/// Default preferred mapping size: 4 GiB.
pub const FULL_REGION_SIZE: u64 = 1 << 32;

/// Default growth granularity: 4 MiB (one segment).
pub const MIN_REGION_SIZE: u64 = SEGMENT_SIZE;

/// Region growth policy.
#[derive(Debug, Clone, Copy)]
pub struct RegionFactory {
    full_region_size: u64,
    min_region_size: u64,
}

impl Default for RegionFactory {
    fn default() -> Self {
        RegionFactory::new(FULL_REGION_SIZE, MIN_REGION_SIZE)
            .expect("default region geometry is valid")
    }
}

impl RegionFactory {
    pub fn new(full_region_size: u64, min_region_size: u64) -> Result<RegionFactory> {
        ensure!(
            min_region_size >= SEGMENT_SIZE && min_region_size % SEGMENT_SIZE == 0,
            "min region size {} is not a multiple of the segment size",
            min_region_size
        );
        ensure!(
            full_region_size >= min_region_size && full_region_size % min_region_size == 0,
            "full region size {} is not a multiple of the min region size {}",
            full_region_size,
            min_region_size
        );
        Ok(RegionFactory {
            full_region_size,
            min_region_size,
        })
    }

    pub fn full_region_size(&self) -> u64 {
        self.full_region_size
    }

    pub fn min_region_size(&self) -> u64 {
        self.min_region_size
    }

    /// Appends regions to `regions` so their concatenation covers
    /// `[0, new_size)`.
    ///
    /// `old_size` is the current physical (mapped) end, which is always the
    /// end of the last region; regions are contiguous and ordered by
    /// offset.
    pub fn add(
        &self,
        file: &FileHandle,
        regions: &mut Vec<RegionPtr>,
        old_size: u64,
        new_size: u64,
        writable: bool,
    ) -> Result<()> {
        debug_assert_eq!(old_size, regions.last().map_or(0, |r| r.end()));

        let mut pos = old_size;
        while pos < new_size {
            let gap = new_size - pos;
            let len = if gap >= self.full_region_size {
                self.full_region_size
            } else {
                round_up(gap, self.min_region_size)
            };

            if writable && file.size()? < pos + len {
                file.truncate(pos + len)?;
            }

            debug!(offset = pos, len, "mapping new region");
            regions.push(RegionPtr::new(Region::map(file, pos, len, writable)?));
            pos += len;
        }
        Ok(())
    }
}

fn round_up(value: u64, boundary: u64) -> u64 {
    debug_assert!(boundary.is_power_of_two());
    (value + boundary - 1) & !(boundary - 1)
}
