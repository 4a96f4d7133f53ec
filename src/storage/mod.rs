//! # Storage Layer
//!
//! Memory-mapped access to the store file, built from three pieces:
//!
//! - [`region`]: one mmap of a segment-aligned file range, shared by
//!   reference counting, with page-protection support.
//! - [`factory`]: the growth policy that carves the file into regions
//!   (full-size mappings preferred, min-size granularity at the tail).
//! - [`sat`]: the segment address table translating 64-bit store addresses
//!   to raw memory, plus spanning (cross-region) reads and writes.
//!
//! ## Address Space Model
//!
//! The file is addressed in fixed 4 MiB segments. Each mapped segment has a
//! SAT entry carrying its base pointer and owning region; translation is a
//! table lookup plus an add. Requests that cross a region boundary cannot
//! be served as one slice — regions are contiguous in the file, not in
//! memory — and are chunked region by region instead.
//!
//! ## Safety Model
//!
//! Growing never moves an existing mapping, and committed bytes are never
//! rewritten, so a reader's view ([`sat::SharedBytes`]) stays valid for as
//! long as it holds its region handle. Mutable access flows exclusively
//! through the transaction layer, which holds `&mut` on the database for
//! its whole lifetime; the cross-process writer lock does the rest.

pub mod factory;
pub mod region;
pub mod sat;

pub use factory::{RegionFactory, FULL_REGION_SIZE, MIN_REGION_SIZE};
pub use region::{page_size, Region, RegionPtr};
pub use sat::{Bytes, SharedBytes, Storage};
