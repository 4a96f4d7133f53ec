//! # Database Layer
//!
//! The revision machinery on top of the storage layer:
//!
//! - [`layout`]: the fixed on-disk records — file header, trailer, and
//!   per-index header block — with their signatures and checksums.
//! - [`database`]: the [`Database`] handle; open/create, bounds-checked
//!   reads, revision traversal.
//! - [`transaction`]: the single-writer append scope ending in the atomic
//!   footer-pointer commit.
//!
//! ## Revision Model
//!
//! Every commit appends an immutable trailer and publishes it with one
//! atomic 8-byte store into the header's footer slot. Trailers link
//! backwards to the creation trailer, so the whole history of the store
//! remains addressable: a reader can pin its view to any revision and see
//! exactly the indexes and records that revision committed.

pub mod database;
pub mod layout;
pub mod transaction;

pub use database::{AccessMode, Database, Revisions};
pub use layout::{FileHeader, HeaderBlock, Trailer};
pub use transaction::Transaction;
