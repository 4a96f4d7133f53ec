//! # StrataDB - Persistent Append-Only Object Store
//!
//! StrataDB is a single-file, memory-mapped, content-addressed key-value
//! store built to hold compiler-intermediate objects: code fragments,
//! compilation summaries, debug information, and interned strings. This
//! Rust implementation prioritises:
//!
//! - **Zero-copy reads**: records are served as slices of the mapped file
//! - **Lock-free readers**: snapshot isolation from a single atomic word
//! - **Append-only growth**: committed bytes are immutable, forever
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{Database, StringAdder};
//!
//! let mut db = Database::create("./objects.db")?;
//!
//! let mut txn = db.begin()?;
//! let mut names = txn.db().name_index()?;
//! let mut adder = StringAdder::new();
//! adder.add(&mut txn, &mut names, "main")?;
//! adder.flush(&mut txn)?;
//! let block = names.flush(&mut txn)?;
//! txn.set_root(stratadb::IndexKind::Names, block);
//! txn.commit()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Named Indexes (HAMT map/set, strings)  │
//! ├──────────────────────────────────────────┤
//! │   Revision Layer (trailers, commit)      │
//! ├──────────────────────────────────────────┤
//! │   Transaction (append, rollback, lock)   │
//! ├──────────────────────────────────────────┤
//! │   Storage (SAT, regions, spanning I/O)   │
//! ├──────────────────────────────────────────┤
//! │   OS (mmap, fcntl range locks, files)    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! One file, growing monotonically:
//!
//! ```text
//! ┌─────────────┬──────────────┬─────┬───────────┬─────┬───────────┐
//! │ header 128B │ trailer rev0 │ ... │ trailer 1 │ ... │ trailer N │
//! └─────────────┴──────────────┴─────┴───────────┴─────┴───────────┘
//!        │                                              ▲
//!        └── footer slot ──────────────────────────────-┘
//! ```
//!
//! Each commit appends records, index nodes, and a trailer, then
//! publishes the trailer's address with one atomic 8-byte store into the
//! header's footer slot. A reader observing that slot sees either the old
//! revision or the whole new one. Old revisions stay reachable through
//! each trailer's link to its predecessor.
//!
//! ## Concurrency Model
//!
//! At most one writer per store *across processes*, enforced by an
//! exclusive fcntl byte-range lock on the header's writer byte. Readers
//! are unbounded and take no locks: committed bytes never change, and the
//! footer slot only ever advances. In-process, a transaction holds
//! `&mut Database`, so the borrow checker rules out stale views at
//! compile time.
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped regions, segment address table, spanning I/O
//! - [`database`]: file header, trailers, transactions, revision walk
//! - [`index`]: HAMT map and set over the store, named index tags
//! - [`strings`]: two-phase string interning with uniqueness-by-address
//! - [`encoding`]: prefix varints and the archive writer/reader policies
//! - [`os`]: file handles and advisory byte-range locks

#[macro_use]
mod macros;

pub mod address;
pub mod database;
pub mod encoding;
pub mod error;
pub mod index;
pub mod os;
pub mod storage;
pub mod strings;

pub use address::{Address, TypedAddress, SEGMENT_SIZE};
pub use database::{AccessMode, Database, HeaderBlock, Trailer, Transaction};
pub use error::StoreError;
pub use index::{
    CompilationIndex, DebugLineHeaderIndex, Digest, Extent, FragmentIndex, HamtMap, HamtSet,
    IndexKind, NameIndex, PathIndex,
};
pub use storage::{Bytes, RegionFactory};
pub use strings::{find_string, read_string_at, IndirectString, StringAdder};
