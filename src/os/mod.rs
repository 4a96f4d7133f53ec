//! # OS Abstractions
//!
//! Thin, explicit wrappers around the platform file APIs the store needs:
//!
//! - [`file`]: positioned file I/O, open dispositions, atomic non-replacing
//!   rename, and temporary-file creation honoring the conventional
//!   environment variables.
//! - [`lock`]: advisory fcntl byte-range locks with a scoped guard.
//!
//! Everything above this module speaks in terms of [`file::FileHandle`] and
//! [`lock::RangeLock`]; no other module touches `std::fs` or `libc`
//! file primitives directly.

pub mod file;
pub mod lock;

pub use file::{Access, CreateDisposition, FileHandle, Presence};
pub use lock::{LockKind, RangeLock};
