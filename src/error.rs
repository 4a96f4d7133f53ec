//! # Typed Error Kinds
//!
//! All fallible operations in this crate return `eyre::Result` with rich
//! context attached at each layer (operation name, path, offending address).
//! Failures that callers need to react to programmatically carry a
//! [`StoreError`] at the root of the report chain, so tests and embedders can
//! match on the kind with `report.downcast_ref::<StoreError>()`.
//!
//! ## Kinds
//!
//! - [`StoreError::Io`]: any underlying OS error, wrapping the OS error code.
//! - [`StoreError::BadAddress`]: an in-store pointer is misaligned, lies
//!   outside the file, or is inconsistent with its tag bits.
//! - [`StoreError::Corrupt`]: a persisted record's signature, checksum, or
//!   embedded size disagrees with its extent.
//! - [`StoreError::LockUnavailable`]: a non-blocking writer-lock acquisition
//!   failed because another process holds the lock.
//! - [`StoreError::Exists`]: the target of a non-replacing rename exists.
//!
//! Errors raised while a transaction is open cause the transaction's Drop
//! implementation to abandon and roll back, so partial writes are never
//! published.

use std::path::PathBuf;

use thiserror::Error;

/// Error kinds surfaced by the store core.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An underlying OS error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An in-store pointer is misaligned, out of bounds, or carries
    /// inconsistent tag bits.
    #[error("bad address {address:#x}: {reason}")]
    BadAddress {
        address: u64,
        reason: &'static str,
    },

    /// A persisted record failed a signature, checksum, or bounds check.
    #[error("corrupt {what} at {address:#x}: {detail}")]
    Corrupt {
        what: &'static str,
        address: u64,
        detail: String,
    },

    /// Non-blocking writer-lock acquisition failed; another writer holds it.
    #[error("writer lock unavailable: another process holds the write lock")]
    LockUnavailable,

    /// The destination of an atomic non-replacing rename already exists.
    #[error("destination '{}' already exists", path.display())]
    Exists { path: PathBuf },
}

impl StoreError {
    pub fn bad_address(address: u64, reason: &'static str) -> Self {
        StoreError::BadAddress { address, reason }
    }

    pub fn corrupt(what: &'static str, address: u64, detail: impl Into<String>) -> Self {
        StoreError::Corrupt {
            what,
            address,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_address_formats_hex() {
        let err = StoreError::bad_address(0xdead, "payload tagged as heap pointer");
        assert_eq!(
            err.to_string(),
            "bad address 0xdead: payload tagged as heap pointer"
        );
    }

    #[test]
    fn kind_survives_eyre_downcast() {
        let report = eyre::Report::new(StoreError::LockUnavailable);
        assert!(matches!(
            report.downcast_ref::<StoreError>(),
            Some(StoreError::LockUnavailable)
        ));
    }
}
