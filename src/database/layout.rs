//! # On-Disk Record Layouts
//!
//! Type-safe, zerocopy-based structs for every fixed-layout record in the
//! store file. All multi-byte fields are little-endian via the zerocopy
//! wrapper types, which fixes the format's canonical byte order; the header
//! stamps format version 1.
//!
//! ## File Layout
//!
//! ```text
//! Offset 0        FileHeader (128 bytes; footer slot at offset 16)
//! Offset 128      initial Trailer (revision 0)
//! ...             append-only body: records, index nodes, trailers
//! ```
//!
//! Every byte below the address stored in the footer slot is immutable.
//! The footer slot is the *only* mutable location in the file after
//! creation: each commit appends a new [`Trailer`] and then publishes it
//! with a single atomic 8-byte store into the slot. Trailers link to their
//! predecessor, forming the revision chain, and carry the root table of
//! every named index.
//!
//! ## Integrity
//!
//! The header is validated by magic and version. Each trailer carries a
//! CRC-32 over its payload fields and a trailing signature; both are
//! checked whenever a trailer is read. Index nodes carry their own
//! signatures (see `index::node`).
//!
//! ## Zerocopy Safety
//!
//! All structs derive `FromBytes`/`IntoBytes`/`Immutable`/`KnownLayout`/
//! `Unaligned`, so they can be read in place from unaligned mapped memory
//! and written as plain byte slices. Sizes are compile-time asserted.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::address::{Address, TypedAddress};
use crate::error::StoreError;
use crate::index::INDEX_ROOT_SLOTS;

/// Magic bytes at offset 0 of every store file.
pub const FILE_MAGIC: &[u8; 8] = b"StrataDB";

/// Signature terminating every trailer.
pub const TRAILER_SIGNATURE: &[u8; 8] = b"StrataTr";

/// Signature of a per-index header block.
pub const HEADER_BLOCK_SIGNATURE: &[u8; 8] = b"StrataIx";

/// Current format version.
pub const CURRENT_VERSION: u32 = 1;

/// Size of the file header in bytes.
pub const FILE_HEADER_SIZE: usize = 128;

/// File offset of the atomic footer-pointer slot within the header.
pub const FOOTER_SLOT_OFFSET: u64 = 16;

/// File offset of the writer-lock byte within the header's reserved area.
pub const WRITER_LOCK_OFFSET: u64 = 48;

/// Size of a trailer record in bytes.
pub const TRAILER_SIZE: usize = 84;

/// Size of a per-index header block in bytes.
pub const HEADER_BLOCK_SIZE: usize = 24;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The 128-byte file header.
///
/// Written once at creation; only the footer slot ever changes afterwards,
/// and that through [`crate::storage::Storage::atomic_store_u64`], never
/// through this struct.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 8],
    version: U32,
    flags: U32,
    /// Address of the newest committed trailer (the atomic slot).
    footer: U64,
    /// Creation time, milliseconds since the Unix epoch.
    created_ms: U64,
    /// Random identity assigned at creation.
    uuid: [u8; 16],
    reserved: [u8; 80],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);
const _: () = assert!(std::mem::offset_of!(FileHeader, footer) == FOOTER_SLOT_OFFSET as usize);
const _: () = assert!(FOOTER_SLOT_OFFSET % 8 == 0);
const _: () = assert!(WRITER_LOCK_OFFSET as usize >= std::mem::offset_of!(FileHeader, reserved));

impl FileHeader {
    pub fn new(created_ms: u64, uuid: [u8; 16], initial_footer: Address) -> Self {
        FileHeader {
            magic: *FILE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            flags: U32::new(0),
            footer: U64::new(initial_footer.absolute()),
            created_ms: U64::new(created_ms),
            uuid,
            reserved: [0u8; 80],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        ensure!(
            &header.magic == FILE_MAGIC,
            StoreError::corrupt("file header", 0, "bad magic bytes")
        );
        ensure!(
            header.version.get() == CURRENT_VERSION,
            StoreError::corrupt(
                "file header",
                0,
                format!(
                    "unsupported version {} (expected {})",
                    header.version.get(),
                    CURRENT_VERSION
                )
            )
        );
        Ok(header)
    }

    zerocopy_getters! {
        version: u32,
        flags: u32,
        created_ms: u64,
    }

    pub fn footer(&self) -> TypedAddress<Trailer> {
        TypedAddress::new(Address::new(self.footer.get()))
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }
}

/// One committed revision's trailer.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Trailer {
    /// Address of the previous trailer; terminates at the creation trailer,
    /// whose `prev` is null.
    prev: U64,
    /// Revision number; 0 for the creation trailer, then contiguous.
    revision: U64,
    /// Commit time, milliseconds since the Unix epoch.
    timestamp_ms: U64,
    /// Bytes appended by this transaction, trailer excluded.
    size: U64,
    /// Header-block address for each named index; 0 = index absent.
    index_roots: [U64; INDEX_ROOT_SLOTS],
    /// CRC-32 of every preceding field.
    crc: U32,
    signature: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<Trailer>() == TRAILER_SIZE);
const CRC_COVERED: usize = std::mem::offset_of!(Trailer, crc);

impl Trailer {
    pub fn new(
        prev: TypedAddress<Trailer>,
        revision: u64,
        timestamp_ms: u64,
        size: u64,
        index_roots: [u64; INDEX_ROOT_SLOTS],
    ) -> Self {
        let mut trailer = Trailer {
            prev: U64::new(prev.absolute()),
            revision: U64::new(revision),
            timestamp_ms: U64::new(timestamp_ms),
            size: U64::new(size),
            index_roots: index_roots.map(U64::new),
            crc: U32::new(0),
            signature: *TRAILER_SIGNATURE,
        };
        trailer.crc = U32::new(CRC32.checksum(&trailer.as_bytes()[..CRC_COVERED]));
        trailer
    }

    /// Parses and integrity-checks a trailer read from `address`.
    pub fn from_bytes(bytes: &[u8], address: Address) -> Result<Trailer> {
        ensure!(
            bytes.len() >= TRAILER_SIZE,
            StoreError::corrupt(
                "trailer",
                address.absolute(),
                format!("short read: {} < {}", bytes.len(), TRAILER_SIZE)
            )
        );
        let trailer = Trailer::read_from_bytes(&bytes[..TRAILER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse Trailer: {:?}", e))?;

        ensure!(
            &trailer.signature == TRAILER_SIGNATURE,
            StoreError::corrupt("trailer", address.absolute(), "bad signature")
        );
        let expected = CRC32.checksum(&trailer.as_bytes()[..CRC_COVERED]);
        ensure!(
            trailer.crc.get() == expected,
            StoreError::corrupt(
                "trailer",
                address.absolute(),
                format!("crc mismatch: stored {:#x}, computed {:#x}", trailer.crc.get(), expected)
            )
        );
        Ok(trailer)
    }

    zerocopy_getters! {
        revision: u64,
        timestamp_ms: u64,
        size: u64,
        crc: u32,
    }

    pub fn prev(&self) -> TypedAddress<Trailer> {
        TypedAddress::new(Address::new(self.prev.get()))
    }

    pub fn index_root(&self, slot: usize) -> Address {
        Address::new(self.index_roots[slot].get())
    }

    pub fn index_roots(&self) -> [u64; INDEX_ROOT_SLOTS] {
        self.index_roots.map(|r| r.get())
    }
}

/// The 24-byte per-index header block referenced from each trailer.
///
/// `root` is a tagged word in the child-pointer encoding of `index::node`:
/// null for an empty trie, a leaf address, or an internal-node address with
/// the low tag bit set.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeaderBlock {
    signature: [u8; 8],
    /// Number of keys stored in the tree.
    size: U64,
    /// Tagged root word of the tree.
    root: U64,
}

const _: () = assert!(std::mem::size_of::<HeaderBlock>() == HEADER_BLOCK_SIZE);

impl HeaderBlock {
    pub fn new(size: u64, root: u64) -> Self {
        HeaderBlock {
            signature: *HEADER_BLOCK_SIGNATURE,
            size: U64::new(size),
            root: U64::new(root),
        }
    }

    pub fn from_bytes(bytes: &[u8], address: Address) -> Result<HeaderBlock> {
        ensure!(
            bytes.len() >= HEADER_BLOCK_SIZE,
            StoreError::corrupt(
                "index header block",
                address.absolute(),
                format!("short read: {} < {}", bytes.len(), HEADER_BLOCK_SIZE)
            )
        );
        let block = HeaderBlock::read_from_bytes(&bytes[..HEADER_BLOCK_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse HeaderBlock: {:?}", e))?;
        ensure!(
            &block.signature == HEADER_BLOCK_SIGNATURE,
            StoreError::corrupt("index header block", address.absolute(), "bad signature")
        );
        Ok(block)
    }

    zerocopy_accessors! {
        size: u64,
        root: u64,
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
