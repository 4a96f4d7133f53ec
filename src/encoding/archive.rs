//! # Archive Policies
//!
//! The store serialises values through a pair of small policies rather
//! than a monolithic serialisation framework:
//!
//! - a *writer policy* ([`WritePolicy`]): `put` / `put_bytes`, whose output
//!   type distinguishes plain streams (`()`) from the database writer,
//!   where every put allocates through the open transaction and yields the
//!   store [`Address`] of the bytes;
//! - a *reader policy* ([`DbReader`]): a cursor over the database that
//!   decodes fixed-layout values and raw byte runs.
//!
//! The index layer uses [`VecWriter`] to build node images in memory and
//! [`DbWriter`] to land them in the file with their exact packed size; the
//! string layer adds the length-prefixed helpers [`write_string`] /
//! [`read_string`], whose prefix is always at least two bytes so a reader
//! can make one two-byte fetch and know the total length.

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::address::Address;
use crate::database::database::Database;
use crate::database::transaction::Transaction;
use crate::encoding::varint;
use crate::error::StoreError;

/// Destination-agnostic serialisation sink.
pub trait WritePolicy {
    /// `()` for plain streams; the store [`Address`] for the database
    /// writer.
    type Output;

    /// Writes one contiguous run of bytes, padded to `align` first.
    fn put_bytes(&mut self, data: &[u8], align: u64) -> Result<Self::Output>;

    /// Writes one fixed-layout value.
    fn put<T: IntoBytes + Immutable>(&mut self, value: &T, align: u64) -> Result<Self::Output> {
        self.put_bytes(value.as_bytes(), align)
    }

    /// Total bytes produced so far.
    fn bytes_produced(&self) -> u64;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writer policy that appends to a growable in-memory buffer.
#[derive(Debug, Default)]
pub struct VecWriter {
    buf: Vec<u8>,
}

impl VecWriter {
    pub fn new() -> VecWriter {
        VecWriter::default()
    }

    pub fn with_capacity(capacity: usize) -> VecWriter {
        VecWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl WritePolicy for VecWriter {
    type Output = ();

    fn put_bytes(&mut self, data: &[u8], align: u64) -> Result<()> {
        let padded = (self.buf.len() as u64).next_multiple_of(align) as usize;
        self.buf.resize(padded, 0);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn bytes_produced(&self) -> u64 {
        self.buf.len() as u64
    }
}

/// Writer policy that allocates through an open transaction.
///
/// Every `put` is one allocation; the returned address is where the bytes
/// landed in the store.
pub struct DbWriter<'a, 'db> {
    txn: &'a mut Transaction<'db>,
    produced: u64,
}

impl<'a, 'db> DbWriter<'a, 'db> {
    pub fn new(txn: &'a mut Transaction<'db>) -> DbWriter<'a, 'db> {
        DbWriter { txn, produced: 0 }
    }

    pub fn txn(&mut self) -> &mut Transaction<'db> {
        self.txn
    }
}

impl WritePolicy for DbWriter<'_, '_> {
    type Output = Address;

    fn put_bytes(&mut self, data: &[u8], align: u64) -> Result<Address> {
        let addr = self.txn.put_bytes(data, align)?;
        self.produced += data.len() as u64;
        Ok(addr)
    }

    fn bytes_produced(&self) -> u64 {
        self.produced
    }
}

/// Reader policy: a cursor over the database.
pub struct DbReader<'db> {
    db: &'db Database,
    pos: Address,
}

impl<'db> DbReader<'db> {
    pub fn new(db: &'db Database, pos: Address) -> DbReader<'db> {
        DbReader { db, pos }
    }

    pub fn position(&self) -> Address {
        self.pos
    }

    /// Reads `out.len()` bytes at the cursor and advances it.
    pub fn get_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let bytes = self.db.read_bytes(self.pos, out.len())?;
        out.copy_from_slice(&bytes);
        self.pos = self.pos.add(out.len() as u64);
        Ok(())
    }

    /// Reads one fixed-layout value at the cursor and advances it.
    pub fn get<T: FromBytes>(&mut self) -> Result<T> {
        let bytes = self.db.read_bytes(self.pos, std::mem::size_of::<T>())?;
        let value = T::read_from_bytes(&bytes)
            .map_err(|e| eyre::eyre!("failed to decode value: {:?}", e))?;
        self.pos = self.pos.add(std::mem::size_of::<T>() as u64);
        Ok(value)
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: u64) {
        self.pos = self.pos.add(n);
    }
}

/// Writes a length-prefixed string body: varint length (at least two
/// bytes), then the raw bytes, the whole record aligned to two bytes.
///
/// Returns the address of the length prefix.
pub fn write_string(txn: &mut Transaction<'_>, s: &[u8]) -> Result<Address> {
    let mut prefix = [0u8; varint::MAX_ENCODED_LEN];
    let prefix_len = varint::encode_min(s.len() as u64, varint::MIN_STRING_PREFIX, &mut prefix);

    let addr = txn.alloc(prefix_len as u64 + s.len() as u64, 2)?;
    txn.write(addr, &prefix[..prefix_len])?;
    txn.write(addr.add(prefix_len as u64), s)?;
    Ok(addr)
}

/// Reads back a string body written by [`write_string`].
pub fn read_string(db: &Database, addr: Address) -> Result<Vec<u8>> {
    let (len, prefix_len) = read_string_length(db, addr)?;
    let bytes = db.read_bytes(addr.add(prefix_len as u64), len as usize)?;
    Ok(bytes.to_vec())
}

/// Reads the length prefix of a string body, returning
/// `(string length, prefix length)`.
pub fn read_string_length(db: &Database, addr: Address) -> Result<(u64, usize)> {
    if addr.absolute() % 2 != 0 {
        return Err(StoreError::bad_address(
            addr.absolute(),
            "string body is not 2-byte aligned",
        )
        .into());
    }
    // The prefix is always at least two bytes, so one two-byte fetch tells
    // us whether more are needed.
    let head = db.read_bytes(addr, varint::MIN_STRING_PREFIX)?;
    let prefix_len = varint::decode_size(head[0]);
    if prefix_len <= varint::MIN_STRING_PREFIX {
        let (len, _) = varint::decode(&head)?;
        Ok((len, prefix_len.max(varint::MIN_STRING_PREFIX)))
    } else {
        let full = db.read_bytes(addr, prefix_len)?;
        let (len, _) = varint::decode(&full)?;
        Ok((len, prefix_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::database::Database;
    use tempfile::tempdir;

    #[test]
    fn vec_writer_pads_to_alignment() {
        let mut w = VecWriter::new();
        w.put_bytes(b"abc", 1).unwrap();
        w.put_bytes(b"defg", 8).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..3], b"abc");
        assert_eq!(&bytes[3..8], &[0; 5]);
        assert_eq!(&bytes[8..12], b"defg");
    }

    #[test]
    fn db_writer_returns_store_addresses() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("t.db")).unwrap();
        let mut txn = db.begin().unwrap();

        let mut w = DbWriter::new(&mut txn);
        let a = w.put_bytes(b"first", 1).unwrap();
        let b = w.put_bytes(b"second", 1).unwrap();
        assert!(b.absolute() > a.absolute());
        assert_eq!(w.bytes_produced(), 11);

        assert_eq!(&*txn.db().read_bytes(a, 5).unwrap(), b"first");
        assert_eq!(&*txn.db().read_bytes(b, 6).unwrap(), b"second");
    }

    #[test]
    fn db_reader_walks_sequentially() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("t.db")).unwrap();
        let addr = {
            let mut txn = db.begin().unwrap();
            let addr = txn.put_bytes(&42u64.to_le_bytes(), 8).unwrap();
            txn.put_bytes(b"tail", 1).unwrap();
            txn.commit().unwrap();
            addr
        };

        let mut r = DbReader::new(&db, addr);
        let v: zerocopy::little_endian::U64 = r.get().unwrap();
        assert_eq!(v.get(), 42);
        let mut tail = [0u8; 4];
        r.get_bytes(&mut tail).unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[test]
    fn string_round_trip_with_two_byte_minimum_prefix() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("t.db")).unwrap();
        let (short, long) = {
            let mut txn = db.begin().unwrap();
            let short = write_string(&mut txn, b"hi").unwrap();
            let long = write_string(&mut txn, &vec![b'x'; 300]).unwrap();
            txn.commit().unwrap();
            (short, long)
        };

        assert_eq!(short.absolute() % 2, 0);
        assert_eq!(read_string(&db, short).unwrap(), b"hi");

        let (len, prefix_len) = read_string_length(&db, short).unwrap();
        assert_eq!((len, prefix_len), (2, 2));

        assert_eq!(read_string(&db, long).unwrap(), vec![b'x'; 300]);
    }

    #[test]
    fn odd_string_address_is_a_bad_address() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("t.db")).unwrap();
        let err = read_string_length(&db, Address::new(129)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::BadAddress { .. })
        ));
    }
}
