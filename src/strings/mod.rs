//! # Indirect Strings
//!
//! Interned strings with uniqueness-by-address. One logical type,
//! [`IndirectString`], has three physical forms:
//!
//! ```text
//! (a) View      a process-local string view, not yet inserted
//! (b) heap slot an in-store u64 whose LSB is SET: the remaining bits are
//!               the address of a process-local view, installed in the
//!               trie but whose body is not yet written
//! (c) body slot an in-store u64 whose LSB is CLEAR: the address of the
//!               canonical length-prefixed body
//! ```
//!
//! ## Two-Phase Insertion
//!
//! Writing every string body at insertion time would interleave bodies
//! with trie leaves all over the transaction. Instead [`StringAdder`]
//! inserts in two phases:
//!
//! 1. `add`: the view is wrapped as form (a) and inserted into the names
//!    index. A first insertion writes the leaf record — exactly the 8-byte
//!    slot, as form (b) — and the adder remembers `(view, slot address)`.
//! 2. `flush`: for each remembered entry, pad to 2-byte alignment, write
//!    the body (varint length, minimum two bytes, then the characters),
//!    and overwrite the slot with the body address (form c). Flushing at
//!    the end clusters all new bodies contiguously at the transaction
//!    tail.
//!
//! After commit every string in the index is form (c), and because the
//! index made them unique, *equal addresses iff equal contents*: equality
//! between two form-(c) strings is a pointer comparison. Any other
//! combination compares byte contents.
//!
//! ## Safety of Form (b)
//!
//! A form-(b) slot stores a real process pointer in the file. That is
//! sound under the commit protocol: the slot only becomes reachable from a
//! committed root after `flush` has patched it to form (c) — an
//! uncommitted crash leaves the old footer, from which no form-(b) leaf is
//! reachable. The only way a reader can encounter the heap form is through
//! a deliberately corrupted file, and the reader path refuses it as
//! [`StoreError::BadAddress`] without ever dereferencing. Dereference
//! happens solely inside the writing process, between `add` and `flush`,
//! while the adder keeps every pending view alive.

use eyre::Result;

use crate::address::{Address, TypedAddress};
use crate::database::database::Database;
use crate::database::transaction::Transaction;
use crate::encoding::archive::{read_string, read_string_length, write_string};
use crate::error::StoreError;
use crate::index::{stable_hash, HamtSet, IndexKey};

/// Mask of the heap bit in an in-store string slot.
const IN_HEAP_MASK: u64 = 1;

/// A thin, pinned (pointer, length) pair naming string bytes owned
/// elsewhere. Form-(b) slots point at one of these.
#[repr(C)]
#[derive(Debug)]
pub struct StrView {
    ptr: *const u8,
    len: usize,
}

impl StrView {
    fn bytes(&self) -> &[u8] {
        // SAFETY: whoever constructs a StrView (the adder's pending
        // entries, or a probe on the stack) keeps the owning allocation
        // alive for at least as long as the view.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// An interned string in any of its three forms.
#[derive(Debug, Clone, Copy)]
pub struct IndirectString {
    repr: Repr,
}

#[derive(Debug, Clone, Copy)]
enum Repr {
    /// Form (a): a view that has not been inserted yet.
    View(*const StrView),
    /// Forms (b) and (c): the raw slot word as stored in the file.
    Slot(u64),
}

impl IndirectString {
    /// Wraps a pinned view as a not-yet-inserted string.
    ///
    /// The view must stay alive for as long as this value (and any slot
    /// written from it within the open transaction) is used; the
    /// [`StringAdder`] upholds this for its pending entries.
    pub(crate) fn from_view(view: &StrView) -> IndirectString {
        let ptr = view as *const StrView;
        debug_assert_eq!(ptr as u64 & IN_HEAP_MASK, 0);
        IndirectString {
            repr: Repr::View(ptr),
        }
    }

    fn from_slot(word: u64) -> IndirectString {
        IndirectString {
            repr: Repr::Slot(word),
        }
    }

    /// Reads the indirect string stored at `addr`.
    pub fn read(db: &Database, addr: TypedAddress<IndirectString>) -> Result<IndirectString> {
        let bytes = db.read_bytes(addr.to_address(), 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(IndirectString::from_slot(u64::from_le_bytes(raw)))
    }

    /// True if this is form (c): the canonical in-store body.
    pub fn is_in_store(&self) -> bool {
        matches!(self.repr, Repr::Slot(word) if word & IN_HEAP_MASK == 0)
    }

    /// The body address of a form-(c) string.
    pub fn in_store_address(&self) -> Result<Address> {
        match self.repr {
            Repr::Slot(word) if word & IN_HEAP_MASK == 0 => Ok(Address::new(word)),
            Repr::Slot(word) => Err(StoreError::bad_address(
                word,
                "string slot payload is tagged as a heap pointer",
            )
            .into()),
            Repr::View(_) => Err(StoreError::bad_address(0, "string has not been interned").into()),
        }
    }

    /// Length of the string in bytes.
    pub fn length(&self, db: &Database) -> Result<u64> {
        match self.repr {
            Repr::View(view) => {
                // SAFETY: see from_view; the view outlives this value.
                Ok(unsafe { &*view }.bytes().len() as u64)
            }
            Repr::Slot(word) if word & IN_HEAP_MASK == 0 => {
                Ok(read_string_length(db, Address::new(word))?.0)
            }
            Repr::Slot(word) => {
                // SAFETY: a heap-tagged slot is only observable inside the
                // transaction that installed it, while the adder pins the
                // view (see module docs).
                Ok(unsafe { &*((word & !IN_HEAP_MASK) as *const StrView) }
                    .bytes()
                    .len() as u64)
            }
        }
    }

    /// The string's bytes, whichever form it is in.
    ///
    /// This is the writer-side accessor: it will follow a form-(b) heap
    /// pointer. Readers of committed data use [`IndirectString::to_bytes`].
    pub(crate) fn contents(&self, db: &Database) -> Result<Vec<u8>> {
        match self.repr {
            Repr::View(view) => {
                // SAFETY: see from_view.
                Ok(unsafe { &*view }.bytes().to_vec())
            }
            Repr::Slot(word) if word & IN_HEAP_MASK == 0 => read_string(db, Address::new(word)),
            Repr::Slot(word) => {
                // SAFETY: see length(); transaction-lifetime only.
                Ok(unsafe { &*((word & !IN_HEAP_MASK) as *const StrView) }
                    .bytes()
                    .to_vec())
            }
        }
    }

    /// The bytes of a committed (form-c) string.
    ///
    /// Fails with [`StoreError::BadAddress`] — without dereferencing
    /// anything — if the slot payload is still tagged as a heap pointer,
    /// which in a committed file means corruption.
    pub fn to_bytes(&self, db: &Database) -> Result<Vec<u8>> {
        read_string(db, self.in_store_address()?)
    }

    /// As [`IndirectString::to_bytes`], decoded as UTF-8.
    pub fn to_string(&self, db: &Database) -> Result<String> {
        String::from_utf8(self.to_bytes(db)?).map_err(|e| {
            eyre::eyre!("interned string is not valid UTF-8: {}", e)
        })
    }
}

impl IndexKey for IndirectString {
    fn hash_key(&self, db: &Database) -> Result<u64> {
        Ok(stable_hash(&self.contents(db)?))
    }

    fn eq_key(&self, db: &Database, other: &Self) -> Result<bool> {
        // Interned bodies are unique, so two form-(c) strings are equal
        // iff their addresses are; every other combination compares
        // contents.
        if let (Repr::Slot(a), Repr::Slot(b)) = (self.repr, other.repr) {
            if a & IN_HEAP_MASK == 0 && b & IN_HEAP_MASK == 0 {
                return Ok(a == b);
            }
        }
        Ok(self.contents(db)? == other.contents(db)?)
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let word = match self.repr {
            Repr::View(view) => view as u64 | IN_HEAP_MASK,
            Repr::Slot(word) => word,
        };
        out.extend_from_slice(&word.to_le_bytes());
        Ok(())
    }

    fn decode(db: &Database, addr: Address) -> Result<(IndirectString, usize)> {
        let bytes = db.read_bytes(addr, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok((IndirectString::from_slot(u64::from_le_bytes(raw)), 8))
    }
}

/// One pending insertion: the pinned view and the slot to patch.
struct PendingString {
    /// Owns the string bytes.
    _owner: Box<[u8]>,
    /// The pinned view the slot's form-(b) payload points at.
    view: Box<StrView>,
    /// In-store address of the slot to patch at flush time.
    slot: TypedAddress<IndirectString>,
}

/// Two-phase string interner; see the module docs.
#[derive(Default)]
pub struct StringAdder {
    pending: Vec<PendingString>,
}

impl StringAdder {
    pub fn new() -> StringAdder {
        StringAdder::default()
    }

    /// As [`StringAdder::new`], reserving room for `expected` insertions.
    pub fn with_expected_size(expected: usize) -> StringAdder {
        StringAdder {
            pending: Vec::with_capacity(expected),
        }
    }

    /// Number of first-insertions awaiting their bodies.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Inserts `s` into `index`, remembering first-insertions for
    /// back-patching at [`StringAdder::flush`].
    ///
    /// Returns the leaf (slot) address and whether the string was new.
    pub fn add(
        &mut self,
        txn: &mut Transaction<'_>,
        index: &mut HamtSet<IndirectString>,
        s: &str,
    ) -> Result<(Address, bool)> {
        let owner: Box<[u8]> = s.as_bytes().into();
        let view = Box::new(StrView {
            ptr: owner.as_ptr(),
            len: owner.len(),
        });

        let key = IndirectString::from_view(&view);
        let (slot, inserted) = index.insert(txn, &key)?;
        if inserted {
            // The leaf record is exactly the 8-byte slot; keep the view
            // alive until flush patches it.
            self.pending.push(PendingString {
                _owner: owner,
                view,
                slot: TypedAddress::new(slot),
            });
        }
        Ok((slot, inserted))
    }

    /// Writes the body of every remembered string and patches its slot
    /// from form (b) to form (c). Bodies land contiguously at the
    /// transaction tail.
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
        for entry in self.pending.drain(..) {
            let body = write_string(txn, entry.view.bytes())?;
            debug_assert_eq!(body.absolute() & IN_HEAP_MASK, 0);
            txn.write(entry.slot.to_address(), &body.absolute().to_le_bytes())?;
        }
        Ok(())
    }
}

/// Looks up `s` in an interned-string index.
pub fn find_string(
    index: &HamtSet<IndirectString>,
    db: &Database,
    s: &str,
) -> Result<Option<Address>> {
    let owner: Box<[u8]> = s.as_bytes().into();
    let view = StrView {
        ptr: owner.as_ptr(),
        len: owner.len(),
    };
    let probe = IndirectString::from_view(&view);
    index.find(db, &probe)
}

/// Reads the interned string whose slot is at `leaf`.
pub fn read_string_at(db: &Database, leaf: Address) -> Result<String> {
    IndirectString::read(db, TypedAddress::new(leaf))?.to_string(db)
}
