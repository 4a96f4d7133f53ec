//! # HAMT Set
//!
//! A set is the map specialised with the empty value: leaf records carry
//! the key alone, and the unit value serialises to zero bytes. Everything
//! else — copy-on-write, flush, iteration order — is the map's.

use eyre::Result;

use crate::address::{Address, TypedAddress};
use crate::database::database::Database;
use crate::database::layout::HeaderBlock;
use crate::database::transaction::Transaction;
use crate::index::map::{HamtMap, Iter};
use crate::index::IndexKey;

/// A HAMT-backed set of keys.
pub struct HamtSet<K> {
    map: HamtMap<K, ()>,
}

impl<K: IndexKey> HamtSet<K> {
    /// An empty set.
    pub fn new() -> HamtSet<K> {
        HamtSet { map: HamtMap::new() }
    }

    /// Loads a set from its header block; a null block is the empty set.
    pub fn load(db: &Database, block: Option<TypedAddress<HeaderBlock>>) -> Result<HamtSet<K>> {
        Ok(HamtSet {
            map: HamtMap::load(db, block)?,
        })
    }

    /// Number of keys in the set.
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// True if the set carries unflushed nodes.
    pub fn is_dirty(&self) -> bool {
        self.map.is_dirty()
    }

    /// Inserts `key`, returning its leaf address and whether it was new.
    pub fn insert(&mut self, txn: &mut Transaction<'_>, key: &K) -> Result<(Address, bool)> {
        self.map.insert(txn, key, &())
    }

    /// Finds the leaf address of `key`.
    pub fn find(&self, db: &Database, key: &K) -> Result<Option<Address>> {
        self.map.find(db, key)
    }

    /// True if `key` is present.
    pub fn contains(&self, db: &Database, key: &K) -> Result<bool> {
        Ok(self.map.find(db, key)?.is_some())
    }

    /// Decodes the key stored at `leaf`.
    pub fn read_key(db: &Database, leaf: Address) -> Result<K> {
        let (key, _) = HamtMap::<K, ()>::read_entry(db, leaf)?;
        Ok(key)
    }

    /// Iterates leaf addresses in hash-prefix order.
    pub fn iter<'a>(&'a self, db: &'a Database) -> Iter<'a, K, ()> {
        self.map.iter(db)
    }

    /// Appends dirty nodes and the header block; see [`HamtMap::flush`].
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<TypedAddress<HeaderBlock>> {
        self.map.flush(txn)
    }
}

impl<K: IndexKey> Default for HamtSet<K> {
    fn default() -> Self {
        HamtSet::new()
    }
}
