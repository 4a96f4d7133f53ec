//! # HAMT Map
//!
//! The typed façade over the trie: insert, find, iterate, flush. One
//! [`HamtMap`] instance represents one named index as of one revision,
//! plus any dirty state accumulated during the open transaction.
//!
//! ## Mixed Residency
//!
//! A loaded map starts fully store-resident: its root is a tagged address
//! from the index's header block. Inserting copies exactly the nodes on
//! the modification path into the arena (copy-on-write), so committed
//! nodes are never mutated and clean subtrees are never rewritten. At
//! flush time the dirty nodes are appended post-order — children before
//! parents, each with its exact packed size — and the arena is discarded.
//!
//! ## Insert
//!
//! Descend by six-bit hash chunks. An empty slot takes a new leaf; a
//! colliding leaf splits into as many single-child branches as the two
//! hashes share chunks, ending in a two-child branch — or, if the hashes
//! are fully equal, a linear collision node at maximum depth. Inserting a
//! key that is already present writes nothing and reports the existing
//! leaf: the trie is idempotent.
//!
//! ## Iteration
//!
//! Depth-first, children in bitmap order (low chunk to high), linear
//! leaves in insertion order. Over a committed revision the sequence is
//! stable across processes because it is a pure function of the persisted
//! structure.

use std::marker::PhantomData;

use eyre::Result;
use smallvec::SmallVec;

use crate::address::{Address, TypedAddress};
use crate::database::database::Database;
use crate::database::layout::{HeaderBlock, HEADER_BLOCK_SIZE};
use crate::database::transaction::Transaction;
use crate::index::node::{
    depth_is_branch, hash_chunk, Branch, HeapNode, IndexPointer, LinearNode, NodeArena,
    HASH_INDEX_BITS, LEAF_ALIGN, MAX_TREE_DEPTH,
};
use crate::index::{IndexKey, IndexValue};

/// A hash-array-mapped trie over the store.
pub struct HamtMap<K, V> {
    root: IndexPointer,
    size: u64,
    arena: NodeArena,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> HamtMap<K, V> {
    /// An empty map.
    pub fn new() -> HamtMap<K, V> {
        HamtMap {
            root: IndexPointer::Null,
            size: 0,
            arena: NodeArena::new(),
            _marker: PhantomData,
        }
    }

    /// Loads a map from its header block; a null block is the empty map.
    pub fn load(db: &Database, block: Option<TypedAddress<HeaderBlock>>) -> Result<HamtMap<K, V>> {
        let Some(block_addr) = block else {
            return Ok(HamtMap::new());
        };
        let bytes = db.read_bytes(block_addr.to_address(), HEADER_BLOCK_SIZE)?;
        let header = HeaderBlock::from_bytes(&bytes, block_addr.to_address())?;
        let root = IndexPointer::from_store_word(header.root(), block_addr.to_address())?;
        Ok(HamtMap {
            root,
            size: header.size(),
            arena: NodeArena::new(),
            _marker: PhantomData,
        })
    }

    /// Number of keys in the map.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True if the map carries unflushed nodes.
    pub fn is_dirty(&self) -> bool {
        !self.arena.is_empty() || matches!(self.root, IndexPointer::Heap(_))
    }

    /// Inserts `key` → `value`, returning the leaf address and whether the
    /// key was new.
    ///
    /// Inserting an existing key allocates nothing and returns the
    /// existing leaf with `false`.
    pub fn insert(
        &mut self,
        txn: &mut Transaction<'_>,
        key: &K,
        value: &V,
    ) -> Result<(Address, bool)> {
        let hash = key.hash_key(txn.db())?;
        match self.root {
            IndexPointer::Null => {
                let leaf = Self::write_leaf(txn, key, value)?;
                self.root = IndexPointer::Leaf(leaf);
                self.size += 1;
                Ok((leaf, true))
            }
            root => {
                let (new_root, leaf, inserted) =
                    self.insert_node(txn, root, key, value, hash, 0)?;
                self.root = new_root;
                if inserted {
                    self.size += 1;
                }
                Ok((leaf, inserted))
            }
        }
    }

    /// Finds the leaf address of `key`, in store and arena alike.
    pub fn find(&self, db: &Database, key: &K) -> Result<Option<Address>> {
        let hash = key.hash_key(db)?;
        let mut node = self.root;
        let mut shift = 0u32;
        loop {
            match node {
                IndexPointer::Null => return Ok(None),
                IndexPointer::Leaf(addr) => {
                    let (existing, _) = K::decode(db, addr)?;
                    return Ok(if key.eq_key(db, &existing)? {
                        Some(addr)
                    } else {
                        None
                    });
                }
                IndexPointer::Store(addr) => {
                    if depth_is_branch(shift) {
                        let branch = Branch::load(db, addr)?;
                        match branch.lookup(hash_chunk(hash, shift)) {
                            None => return Ok(None),
                            Some((child, _)) => {
                                node = child;
                                shift += HASH_INDEX_BITS;
                            }
                        }
                    } else {
                        let linear = LinearNode::load(db, addr)?;
                        return self.find_among(db, key, linear.leaves());
                    }
                }
                IndexPointer::Heap(handle) => match self.arena.node(handle) {
                    HeapNode::Branch(branch) => match branch.lookup(hash_chunk(hash, shift)) {
                        None => return Ok(None),
                        Some((child, _)) => {
                            node = child;
                            shift += HASH_INDEX_BITS;
                        }
                    },
                    HeapNode::Linear(linear) => {
                        return self.find_among(db, key, linear.leaves());
                    }
                },
            }
        }
    }

    /// Reads the value stored for `key`.
    pub fn get(&self, db: &Database, key: &K) -> Result<Option<V>> {
        match self.find(db, key)? {
            None => Ok(None),
            Some(leaf) => {
                let (_, value) = Self::read_entry(db, leaf)?;
                Ok(Some(value))
            }
        }
    }

    /// Decodes the key/value pair of the leaf record at `leaf`.
    pub fn read_entry(db: &Database, leaf: Address) -> Result<(K, V)> {
        let (key, used) = K::decode(db, leaf)?;
        let value = V::decode(db, leaf.add(used as u64))?;
        Ok((key, value))
    }

    /// Iterates leaf addresses in hash-prefix order.
    pub fn iter<'a>(&'a self, db: &'a Database) -> Iter<'a, K, V> {
        Iter {
            db,
            map: self,
            stack: SmallVec::new(),
            started: false,
        }
    }

    /// Appends every dirty node to the store, then the header block;
    /// returns the block's address for the trailer's root table.
    ///
    /// The arena is discarded afterwards: the map is fully store-resident
    /// again.
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<TypedAddress<HeaderBlock>> {
        let root = self.flush_node(txn, self.root)?;
        self.arena.clear();
        self.root = root;

        let block = HeaderBlock::new(self.size, root.to_store_word());
        txn.put(&block, 8)
    }

    fn flush_node(
        &mut self,
        txn: &mut Transaction<'_>,
        node: IndexPointer,
    ) -> Result<IndexPointer> {
        let handle = match node {
            IndexPointer::Heap(handle) => handle,
            clean => return Ok(clean),
        };

        match self.arena.node(handle).clone() {
            HeapNode::Branch(mut branch) => {
                for slot in 0..branch.child_count() {
                    let child = branch.children()[slot];
                    let flushed = self.flush_node(txn, child)?;
                    branch.set_child(slot, flushed);
                }
                let mut image = Vec::with_capacity(Branch::store_size(branch.child_count()));
                branch.encode(&mut image);
                Ok(IndexPointer::Store(txn.put_bytes(&image, LEAF_ALIGN)?))
            }
            HeapNode::Linear(linear) => {
                let mut image = Vec::with_capacity(LinearNode::store_size(linear.len()));
                linear.encode(&mut image);
                Ok(IndexPointer::Store(txn.put_bytes(&image, LEAF_ALIGN)?))
            }
        }
    }

    fn insert_node(
        &mut self,
        txn: &mut Transaction<'_>,
        node: IndexPointer,
        key: &K,
        value: &V,
        hash: u64,
        shift: u32,
    ) -> Result<(IndexPointer, Address, bool)> {
        match node {
            IndexPointer::Null => unreachable!("null pointers never appear below the root"),

            IndexPointer::Leaf(existing) => {
                let (existing_key, _) = K::decode(txn.db(), existing)?;
                if key.eq_key(txn.db(), &existing_key)? {
                    return Ok((node, existing, false));
                }
                let existing_hash = existing_key.hash_key(txn.db())?;
                let new_leaf = Self::write_leaf(txn, key, value)?;
                let split = self.disambiguate(existing, existing_hash, new_leaf, hash, shift);
                Ok((split, new_leaf, true))
            }

            IndexPointer::Store(addr) if depth_is_branch(shift) => {
                let branch = Branch::load(txn.db(), addr)?;
                let index = hash_chunk(hash, shift);
                match branch.lookup(index) {
                    None => {
                        let new_leaf = Self::write_leaf(txn, key, value)?;
                        let mut copy = branch;
                        copy.insert_child(index, IndexPointer::Leaf(new_leaf));
                        let handle = self.arena.alloc_branch(copy);
                        Ok((IndexPointer::Heap(handle), new_leaf, true))
                    }
                    Some((child, slot)) => {
                        let (new_child, leaf, inserted) =
                            self.insert_node(txn, child, key, value, hash, shift + HASH_INDEX_BITS)?;
                        if new_child == child {
                            debug_assert!(!inserted);
                            return Ok((node, leaf, inserted));
                        }
                        let mut copy = branch;
                        copy.set_child(slot, new_child);
                        let handle = self.arena.alloc_branch(copy);
                        Ok((IndexPointer::Heap(handle), leaf, inserted))
                    }
                }
            }

            IndexPointer::Store(addr) => {
                let linear = LinearNode::load(txn.db(), addr)?;
                for &leaf in linear.leaves() {
                    let (existing_key, _) = K::decode(txn.db(), leaf)?;
                    if key.eq_key(txn.db(), &existing_key)? {
                        return Ok((node, leaf, false));
                    }
                }
                let new_leaf = Self::write_leaf(txn, key, value)?;
                let mut copy = linear;
                copy.push(new_leaf);
                let handle = self.arena.alloc_linear(copy);
                Ok((IndexPointer::Heap(handle), new_leaf, true))
            }

            IndexPointer::Heap(handle) if depth_is_branch(shift) => {
                let index = hash_chunk(hash, shift);
                match self.arena.branch(handle).lookup(index) {
                    None => {
                        let new_leaf = Self::write_leaf(txn, key, value)?;
                        self.arena
                            .branch_mut(handle)
                            .insert_child(index, IndexPointer::Leaf(new_leaf));
                        Ok((node, new_leaf, true))
                    }
                    Some((child, slot)) => {
                        let (new_child, leaf, inserted) =
                            self.insert_node(txn, child, key, value, hash, shift + HASH_INDEX_BITS)?;
                        if new_child != child {
                            self.arena.branch_mut(handle).set_child(slot, new_child);
                        }
                        Ok((node, leaf, inserted))
                    }
                }
            }

            IndexPointer::Heap(handle) => {
                let leaves: SmallVec<[Address; 8]> =
                    SmallVec::from_slice(self.arena.linear(handle).leaves());
                for leaf in leaves {
                    let (existing_key, _) = K::decode(txn.db(), leaf)?;
                    if key.eq_key(txn.db(), &existing_key)? {
                        return Ok((node, leaf, false));
                    }
                }
                let new_leaf = Self::write_leaf(txn, key, value)?;
                self.arena.linear_mut(handle).push(new_leaf);
                Ok((node, new_leaf, true))
            }
        }
    }

    /// Builds the chain of nodes separating two colliding leaves: one
    /// branch per shared hash chunk, a two-child branch where the chunks
    /// first differ, or a linear node if the hashes never do.
    fn disambiguate(
        &mut self,
        existing_leaf: Address,
        existing_hash: u64,
        new_leaf: Address,
        new_hash: u64,
        shift: u32,
    ) -> IndexPointer {
        if !depth_is_branch(shift) {
            let linear = LinearNode::new_pair(existing_leaf, new_leaf);
            return IndexPointer::Heap(self.arena.alloc_linear(linear));
        }

        let existing_index = hash_chunk(existing_hash, shift);
        let new_index = hash_chunk(new_hash, shift);
        if existing_index != new_index {
            let branch = Branch::new_pair(
                existing_index,
                IndexPointer::Leaf(existing_leaf),
                new_index,
                IndexPointer::Leaf(new_leaf),
            );
            IndexPointer::Heap(self.arena.alloc_branch(branch))
        } else {
            let child = self.disambiguate(
                existing_leaf,
                existing_hash,
                new_leaf,
                new_hash,
                shift + HASH_INDEX_BITS,
            );
            IndexPointer::Heap(self.arena.alloc_branch(Branch::new_single(existing_index, child)))
        }
    }

    fn find_among(&self, db: &Database, key: &K, leaves: &[Address]) -> Result<Option<Address>> {
        for &leaf in leaves {
            let (existing, _) = K::decode(db, leaf)?;
            if key.eq_key(db, &existing)? {
                return Ok(Some(leaf));
            }
        }
        Ok(None)
    }

    fn write_leaf(txn: &mut Transaction<'_>, key: &K, value: &V) -> Result<Address> {
        let mut image = Vec::new();
        key.encode(&mut image)?;
        value.encode(&mut image);
        txn.put_bytes(&image, LEAF_ALIGN)
    }
}

impl<K: IndexKey, V: IndexValue> Default for HamtMap<K, V> {
    fn default() -> Self {
        HamtMap::new()
    }
}

enum FrameNode<'a> {
    OwnedBranch(Branch),
    OwnedLinear(LinearNode),
    ArenaBranch(&'a Branch),
    ArenaLinear(&'a LinearNode),
}

impl FrameNode<'_> {
    fn child_count(&self) -> usize {
        match self {
            FrameNode::OwnedBranch(b) => b.child_count(),
            FrameNode::ArenaBranch(b) => b.child_count(),
            FrameNode::OwnedLinear(l) => l.len(),
            FrameNode::ArenaLinear(l) => l.len(),
        }
    }

    fn child(&self, slot: usize) -> IndexPointer {
        match self {
            FrameNode::OwnedBranch(b) => b.children()[slot],
            FrameNode::ArenaBranch(b) => b.children()[slot],
            FrameNode::OwnedLinear(l) => IndexPointer::Leaf(l.leaves()[slot]),
            FrameNode::ArenaLinear(l) => IndexPointer::Leaf(l.leaves()[slot]),
        }
    }
}

struct Frame<'a> {
    node: FrameNode<'a>,
    next: usize,
    shift: u32,
}

/// Depth-first traversal yielding leaf addresses in hash-prefix order.
pub struct Iter<'a, K, V> {
    db: &'a Database,
    map: &'a HamtMap<K, V>,
    stack: SmallVec<[Frame<'a>; MAX_TREE_DEPTH]>,
    started: bool,
}

impl<'a, K: IndexKey, V: IndexValue> Iter<'a, K, V> {
    fn make_frame(&self, node: IndexPointer, shift: u32) -> Result<Frame<'a>> {
        let map = self.map;
        let frame_node = match node {
            IndexPointer::Store(addr) => {
                if depth_is_branch(shift) {
                    FrameNode::OwnedBranch(Branch::load(self.db, addr)?)
                } else {
                    FrameNode::OwnedLinear(LinearNode::load(self.db, addr)?)
                }
            }
            IndexPointer::Heap(handle) => match map.arena.node(handle) {
                HeapNode::Branch(branch) => FrameNode::ArenaBranch(branch),
                HeapNode::Linear(linear) => FrameNode::ArenaLinear(linear),
            },
            IndexPointer::Null | IndexPointer::Leaf(_) => {
                unreachable!("only internal nodes become frames")
            }
        };
        Ok(Frame {
            node: frame_node,
            next: 0,
            shift,
        })
    }
}

impl<K: IndexKey, V: IndexValue> Iterator for Iter<'_, K, V> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            match self.map.root {
                IndexPointer::Null => return None,
                IndexPointer::Leaf(addr) => return Some(Ok(addr)),
                internal => match self.make_frame(internal, 0) {
                    Ok(frame) => self.stack.push(frame),
                    Err(err) => return Some(Err(err)),
                },
            }
        }

        loop {
            let exhausted = {
                let frame = self.stack.last()?;
                frame.next >= frame.node.child_count()
            };
            if exhausted {
                self.stack.pop();
                continue;
            }

            let (child, child_shift) = {
                let frame = self.stack.last_mut()?;
                let child = frame.node.child(frame.next);
                frame.next += 1;
                (child, frame.shift + HASH_INDEX_BITS)
            };

            match child {
                IndexPointer::Leaf(addr) => return Some(Ok(addr)),
                IndexPointer::Store(_) | IndexPointer::Heap(_) => {
                    match self.make_frame(child, child_shift) {
                        Ok(frame) => self.stack.push(frame),
                        Err(err) => return Some(Err(err)),
                    }
                }
                IndexPointer::Null => unreachable!("null child inside an internal node"),
            }
        }
    }
}
