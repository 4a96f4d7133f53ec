//! # Trie Nodes
//!
//! Node machinery for the HAMT indexes: the tagged child pointer, branch
//! and linear node images, and the per-index arena that owns dirty nodes
//! during a transaction.
//!
//! ## Hash Consumption
//!
//! Keys hash to 64 bits consumed six bits at a time, one chunk per branch
//! level. Eleven branch levels exhaust the hash (the last level sees only
//! four real bits); keys whose hashes still collide at that depth fall
//! into a *linear* node, a flat list searched by content comparison.
//!
//! ```text
//! depth   0     1     2    ...   10     11
//! shift   0     6     12   ...   60     (linear)
//! ```
//!
//! ## Child Pointers
//!
//! In memory a child pointer is the [`IndexPointer`] enum — null, a leaf
//! record address, the address of a store-resident internal node, or a
//! handle into the heap arena. On disk it is a tagged 64-bit word:
//!
//! ```text
//! bit 0 (INTERNAL_BIT)  set = branch/linear node, clear = leaf
//! bit 1 (HEAP_BIT)      set = heap node; never valid on disk
//! bits 2..63            address (low tag bits implicitly zero)
//! ```
//!
//! Leaf records are 8-aligned and nodes likewise, so the two tag bits are
//! free. Whether an internal node is a branch or a linear node is not
//! encoded in the pointer: it follows from the depth at which the pointer
//! is found, exactly as the signature check confirms. A word with the heap
//! bit set on disk means the flush walk failed to convert a dirty node and
//! is reported as corruption.
//!
//! ## Node Images
//!
//! ```text
//! Branch:  signature (8) | bitmap (8) | popcount(bitmap) tagged words
//! Linear:  signature (8) | length (8) | length leaf addresses
//! ```
//!
//! Bit `k` of a branch bitmap is set iff a child exists for hash chunk
//! `k`; the child's slot in the packed array is the popcount of the bitmap
//! below bit `k`.
//!
//! ## The Arena
//!
//! Copy-on-write keeps committed nodes immutable: inserting through a
//! store-resident node copies it into the transaction's arena and patches
//! the copy. The arena is a plain growable vector owned by the index
//! object — never the global allocator for store-bound images — and is
//! discarded wholesale after flush, which bounds the flush walk to exactly
//! the dirty nodes.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::address::Address;
use crate::database::database::Database;
use crate::error::StoreError;

/// Signature of a persisted branch node.
pub const BRANCH_SIGNATURE: &[u8; 8] = b"StrataBr";

/// Signature of a persisted linear node.
pub const LINEAR_SIGNATURE: &[u8; 8] = b"StrataLn";

/// Bits of hash consumed per branch level.
pub const HASH_INDEX_BITS: u32 = 6;

/// Mask extracting one hash chunk.
pub const HASH_INDEX_MASK: u64 = (1 << HASH_INDEX_BITS) - 1;

/// Hash bits available to branch levels, rounded up to whole chunks.
pub const MAX_HASH_BITS: u32 = ((64 + HASH_INDEX_BITS - 1) / HASH_INDEX_BITS) * HASH_INDEX_BITS;

/// Number of branch levels before linear nodes take over.
pub const MAX_BRANCH_DEPTH: u32 = MAX_HASH_BITS / HASH_INDEX_BITS;

/// Branch levels plus one linear level plus the leaf.
pub const MAX_TREE_DEPTH: usize = MAX_BRANCH_DEPTH as usize + 2;

/// Alignment of every leaf record and node image; keeps the two pointer
/// tag bits free.
pub const LEAF_ALIGN: u64 = 8;

const INTERNAL_BIT: u64 = 1;
const HEAP_BIT: u64 = 2;
const TAG_MASK: u64 = INTERNAL_BIT | HEAP_BIT;

/// True while `shift` addresses a branch level.
#[inline]
pub fn depth_is_branch(shift: u32) -> bool {
    shift < MAX_HASH_BITS
}

/// The six hash bits consumed at `shift`.
#[inline]
pub fn hash_chunk(hash: u64, shift: u32) -> u32 {
    debug_assert!(shift < 64);
    ((hash >> shift) & HASH_INDEX_MASK) as u32
}

/// Handle to a dirty node in a [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(u32);

/// A child pointer: where a subtree lives right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPointer {
    /// No subtree (only ever the root of an empty trie).
    Null,
    /// Store address of a leaf record.
    Leaf(Address),
    /// Store address of a branch or linear node; which one follows from
    /// the depth.
    Store(Address),
    /// A dirty node in the transaction's arena.
    Heap(NodeHandle),
}

impl IndexPointer {
    /// Decodes a persisted tagged word.
    pub fn from_store_word(word: u64, at: Address) -> Result<IndexPointer> {
        if word == 0 {
            return Ok(IndexPointer::Null);
        }
        ensure!(
            word & HEAP_BIT == 0,
            StoreError::corrupt(
                "index node",
                at.absolute(),
                format!("heap-tagged child word {:#x} in the store", word)
            )
        );
        if word & INTERNAL_BIT != 0 {
            Ok(IndexPointer::Store(Address::new(word & !TAG_MASK)))
        } else {
            Ok(IndexPointer::Leaf(Address::new(word)))
        }
    }

    /// Encodes this pointer as a persisted tagged word.
    ///
    /// Heap pointers must have been flushed first.
    pub fn to_store_word(self) -> u64 {
        match self {
            IndexPointer::Null => 0,
            IndexPointer::Leaf(addr) => {
                debug_assert_eq!(addr.absolute() & TAG_MASK, 0);
                addr.absolute()
            }
            IndexPointer::Store(addr) => {
                debug_assert_eq!(addr.absolute() & TAG_MASK, 0);
                addr.absolute() | INTERNAL_BIT
            }
            IndexPointer::Heap(_) => unreachable!("heap nodes are flushed before encoding"),
        }
    }

    pub fn is_null(self) -> bool {
        matches!(self, IndexPointer::Null)
    }
}

/// An interior trie node: bitmap plus popcount-packed children.
#[derive(Debug, Clone)]
pub struct Branch {
    bitmap: u64,
    children: SmallVec<[IndexPointer; 4]>,
}

impl Branch {
    /// A branch holding one child at hash chunk `index`.
    pub fn new_single(index: u32, child: IndexPointer) -> Branch {
        debug_assert!(index < 64);
        let mut children = SmallVec::new();
        children.push(child);
        Branch {
            bitmap: 1 << index,
            children,
        }
    }

    /// A branch holding two children at distinct hash chunks.
    pub fn new_pair(a_index: u32, a: IndexPointer, b_index: u32, b: IndexPointer) -> Branch {
        debug_assert!(a_index < 64 && b_index < 64 && a_index != b_index);
        let mut children = SmallVec::new();
        if a_index < b_index {
            children.push(a);
            children.push(b);
        } else {
            children.push(b);
            children.push(a);
        }
        Branch {
            bitmap: (1 << a_index) | (1 << b_index),
            children,
        }
    }

    pub fn bitmap(&self) -> u64 {
        self.bitmap
    }

    pub fn child_count(&self) -> usize {
        self.bitmap.count_ones() as usize
    }

    pub fn children(&self) -> &[IndexPointer] {
        &self.children
    }

    /// The child for hash chunk `index`, with its slot in the packed
    /// array.
    pub fn lookup(&self, index: u32) -> Option<(IndexPointer, usize)> {
        debug_assert!(index < 64);
        let bit = 1u64 << index;
        if self.bitmap & bit == 0 {
            return None;
        }
        let slot = (self.bitmap & (bit - 1)).count_ones() as usize;
        Some((self.children[slot], slot))
    }

    /// Inserts a child at a currently empty hash chunk.
    pub fn insert_child(&mut self, index: u32, child: IndexPointer) {
        debug_assert!(index < 64);
        let bit = 1u64 << index;
        debug_assert_eq!(self.bitmap & bit, 0, "slot already occupied");
        let slot = (self.bitmap & (bit - 1)).count_ones() as usize;
        self.children.insert(slot, child);
        self.bitmap |= bit;
    }

    /// Replaces the child in packed slot `slot`.
    pub fn set_child(&mut self, slot: usize, child: IndexPointer) {
        self.children[slot] = child;
    }

    /// Bytes a persisted branch with `n` children occupies.
    pub const fn store_size(n: usize) -> usize {
        16 + n * 8
    }

    /// Builds the persisted image. All children must be store-resident.
    pub fn encode(&self, out: &mut Vec<u8>) {
        debug_assert_eq!(self.children.len(), self.child_count());
        out.extend_from_slice(BRANCH_SIGNATURE);
        out.extend_from_slice(&self.bitmap.to_le_bytes());
        for child in &self.children {
            out.extend_from_slice(&child.to_store_word().to_le_bytes());
        }
    }

    /// Loads a branch from the store, checking its signature and shape.
    pub fn load(db: &Database, addr: Address) -> Result<Branch> {
        let head = db.read_bytes(addr, 16)?;
        ensure!(
            &head[..8] == BRANCH_SIGNATURE,
            StoreError::corrupt("branch node", addr.absolute(), "bad signature")
        );
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&head[8..16]);
        let bitmap = u64::from_le_bytes(raw);
        ensure!(
            bitmap != 0,
            StoreError::corrupt("branch node", addr.absolute(), "empty bitmap")
        );

        let n = bitmap.count_ones() as usize;
        let body = db.read_bytes(addr.add(16), n * 8)?;
        let mut children = SmallVec::with_capacity(n);
        for slot in 0..n {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&body[slot * 8..slot * 8 + 8]);
            let child = IndexPointer::from_store_word(u64::from_le_bytes(raw), addr)?;
            ensure!(
                !child.is_null(),
                StoreError::corrupt("branch node", addr.absolute(), "null child word")
            );
            children.push(child);
        }
        Ok(Branch { bitmap, children })
    }
}

/// The collision node of last resort: a flat list of leaf addresses for
/// keys indistinguishable by their full hash.
#[derive(Debug, Clone, Default)]
pub struct LinearNode {
    leaves: Vec<Address>,
}

impl LinearNode {
    pub fn new_pair(a: Address, b: Address) -> LinearNode {
        LinearNode { leaves: vec![a, b] }
    }

    pub fn leaves(&self) -> &[Address] {
        &self.leaves
    }

    pub fn push(&mut self, leaf: Address) {
        self.leaves.push(leaf);
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Bytes a persisted linear node with `n` leaves occupies.
    pub const fn store_size(n: usize) -> usize {
        16 + n * 8
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(LINEAR_SIGNATURE);
        out.extend_from_slice(&(self.leaves.len() as u64).to_le_bytes());
        for leaf in &self.leaves {
            out.extend_from_slice(&leaf.absolute().to_le_bytes());
        }
    }

    pub fn load(db: &Database, addr: Address) -> Result<LinearNode> {
        let head = db.read_bytes(addr, 16)?;
        ensure!(
            &head[..8] == LINEAR_SIGNATURE,
            StoreError::corrupt("linear node", addr.absolute(), "bad signature")
        );
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&head[8..16]);
        let len = u64::from_le_bytes(raw);
        ensure!(
            len > 0 && len < (1 << 32),
            StoreError::corrupt(
                "linear node",
                addr.absolute(),
                format!("implausible length {}", len)
            )
        );

        let body = db.read_bytes(addr.add(16), len as usize * 8)?;
        let mut leaves = Vec::with_capacity(len as usize);
        for slot in 0..len as usize {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&body[slot * 8..slot * 8 + 8]);
            let leaf = Address::new(u64::from_le_bytes(raw));
            ensure!(
                !leaf.is_null(),
                StoreError::corrupt("linear node", addr.absolute(), "null leaf address")
            );
            leaves.push(leaf);
        }
        Ok(LinearNode { leaves })
    }
}

/// A dirty node owned by the arena.
#[derive(Debug, Clone)]
pub enum HeapNode {
    Branch(Branch),
    Linear(LinearNode),
}

/// Transaction-lifetime owner of dirty nodes.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<HeapNode>,
}

impl NodeArena {
    pub fn new() -> NodeArena {
        NodeArena::default()
    }

    pub fn alloc_branch(&mut self, branch: Branch) -> NodeHandle {
        self.nodes.push(HeapNode::Branch(branch));
        NodeHandle((self.nodes.len() - 1) as u32)
    }

    pub fn alloc_linear(&mut self, linear: LinearNode) -> NodeHandle {
        self.nodes.push(HeapNode::Linear(linear));
        NodeHandle((self.nodes.len() - 1) as u32)
    }

    pub fn node(&self, handle: NodeHandle) -> &HeapNode {
        &self.nodes[handle.0 as usize]
    }

    pub fn branch(&self, handle: NodeHandle) -> &Branch {
        match self.node(handle) {
            HeapNode::Branch(branch) => branch,
            HeapNode::Linear(_) => unreachable!("expected a branch at this depth"),
        }
    }

    pub fn branch_mut(&mut self, handle: NodeHandle) -> &mut Branch {
        match &mut self.nodes[handle.0 as usize] {
            HeapNode::Branch(branch) => branch,
            HeapNode::Linear(_) => unreachable!("expected a branch at this depth"),
        }
    }

    pub fn linear(&self, handle: NodeHandle) -> &LinearNode {
        match self.node(handle) {
            HeapNode::Linear(linear) => linear,
            HeapNode::Branch(_) => unreachable!("expected a linear node at this depth"),
        }
    }

    pub fn linear_mut(&mut self, handle: NodeHandle) -> &mut LinearNode {
        match &mut self.nodes[handle.0 as usize] {
            HeapNode::Linear(linear) => linear,
            HeapNode::Branch(_) => unreachable!("expected a linear node at this depth"),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Discards every dirty node; called after flush.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_constants() {
        assert_eq!(MAX_HASH_BITS, 66);
        assert_eq!(MAX_BRANCH_DEPTH, 11);
        assert_eq!(MAX_TREE_DEPTH, 13);
        assert!(depth_is_branch(60));
        assert!(!depth_is_branch(66));
    }

    #[test]
    fn hash_chunks_cover_the_hash() {
        let hash = 0x0123_4567_89AB_CDEF_u64;
        let mut rebuilt = 0u64;
        for depth in 0..MAX_BRANCH_DEPTH {
            let shift = depth * HASH_INDEX_BITS;
            if shift >= 64 {
                break;
            }
            rebuilt |= u64::from(hash_chunk(hash, shift)) << shift;
        }
        assert_eq!(rebuilt, hash);
    }

    #[test]
    fn tagged_word_round_trips() {
        let at = Address::new(4096);
        for ptr in [
            IndexPointer::Null,
            IndexPointer::Leaf(Address::new(0x1000)),
            IndexPointer::Store(Address::new(0x2000)),
        ] {
            let word = ptr.to_store_word();
            assert_eq!(IndexPointer::from_store_word(word, at).unwrap(), ptr);
        }
    }

    #[test]
    fn heap_tagged_word_is_corrupt_on_disk() {
        let err = IndexPointer::from_store_word(0x1000 | 2, Address::new(64)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::StoreError>(),
            Some(crate::error::StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn branch_packing_follows_popcount_order() {
        let l1 = IndexPointer::Leaf(Address::new(0x100));
        let l2 = IndexPointer::Leaf(Address::new(0x200));
        let l3 = IndexPointer::Leaf(Address::new(0x300));

        let mut branch = Branch::new_pair(40, l1, 3, l2);
        assert_eq!(branch.children(), &[l2, l1]);

        branch.insert_child(10, l3);
        assert_eq!(branch.children(), &[l2, l3, l1]);
        assert_eq!(branch.child_count(), 3);

        assert_eq!(branch.lookup(3), Some((l2, 0)));
        assert_eq!(branch.lookup(10), Some((l3, 1)));
        assert_eq!(branch.lookup(40), Some((l1, 2)));
        assert_eq!(branch.lookup(11), None);
    }

    #[test]
    fn branch_image_has_exact_packed_size() {
        let branch = Branch::new_pair(
            0,
            IndexPointer::Leaf(Address::new(0x100)),
            63,
            IndexPointer::Leaf(Address::new(0x200)),
        );
        let mut image = Vec::new();
        branch.encode(&mut image);
        assert_eq!(image.len(), Branch::store_size(2));
        assert_eq!(&image[..8], BRANCH_SIGNATURE);
    }

    #[test]
    fn linear_image_has_exact_packed_size() {
        let linear = LinearNode::new_pair(Address::new(0x100), Address::new(0x200));
        let mut image = Vec::new();
        linear.encode(&mut image);
        assert_eq!(image.len(), LinearNode::store_size(2));
        assert_eq!(&image[..8], LINEAR_SIGNATURE);
    }

    #[test]
    fn arena_hands_out_stable_handles() {
        let mut arena = NodeArena::new();
        let a = arena.alloc_branch(Branch::new_single(1, IndexPointer::Leaf(Address::new(0x100))));
        let b = arena.alloc_linear(LinearNode::new_pair(Address::new(0x100), Address::new(0x200)));

        assert_eq!(arena.branch(a).child_count(), 1);
        assert_eq!(arena.linear(b).len(), 2);

        arena.branch_mut(a).insert_child(5, IndexPointer::Leaf(Address::new(0x300)));
        assert_eq!(arena.branch(a).child_count(), 2);

        arena.clear();
        assert!(arena.is_empty());
    }
}
