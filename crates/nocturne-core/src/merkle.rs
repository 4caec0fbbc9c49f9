//! Append-only binary Merkle tree over ledger entries.
//!
//! Hashing:
//! - leaf: `SHA-256(0x00 || canonical_json(entry))`
//! - node: `SHA-256(0x01 || left || right)`
//! - empty tree: 32 zero bytes
//!
//! Nodes pair left-to-right at each level. An unpaired last node is carried up
//! to the next level unchanged (it is not duplicated). Inclusion paths list
//! only the siblings actually consumed on the way up; which side each sibling
//! sits on is derived from `(leaf_index, tree_size)`, never stored.

use nocturne_state::{LedgerEntry, MerkleHash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::digest::canonical_bytes;
use crate::domain::error::Result;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Leaf hash of a ledger entry.
pub fn leaf_hash(entry: &LedgerEntry) -> Result<MerkleHash> {
    let encoded = canonical_bytes(entry)?;
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(&encoded);
    Ok(MerkleHash::from_bytes(hasher.finalize().into()))
}

/// Interior node hash.
pub fn node_hash(left: &MerkleHash, right: &MerkleHash) -> MerkleHash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    MerkleHash::from_bytes(hasher.finalize().into())
}

/// Sibling chain from one leaf to the root of a tree of `tree_size` leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionPath {
    pub leaf_index: u64,
    pub tree_size: u64,
    pub siblings: Vec<MerkleHash>,
}

impl InclusionPath {
    /// Recompute the root this path leads to from `leaf`.
    ///
    /// Returns `None` if the path is inconsistent with `(leaf_index,
    /// tree_size)`: too few siblings, leftover siblings, or an index outside
    /// the tree.
    pub fn root_for(&self, leaf: MerkleHash) -> Option<MerkleHash> {
        if self.tree_size == 0 || self.leaf_index >= self.tree_size {
            return None;
        }
        let mut siblings = self.siblings.iter();
        let mut hash = leaf;
        let mut index = self.leaf_index;
        let mut width = self.tree_size;

        while width > 1 {
            if index % 2 == 1 {
                hash = node_hash(siblings.next()?, &hash);
            } else if index + 1 < width {
                hash = node_hash(&hash, siblings.next()?);
            }
            index /= 2;
            width = width.div_ceil(2);
        }

        if siblings.next().is_some() {
            return None;
        }
        Some(hash)
    }
}

fn build_levels(leaves: &[MerkleHash]) -> Vec<Vec<MerkleHash>> {
    let mut levels = vec![leaves.to_vec()];
    while levels.last().is_some_and(|l| l.len() > 1) {
        let below = &levels[levels.len() - 1];
        let above = below
            .chunks(2)
            .map(|pair| match pair.get(1) {
                Some(right) => node_hash(&pair[0], right),
                None => pair[0],
            })
            .collect();
        levels.push(above);
    }
    levels
}

fn path_in(levels: &[Vec<MerkleHash>], leaf_index: usize) -> Vec<MerkleHash> {
    let mut siblings = Vec::new();
    let mut index = leaf_index;
    for nodes in levels {
        if nodes.len() <= 1 {
            break;
        }
        if index % 2 == 1 {
            siblings.push(nodes[index - 1]);
        } else if index + 1 < nodes.len() {
            siblings.push(nodes[index + 1]);
        }
        index /= 2;
    }
    siblings
}

/// Incrementally extended Merkle tree.
///
/// `levels[0]` holds the leaf hashes; each append recomputes only the right
/// edge of the tree.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    levels: Vec<Vec<MerkleHash>>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from leaf hashes in order.
    pub fn from_leaves(leaves: &[MerkleHash]) -> Self {
        if leaves.is_empty() {
            return Self::new();
        }
        Self {
            levels: build_levels(leaves),
        }
    }

    pub fn len(&self) -> u64 {
        self.levels.first().map_or(0, |l| l.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leaves(&self) -> &[MerkleHash] {
        self.levels.first().map_or(&[], |l| l.as_slice())
    }

    /// Append a leaf, returning its index.
    pub fn push(&mut self, leaf: MerkleHash) -> u64 {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);
        let leaf_index = self.levels[0].len() - 1;

        let mut level = 0;
        let mut index = leaf_index;
        while self.levels[level].len() > 1 {
            let nodes = &self.levels[level];
            // `index` is always the last node of its level here.
            let parent = if index % 2 == 1 {
                node_hash(&nodes[index - 1], &nodes[index])
            } else {
                nodes[index]
            };
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            let above = &mut self.levels[level + 1];
            let parent_index = index / 2;
            if parent_index < above.len() {
                above[parent_index] = parent;
            } else {
                above.push(parent);
            }
            level += 1;
            index = parent_index;
        }
        leaf_index as u64
    }

    pub fn root(&self) -> MerkleHash {
        match self.levels.last() {
            Some(top) if !top.is_empty() => top[0],
            _ => MerkleHash::ZERO,
        }
    }

    /// Inclusion path for `leaf_index` against the current root.
    pub fn path(&self, leaf_index: u64) -> Option<InclusionPath> {
        if leaf_index >= self.len() {
            return None;
        }
        Some(InclusionPath {
            leaf_index,
            tree_size: self.len(),
            siblings: path_in(&self.levels, leaf_index as usize),
        })
    }

    /// Inclusion path for `leaf_index` against the root the tree had when it
    /// held `tree_size` leaves.
    pub fn path_at(&self, leaf_index: u64, tree_size: u64) -> Option<InclusionPath> {
        if tree_size == self.len() {
            return self.path(leaf_index);
        }
        if leaf_index >= tree_size || tree_size > self.len() {
            return None;
        }
        let levels = build_levels(&self.leaves()[..tree_size as usize]);
        Some(InclusionPath {
            leaf_index,
            tree_size,
            siblings: path_in(&levels, leaf_index as usize),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(n: u8) -> MerkleHash {
        MerkleHash::from_bytes([n; 32])
    }

    #[test]
    fn test_empty_tree_root_is_zero() {
        assert_eq!(MerkleTree::new().root(), MerkleHash::ZERO);
        assert!(MerkleTree::new().path(0).is_none());
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let mut tree = MerkleTree::new();
        tree.push(leaf(1));
        assert_eq!(tree.root(), leaf(1));
        let path = tree.path(0).unwrap();
        assert!(path.siblings.is_empty());
        assert_eq!(path.root_for(leaf(1)), Some(leaf(1)));
    }

    #[test]
    fn test_odd_node_is_carried_not_duplicated() {
        let mut tree = MerkleTree::new();
        for n in 0..3 {
            tree.push(leaf(n));
        }
        let expected = node_hash(&node_hash(&leaf(0), &leaf(1)), &leaf(2));
        assert_eq!(tree.root(), expected);

        // The carried leaf consumes exactly one sibling on the way up.
        let path = tree.path(2).unwrap();
        assert_eq!(path.siblings, vec![node_hash(&leaf(0), &leaf(1))]);
    }

    #[test]
    fn test_root_changes_on_every_append() {
        let mut tree = MerkleTree::new();
        let mut seen = std::collections::HashSet::new();
        for n in 0..16 {
            tree.push(leaf(n));
            assert!(seen.insert(tree.root()));
        }
    }

    #[test]
    fn test_path_rejects_extra_or_missing_siblings() {
        let tree = MerkleTree::from_leaves(&(0..5).map(leaf).collect::<Vec<_>>());
        let mut path = tree.path(1).unwrap();
        let root = tree.root();
        assert_eq!(path.root_for(leaf(1)), Some(root));

        path.siblings.push(leaf(9));
        assert_eq!(path.root_for(leaf(1)), None);
        path.siblings.truncate(1);
        assert_eq!(path.root_for(leaf(1)), None);
    }

    #[test]
    fn test_index_outside_tree_is_rejected() {
        let path = InclusionPath {
            leaf_index: 3,
            tree_size: 3,
            siblings: vec![],
        };
        assert_eq!(path.root_for(leaf(0)), None);
    }

    #[test]
    fn test_historical_path_matches_historical_root() {
        let mut tree = MerkleTree::new();
        let mut roots = Vec::new();
        for n in 0..7 {
            tree.push(leaf(n));
            roots.push(tree.root());
        }
        let path = tree.path_at(2, 4).unwrap();
        assert_eq!(path.root_for(leaf(2)), Some(roots[3]));
        assert!(tree.path_at(4, 4).is_none());
        assert!(tree.path_at(0, 8).is_none());
    }

    proptest! {
        #[test]
        fn prop_incremental_tree_matches_batch_build(size in 1usize..80) {
            let leaves: Vec<MerkleHash> = (0..size).map(|n| leaf(n as u8)).collect();
            let mut tree = MerkleTree::new();
            for l in &leaves {
                tree.push(*l);
            }
            prop_assert_eq!(tree.root(), MerkleTree::from_leaves(&leaves).root());
        }

        #[test]
        fn prop_every_leaf_verifies(size in 1usize..80, pick in any::<prop::sample::Index>()) {
            let leaves: Vec<MerkleHash> = (0..size).map(|n| leaf(n as u8)).collect();
            let tree = MerkleTree::from_leaves(&leaves);
            let i = pick.index(size);
            let path = tree.path(i as u64).unwrap();
            prop_assert_eq!(path.root_for(leaves[i]), Some(tree.root()));
        }

        #[test]
        fn prop_flipped_sibling_byte_breaks_path(
            size in 2usize..64,
            pick in any::<prop::sample::Index>(),
            which in any::<prop::sample::Index>(),
            byte in 0usize..32,
        ) {
            let leaves: Vec<MerkleHash> = (0..size).map(|n| leaf(n as u8)).collect();
            let tree = MerkleTree::from_leaves(&leaves);
            let i = pick.index(size);
            let mut path = tree.path(i as u64).unwrap();
            prop_assume!(!path.siblings.is_empty());

            let s = which.index(path.siblings.len());
            let mut bytes = *path.siblings[s].as_bytes();
            bytes[byte] ^= 0x01;
            path.siblings[s] = MerkleHash::from_bytes(bytes);
            prop_assert_ne!(path.root_for(leaves[i]), Some(tree.root()));
        }
    }
}
