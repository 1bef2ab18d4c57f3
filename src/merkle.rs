// Merkle aggregation over ordered content hashes.
// Odd levels duplicate their last hash; interior nodes are SHA256(left || right).

use crate::entry::{Entry, Hash, Tier, ZERO_HASH};
use crate::ledger::TierSnapshot;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    let mut next: Vec<Hash> = Vec::with_capacity(level.len().div_ceil(2));
    let mut i = 0;
    while i < level.len() {
        let a = level[i];
        let b = if i + 1 < level.len() { level[i + 1] } else { level[i] };
        next.push(hash_pair(&a, &b));
        i += 2;
    }
    next
}

/// Root over leaves in the given order. Empty input yields ZERO_HASH; a single leaf is its own root.
pub fn build_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Which side the sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Hash,
    pub side: Side,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub entry_id: u64,
    pub leaf_index: usize,
    pub path: Vec<ProofStep>,
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    ids: Vec<u64>,
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Leaves are (entry_id, content_hash) in chain order.
    pub fn from_leaves(leaves: Vec<(u64, Hash)>) -> Self {
        let ids: Vec<u64> = leaves.iter().map(|(id, _)| *id).collect();
        let mut levels = vec![leaves.into_iter().map(|(_, h)| h).collect::<Vec<Hash>>()];
        loop {
            let top = &levels[levels.len() - 1];
            if top.len() <= 1 {
                break;
            }
            let next = next_level(top);
            levels.push(next);
        }
        Self { ids, levels }
    }

    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a Entry>,
    {
        Self::from_leaves(entries.into_iter().map(|e| (e.entry_id, e.content_hash)).collect())
    }

    pub fn root(&self) -> Hash {
        match self.levels.last() {
            Some(top) if !top.is_empty() => top[0],
            _ => ZERO_HASH,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn leaf(&self, entry_id: u64) -> Option<Hash> {
        let idx = self.ids.iter().position(|id| *id == entry_id)?;
        self.levels.first().map(|l| l[idx])
    }

    pub fn proof(&self, entry_id: u64) -> Option<MerkleProof> {
        let leaf_index = self.ids.iter().position(|id| *id == entry_id)?;
        let mut path = Vec::new();
        let mut idx = leaf_index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let step = if idx % 2 == 0 {
                let sibling = if idx + 1 < level.len() { level[idx + 1] } else { level[idx] };
                ProofStep {
                    sibling,
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    sibling: level[idx - 1],
                    side: Side::Left,
                }
            };
            path.push(step);
            idx /= 2;
        }
        Some(MerkleProof {
            entry_id,
            leaf_index,
            path,
        })
    }
}

/// Fold `leaf` up `proof` and compare with `root`.
pub fn verify_proof(entry_id: u64, leaf: &Hash, root: &Hash, proof: &MerkleProof) -> bool {
    if proof.entry_id != entry_id {
        return false;
    }
    let mut acc = *leaf;
    for step in &proof.path {
        acc = match step.side {
            Side::Left => hash_pair(&step.sibling, &acc),
            Side::Right => hash_pair(&acc, &step.sibling),
        };
    }
    &acc == root
}

/// Anchorable digest of a tier's live entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDigest {
    pub tier: Tier,
    pub root: Hash,
    pub first_id: Option<u64>,
    pub last_id: Option<u64>,
    pub count: usize,
    pub head: Hash,
}

impl TierDigest {
    pub fn of(snapshot: &TierSnapshot) -> Self {
        let tree = MerkleTree::from_entries(snapshot.live().map(|e| &**e));
        Self {
            tier: snapshot.tier,
            root: tree.root(),
            first_id: snapshot.live().next().map(|e| e.entry_id),
            last_id: snapshot.live().last().map(|e| e.entry_id),
            count: tree.len(),
            head: snapshot.head,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::sha256;

    fn leaves(n: usize) -> Vec<(u64, Hash)> {
        (0..n as u64).map(|i| (i + 10, sha256(&i.to_le_bytes()))).collect()
    }

    #[test]
    fn empty_and_single() {
        assert_eq!(build_root(&[]), ZERO_HASH);
        let h = sha256(b"x");
        assert_eq!(build_root(&[h]), h);
        assert_eq!(MerkleTree::from_leaves(vec![]).root(), ZERO_HASH);
    }

    #[test]
    fn odd_level_duplicates_last() {
        let l: Vec<Hash> = leaves(3).into_iter().map(|(_, h)| h).collect();
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &hash_pair(&l[2], &l[2]));
        assert_eq!(build_root(&l), expected);
    }

    #[test]
    fn tree_root_matches_build_root() {
        for n in 1..12 {
            let l = leaves(n);
            let flat: Vec<Hash> = l.iter().map(|(_, h)| *h).collect();
            assert_eq!(MerkleTree::from_leaves(l).root(), build_root(&flat), "n={}", n);
        }
    }

    #[test]
    fn every_leaf_proves_and_tamper_fails() {
        for n in [1usize, 2, 5, 8, 9] {
            let tree = MerkleTree::from_leaves(leaves(n));
            let root = tree.root();
            for (id, h) in leaves(n) {
                let proof = tree.proof(id).expect("proof");
                assert!(verify_proof(id, &h, &root, &proof), "n={} id={}", n, id);
                let mut bad = h;
                bad[0] ^= 1;
                assert!(!verify_proof(id, &bad, &root, &proof));
                assert!(!verify_proof(id + 1000, &h, &root, &proof));
            }
        }
    }

    #[test]
    fn unknown_entry_has_no_proof() {
        let tree = MerkleTree::from_leaves(leaves(4));
        assert!(tree.proof(999).is_none());
    }
}
