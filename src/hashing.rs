//! Order hashing, hashlock construction, and Merkle secret trees.
//!
//! The on-chain EIP-712 ABI encoding itself is out of scope (spec §1): the
//! concrete byte-for-byte typed-data encoding is owned by the chain adapter
//! and signature verifier the core merely consumes. What the core *does*
//! own is the deterministic, pure hashing scheme described in spec §6/§9:
//! the same input fields always produce the same order hash, the secret
//! hash is `keccak256(secret)`, the hashlock is `keccak256(secretHash)`,
//! and partial-fill secrets are committed to via a real binary Merkle tree
//! with domain separation (not the weak hash-of-concatenation the spec
//! calls out as a mistake to avoid).

use sha3::{Digest, Keccak256};

pub const ORDER_DOMAIN_NAME: &str = "1inch Limit Order Protocol";
pub const ORDER_DOMAIN_VERSION: &str = "4";

const MERKLE_LEAF_DOMAIN: &[u8] = b"fusion-relayer/merkle-leaf";
const MERKLE_NODE_DOMAIN: &[u8] = b"fusion-relayer/merkle-node";

/// Fields hashed into the order hash, matching spec §6's EIP-712 field list.
pub struct OrderHashFields<'a> {
    pub salt: u128,
    pub maker_asset: &'a str,
    pub taker_asset: &'a str,
    pub maker: &'a str,
    pub receiver: &'a str,
    pub allowed_sender: &'a str,
    pub making_amount: u128,
    pub taking_amount: u128,
    pub offsets: u128,
    pub interactions: &'a [u8],
    pub chain_id: u64,
    pub verifying_contract: &'a str,
}

/// Deterministic structured hash over the order fields and domain.
///
/// Pure: identical fields always yield an identical 32-byte digest, and the
/// digest is stable across process restarts (spec §3 "deterministic order
/// hash").
pub fn order_hash(fields: &OrderHashFields<'_>) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(ORDER_DOMAIN_NAME.as_bytes());
    hasher.update(ORDER_DOMAIN_VERSION.as_bytes());
    hasher.update(fields.chain_id.to_be_bytes());
    hasher.update(fields.verifying_contract.as_bytes());
    hasher.update(fields.salt.to_be_bytes());
    hasher.update(fields.maker_asset.as_bytes());
    hasher.update(fields.taker_asset.as_bytes());
    hasher.update(fields.maker.as_bytes());
    hasher.update(fields.receiver.as_bytes());
    hasher.update(fields.allowed_sender.as_bytes());
    hasher.update(fields.making_amount.to_be_bytes());
    hasher.update(fields.taking_amount.to_be_bytes());
    hasher.update(fields.offsets.to_be_bytes());
    hasher.update(fields.interactions);
    hasher.finalize().into()
}

pub fn hex_hash(hash: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Secret hash = keccak256(utf8(secret)) (spec §6).
pub fn secret_hash(secret: &str) -> [u8; 32] {
    Keccak256::digest(secret.as_bytes()).into()
}

/// Hashlock = keccak256(hashOfSecret): the two-level commitment an on-chain
/// escrow actually checks against (spec §6): `keccak256(providedSecret) ==
/// hashlock`.
pub fn hashlock(secret_hash: &[u8; 32]) -> [u8; 32] {
    Keccak256::digest(secret_hash).into()
}

pub fn keccak(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

/// A real binary Merkle tree over the N+1 partial-fill secret hashes
/// (spec §3 "Merkle secret tree", §9 "real Merkle construction").
///
/// Leaves and internal nodes are hashed under distinct domain tags so a
/// leaf hash can never be replayed as an internal node hash.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    layers: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Builds the tree over `leaf_hashes` (already-hashed secrets, i.e.
    /// `H[0..N]` in spec notation). Odd layers duplicate the last node,
    /// the conventional odd-node rule for binary Merkle trees.
    pub fn build(leaf_hashes: &[[u8; 32]]) -> Self {
        assert!(!leaf_hashes.is_empty(), "merkle tree needs at least one leaf");
        let leaves: Vec<[u8; 32]> = leaf_hashes
            .iter()
            .map(|h| domain_hash(MERKLE_LEAF_DOMAIN, &[h]))
            .collect();

        let mut layers = vec![leaves];
        while layers.last().unwrap().len() > 1 {
            let prev = layers.last().unwrap();
            let mut next = Vec::with_capacity(prev.len().div_ceil(2));
            for pair in prev.chunks(2) {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                next.push(domain_hash(MERKLE_NODE_DOMAIN, &[&left, &right]));
            }
            layers.push(next);
        }
        Self { layers }
    }

    pub fn root(&self) -> [u8; 32] {
        self.layers.last().unwrap()[0]
    }

    /// `O(log N)` inclusion proof for the leaf at `index`: sibling hashes
    /// from the leaf layer up to (excluding) the root.
    pub fn proof(&self, mut index: usize) -> Vec<[u8; 32]> {
        let mut proof = Vec::new();
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling_index = index ^ 1;
            let sibling = layer.get(sibling_index).copied().unwrap_or(layer[index]);
            proof.push(sibling);
            index /= 2;
        }
        proof
    }

    /// Verifies a proof against a root without requiring the whole tree,
    /// for chain-adapter or test use.
    pub fn verify(root: [u8; 32], leaf_hash: [u8; 32], mut index: usize, proof: &[[u8; 32]]) -> bool {
        let mut node = domain_hash(MERKLE_LEAF_DOMAIN, &[&leaf_hash]);
        for sibling in proof {
            node = if index % 2 == 0 {
                domain_hash(MERKLE_NODE_DOMAIN, &[&node, sibling])
            } else {
                domain_hash(MERKLE_NODE_DOMAIN, &[sibling, &node])
            };
            index /= 2;
        }
        node == root
    }
}

fn domain_hash(domain: &[u8], parts: &[&[u8; 32]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_hash_is_pure() {
        let fields = OrderHashFields {
            salt: 1,
            maker_asset: "0xabc",
            taker_asset: "0xdef",
            maker: "0x1",
            receiver: "0x2",
            allowed_sender: "0x0",
            making_amount: 1000,
            taking_amount: 900,
            offsets: 0,
            interactions: b"",
            chain_id: 1,
            verifying_contract: "0xcontract",
        };
        assert_eq!(order_hash(&fields), order_hash(&fields));
    }

    #[test]
    fn hashlock_is_two_level() {
        let s = secret_hash("my-secret");
        let h = hashlock(&s);
        assert_ne!(s, h);
        assert_eq!(h, keccak(&s));
    }

    #[test]
    fn merkle_round_trips_proofs() {
        let leaves: Vec<[u8; 32]> = (0..5u8).map(|i| keccak(&[i])).collect();
        let tree = MerkleTree::build(&leaves);
        let root = tree.root();
        for (i, leaf) in leaves.iter().enumerate() {
            let proof = tree.proof(i);
            assert!(MerkleTree::verify(root, *leaf, i, &proof));
        }
    }

    #[test]
    fn merkle_leaf_and_node_domains_differ() {
        let leaves: Vec<[u8; 32]> = (0..2u8).map(|i| keccak(&[i])).collect();
        let tree = MerkleTree::build(&leaves);
        assert_ne!(domain_hash(MERKLE_LEAF_DOMAIN, &[&leaves[0]]), tree.root());
    }
}
