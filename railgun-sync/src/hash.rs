//! 32 byte node hashes and the keccak based hash functions of both trees.

use std::fmt;
use std::io::{self, Read, Write};

use incrementalmerkletree::{Hashable, Level};
use sha3::{Digest, Keccak256};

/// A tree node, leaf hash, nullifier or railgun txid.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MerkleHash(pub [u8; 32]);

impl MerkleHash {
    /// All zero bytes. Seeds the verification hash chain.
    pub const ZERO: MerkleHash = MerkleHash([0u8; 32]);

    /// Parses a hex string, with or without `0x` prefix, left padding to 32 bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let trimmed = hex_str.trim_start_matches("0x");
        let padded = format!("{:0>64}", trimmed);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(padded, &mut bytes)?;
        Ok(MerkleHash(bytes))
    }

    /// Big endian encoding of a number, as the chain stores uint256 values.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        MerkleHash(bytes)
    }

    /// Lowercase hex without a prefix
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Deserialize 32 raw bytes
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut bytes = [0u8; 32];
        reader.read_exact(&mut bytes)?;
        Ok(MerkleHash(bytes))
    }

    /// Serialize as 32 raw bytes
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.0)
    }
}

impl fmt::Debug for MerkleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MerkleHash({})", self.to_hex())
    }
}

impl fmt::Display for MerkleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl From<[u8; 32]> for MerkleHash {
    fn from(bytes: [u8; 32]) -> Self {
        MerkleHash(bytes)
    }
}

/// keccak256 over the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> MerkleHash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    MerkleHash(hasher.finalize().into())
}

impl Hashable for MerkleHash {
    fn empty_leaf() -> Self {
        keccak256(&[b"Railgun"])
    }

    fn combine(_level: Level, a: &Self, b: &Self) -> Self {
        keccak256(&[&a.0, &b.0])
    }
}

/// Empty subtree roots for levels `0..=depth`.
pub fn zero_hashes(depth: u8) -> Vec<MerkleHash> {
    let mut zeros = Vec::with_capacity(depth as usize + 1);
    let mut current = MerkleHash::empty_leaf();
    zeros.push(current);
    for level in 0..depth {
        current = MerkleHash::combine(Level::from(level), &current, &current);
        zeros.push(current);
    }
    zeros
}

/// Links a transaction to its predecessor: `H(previous or zero, first nullifier)`.
pub fn verification_hash(
    previous: Option<MerkleHash>,
    first_nullifier: &MerkleHash,
) -> MerkleHash {
    let previous = previous.unwrap_or(MerkleHash::ZERO);
    keccak256(&[&previous.0, &first_nullifier.0])
}

fn hash_list(hashes: &[MerkleHash]) -> MerkleHash {
    let mut hasher = Keccak256::new();
    for hash in hashes {
        hasher.update(hash.0);
    }
    MerkleHash(hasher.finalize().into())
}

/// Protocol level id of a proof verified transaction.
pub fn railgun_txid(
    nullifiers: &[MerkleHash],
    commitments: &[MerkleHash],
    bound_params_hash: &MerkleHash,
) -> MerkleHash {
    let nullifiers_hash = hash_list(nullifiers);
    let commitments_hash = hash_list(commitments);
    keccak256(&[&nullifiers_hash.0, &commitments_hash.0, &bound_params_hash.0])
}

/// Leaf of the txid tree.
pub fn railgun_txid_leaf_hash(
    railgun_txid: &MerkleHash,
    utxo_tree_in: u32,
    global_utxo_position_out: u64,
) -> MerkleHash {
    keccak256(&[
        &railgun_txid.0,
        &MerkleHash::from_u64(utxo_tree_in as u64).0,
        &MerkleHash::from_u64(global_utxo_position_out).0,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_hex_pads_and_strips_prefix() {
        let hash = MerkleHash::from_hex("0x01ff").unwrap();
        assert_eq!(hash.0[30], 0x01);
        assert_eq!(hash.0[31], 0xff);
        assert!(hash.0[..30].iter().all(|byte| *byte == 0));
        assert_eq!(MerkleHash::from_u64(0x01ff), hash);
        assert!(MerkleHash::from_hex("zz").is_err());
    }

    #[test]
    fn zero_hashes_chain_from_empty_leaf() {
        let zeros = zero_hashes(3);
        assert_eq!(zeros.len(), 4);
        assert_eq!(zeros[0], MerkleHash::empty_leaf());
        assert_eq!(zeros[2], MerkleHash::combine(Level::from(1), &zeros[1], &zeros[1]));
        assert_eq!(zeros[3], MerkleHash::empty_root(Level::from(3)));
    }

    #[test]
    fn verification_hash_is_deterministic() {
        let nullifier = MerkleHash::from_u64(7);
        let first = verification_hash(None, &nullifier);
        assert_eq!(first, verification_hash(Some(MerkleHash::ZERO), &nullifier));
        let second = verification_hash(Some(first), &MerkleHash::from_u64(8));
        assert_eq!(
            second,
            verification_hash(
                Some(verification_hash(None, &nullifier)),
                &MerkleHash::from_u64(8)
            )
        );
        assert_ne!(first, second);
    }

    #[test]
    fn railgun_txid_binds_every_input() {
        let nullifiers = [MerkleHash::from_u64(1)];
        let commitments = [MerkleHash::from_u64(2), MerkleHash::from_u64(3)];
        let bound = MerkleHash::from_u64(4);
        let txid = railgun_txid(&nullifiers, &commitments, &bound);
        assert_ne!(txid, railgun_txid(&nullifiers, &commitments[..1], &bound));
        assert_ne!(
            txid,
            railgun_txid(&nullifiers, &commitments, &MerkleHash::from_u64(5))
        );
    }
}
