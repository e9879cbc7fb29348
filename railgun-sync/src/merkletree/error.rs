use crate::hash::MerkleHash;

/// Errors raised synchronously to the caller that delivered bad data
#[allow(missing_docs)] // error types document themselves
#[derive(Debug, thiserror::Error)]
pub enum MerkletreeError {
    #[error("Position {position} out of range for tree {tree} with capacity {capacity}")]
    PositionOutOfRange {
        tree: u32,
        position: u64,
        capacity: u64,
    },
    #[error("Unshield in transaction {txid} has zero value")]
    InvalidUnshieldAmount { txid: MerkleHash },
    #[error("Token hash mismatch. Expected {expected}, event token hashes to {actual}")]
    TokenHashMismatch {
        expected: MerkleHash,
        actual: MerkleHash,
    },
    #[error("Unshield for transaction {txid} and token {token_hash} already stored with different contents")]
    DuplicateUnshield {
        txid: MerkleHash,
        token_hash: MerkleHash,
    },
    #[error("No unshield stored for transaction {txid} and token {token_hash}")]
    UnshieldNotFound {
        txid: MerkleHash,
        token_hash: MerkleHash,
    },
}
