//! Module for primitive structs associated with the sync engine

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use getset::{CopyGetters, Getters};
use zcash_encoding::{Optional, Vector};

use railgun_config::Chain;
use railgun_status::scan_status::MerkletreeScanStatus;

use crate::hash::{keccak256, railgun_txid, railgun_txid_leaf_hash, MerkleHash};

/// 32 byte hash of an on-chain transaction.
pub type Txid = MerkleHash;

/// Protocol version of the txid scheme. Each version has its own pair of trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxidVersion {
    V2PoseidonMerkle,
    V3PoseidonMerkle,
}

impl TxidVersion {
    pub const ALL: [TxidVersion; 2] = [TxidVersion::V2PoseidonMerkle, TxidVersion::V3PoseidonMerkle];

    pub fn as_u8(&self) -> u8 {
        match self {
            TxidVersion::V2PoseidonMerkle => 2,
            TxidVersion::V3PoseidonMerkle => 3,
        }
    }

    pub fn from_u8(value: u8) -> io::Result<Self> {
        match value {
            2 => Ok(TxidVersion::V2PoseidonMerkle),
            3 => Ok(TxidVersion::V3PoseidonMerkle),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown txid version {}", value),
            )),
        }
    }
}

impl std::fmt::Display for TxidVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TxidVersion::V2PoseidonMerkle => "V2_PoseidonMerkle",
            TxidVersion::V3PoseidonMerkle => "V3_PoseidonMerkle",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenType {
    Erc20,
    Erc721,
    Erc1155,
}

impl TokenType {
    fn as_u8(&self) -> u8 {
        match self {
            TokenType::Erc20 => 0,
            TokenType::Erc721 => 1,
            TokenType::Erc1155 => 2,
        }
    }

    fn from_u8(value: u8) -> io::Result<Self> {
        match value {
            0 => Ok(TokenType::Erc20),
            1 => Ok(TokenType::Erc721),
            2 => Ok(TokenType::Erc1155),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown token type {}", value),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenData {
    pub token_type: TokenType,
    pub token_address: [u8; 20],
    pub token_sub_id: MerkleHash,
}

impl TokenData {
    pub fn erc20(token_address: [u8; 20]) -> Self {
        TokenData {
            token_type: TokenType::Erc20,
            token_address,
            token_sub_id: MerkleHash::ZERO,
        }
    }

    /// ERC20 tokens hash to their left padded address, NFTs to keccak of all three fields.
    pub fn token_hash(&self) -> MerkleHash {
        let mut padded_address = [0u8; 32];
        padded_address[12..].copy_from_slice(&self.token_address);
        match self.token_type {
            TokenType::Erc20 => MerkleHash(padded_address),
            _ => keccak256(&[
                &MerkleHash::from_u64(self.token_type.as_u8() as u64).0,
                &padded_address,
                &self.token_sub_id.0,
            ]),
        }
    }

    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let token_type = TokenType::from_u8(reader.read_u8()?)?;
        let mut token_address = [0u8; 20];
        reader.read_exact(&mut token_address)?;
        let token_sub_id = MerkleHash::read(&mut reader)?;
        Ok(TokenData {
            token_type,
            token_address,
            token_sub_id,
        })
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.token_type.as_u8())?;
        writer.write_all(&self.token_address)?;
        self.token_sub_id.write(&mut writer)
    }
}

/// Note contents that shields and legacy generated commitments reveal publicly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentPreimage {
    pub npk: MerkleHash,
    pub token: TokenData,
    pub value: u128,
}

impl CommitmentPreimage {
    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let npk = MerkleHash::read(&mut reader)?;
        let token = TokenData::read(&mut reader)?;
        let value = reader.read_u128::<LittleEndian>()?;
        Ok(CommitmentPreimage { npk, token, value })
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.npk.write(&mut writer)?;
        self.token.write(&mut writer)?;
        writer.write_u128::<LittleEndian>(self.value)
    }
}

/// Variant specific payload of a [`Commitment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitmentKind {
    Shield {
        preimage: CommitmentPreimage,
        encrypted_bundle: Vec<u8>,
        shield_key: Vec<u8>,
    },
    Transact {
        ciphertext: Vec<u8>,
        /// Back-filled once the txid tree has synced the producing transaction.
        railgun_txid: Option<MerkleHash>,
    },
    LegacyGenerated {
        preimage: CommitmentPreimage,
        encrypted_random: Vec<u8>,
    },
    LegacyEncrypted {
        ciphertext: Vec<u8>,
    },
}

/// A leaf of the UTXO tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitment {
    pub hash: MerkleHash,
    pub txid: Txid,
    /// `None` for legacy events that were indexed without a block.
    pub block_number: Option<u64>,
    pub timestamp: Option<u64>,
    pub utxo_tree: u32,
    pub utxo_index: u64,
    pub kind: CommitmentKind,
}

impl Commitment {
    pub fn serialized_version() -> u64 {
        1
    }

    pub fn railgun_txid(&self) -> Option<MerkleHash> {
        match &self.kind {
            CommitmentKind::Transact { railgun_txid, .. } => *railgun_txid,
            _ => None,
        }
    }

    /// Sets the back-reference of a transact commitment. Returns `true` if anything changed.
    pub fn set_railgun_txid(&mut self, new_railgun_txid: MerkleHash) -> bool {
        match &mut self.kind {
            CommitmentKind::Transact { railgun_txid, .. } => {
                if *railgun_txid == Some(new_railgun_txid) {
                    false
                } else {
                    *railgun_txid = Some(new_railgun_txid);
                    true
                }
            }
            _ => false,
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let _version = reader.read_u64::<LittleEndian>()?;

        let hash = MerkleHash::read(&mut reader)?;
        let txid = MerkleHash::read(&mut reader)?;
        let block_number = Optional::read(&mut reader, |r| r.read_u64::<LittleEndian>())?;
        let timestamp = Optional::read(&mut reader, |r| r.read_u64::<LittleEndian>())?;
        let utxo_tree = reader.read_u32::<LittleEndian>()?;
        let utxo_index = reader.read_u64::<LittleEndian>()?;
        let kind = match reader.read_u8()? {
            0 => CommitmentKind::Shield {
                preimage: CommitmentPreimage::read(&mut reader)?,
                encrypted_bundle: read_bytes(&mut reader)?,
                shield_key: read_bytes(&mut reader)?,
            },
            1 => CommitmentKind::Transact {
                ciphertext: read_bytes(&mut reader)?,
                railgun_txid: Optional::read(&mut reader, |r| MerkleHash::read(r))?,
            },
            2 => CommitmentKind::LegacyGenerated {
                preimage: CommitmentPreimage::read(&mut reader)?,
                encrypted_random: read_bytes(&mut reader)?,
            },
            3 => CommitmentKind::LegacyEncrypted {
                ciphertext: read_bytes(&mut reader)?,
            },
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown commitment kind {}", tag),
                ))
            }
        };

        Ok(Commitment {
            hash,
            txid,
            block_number,
            timestamp,
            utxo_tree,
            utxo_index,
            kind,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(Self::serialized_version())?;

        self.hash.write(&mut writer)?;
        self.txid.write(&mut writer)?;
        Optional::write(&mut writer, self.block_number, |w, b| {
            w.write_u64::<LittleEndian>(b)
        })?;
        Optional::write(&mut writer, self.timestamp, |w, t| {
            w.write_u64::<LittleEndian>(t)
        })?;
        writer.write_u32::<LittleEndian>(self.utxo_tree)?;
        writer.write_u64::<LittleEndian>(self.utxo_index)?;
        match &self.kind {
            CommitmentKind::Shield {
                preimage,
                encrypted_bundle,
                shield_key,
            } => {
                writer.write_u8(0)?;
                preimage.write(&mut writer)?;
                write_bytes(&mut writer, encrypted_bundle)?;
                write_bytes(&mut writer, shield_key)
            }
            CommitmentKind::Transact {
                ciphertext,
                railgun_txid,
            } => {
                writer.write_u8(1)?;
                write_bytes(&mut writer, ciphertext)?;
                Optional::write(&mut writer, *railgun_txid, |w, h| h.write(w))
            }
            CommitmentKind::LegacyGenerated {
                preimage,
                encrypted_random,
            } => {
                writer.write_u8(2)?;
                preimage.write(&mut writer)?;
                write_bytes(&mut writer, encrypted_random)
            }
            CommitmentKind::LegacyEncrypted { ciphertext } => {
                writer.write_u8(3)?;
                write_bytes(&mut writer, ciphertext)
            }
        }
    }
}

/// Records that some earlier commitment was spent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nullifier {
    pub txid: Txid,
    pub nullifier: MerkleHash,
    pub tree_number: u32,
    pub block_number: u64,
}

impl Nullifier {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Nullifier {
            txid: MerkleHash::read(&mut reader)?,
            nullifier: MerkleHash::read(&mut reader)?,
            tree_number: reader.read_u32::<LittleEndian>()?,
            block_number: reader.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.txid.write(&mut writer)?;
        self.nullifier.write(&mut writer)?;
        writer.write_u32::<LittleEndian>(self.tree_number)?;
        writer.write_u64::<LittleEndian>(self.block_number)
    }
}

/// A public withdrawal, keyed by `(txid, token hash)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnshieldStoredEvent {
    pub txid: Txid,
    pub token: TokenData,
    pub to_address: [u8; 20],
    pub amount: u128,
    pub fee: u128,
    pub block_number: u64,
    /// Absent for unshields synthesised from txid history.
    pub event_log_index: Option<u64>,
    pub railgun_txid: Option<MerkleHash>,
    pub timestamp: Option<u64>,
}

impl UnshieldStoredEvent {
    pub fn token_hash(&self) -> MerkleHash {
        self.token.token_hash()
    }

    /// Contents without the back-filled railgun txid, for duplicate detection.
    pub fn same_event_as(&self, other: &UnshieldStoredEvent) -> bool {
        self.txid == other.txid
            && self.token == other.token
            && self.to_address == other.to_address
            && self.amount == other.amount
            && self.fee == other.fee
            && self.block_number == other.block_number
            && self.event_log_index == other.event_log_index
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let txid = MerkleHash::read(&mut reader)?;
        let token = TokenData::read(&mut reader)?;
        let mut to_address = [0u8; 20];
        reader.read_exact(&mut to_address)?;
        Ok(UnshieldStoredEvent {
            txid,
            token,
            to_address,
            amount: reader.read_u128::<LittleEndian>()?,
            fee: reader.read_u128::<LittleEndian>()?,
            block_number: reader.read_u64::<LittleEndian>()?,
            event_log_index: Optional::read(&mut reader, |r| r.read_u64::<LittleEndian>())?,
            railgun_txid: Optional::read(&mut reader, |r| MerkleHash::read(r))?,
            timestamp: Optional::read(&mut reader, |r| r.read_u64::<LittleEndian>())?,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.txid.write(&mut writer)?;
        self.token.write(&mut writer)?;
        writer.write_all(&self.to_address)?;
        writer.write_u128::<LittleEndian>(self.amount)?;
        writer.write_u128::<LittleEndian>(self.fee)?;
        writer.write_u64::<LittleEndian>(self.block_number)?;
        Optional::write(&mut writer, self.event_log_index, |w, i| {
            w.write_u64::<LittleEndian>(i)
        })?;
        Optional::write(&mut writer, self.railgun_txid, |w, h| h.write(w))?;
        Optional::write(&mut writer, self.timestamp, |w, t| {
            w.write_u64::<LittleEndian>(t)
        })
    }
}

/// Unshield output of a railgun transaction, as carried in calldata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnshieldPreimage {
    pub to_address: [u8; 20],
    pub token: TokenData,
    pub value: u128,
}

/// One proof verified transaction as delivered by the txid indexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RailgunTransaction {
    pub version: TxidVersion,
    /// Indexer cursor. The next fetch starts after the latest stored id.
    pub graph_id: String,
    pub nullifiers: Vec<MerkleHash>,
    /// Standard outputs, followed by the unshield commitment if `unshield` is set.
    pub commitments: Vec<MerkleHash>,
    pub bound_params_hash: MerkleHash,
    pub unshield: Option<UnshieldPreimage>,
    pub txid: Txid,
    pub utxo_tree_in: u32,
    pub utxo_tree_out: u32,
    pub utxo_batch_start_position_out: u64,
    pub block_number: u64,
    pub timestamp: u64,
    /// `None` for V3 transactions, which are not hash chained.
    pub verification_hash: Option<MerkleHash>,
}

impl RailgunTransaction {
    /// Commitments that land in the UTXO tree, excluding a trailing unshield commitment.
    pub fn standard_commitments(&self) -> &[MerkleHash] {
        match self.unshield {
            Some(_) if !self.commitments.is_empty() => {
                &self.commitments[..self.commitments.len() - 1]
            }
            _ => &self.commitments,
        }
    }

    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = TxidVersion::from_u8(reader.read_u8()?)?;
        let graph_id_bytes = read_bytes(&mut reader)?;
        let graph_id = String::from_utf8(graph_id_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let nullifiers = Vector::read(&mut reader, |r| MerkleHash::read(r))?;
        let commitments = Vector::read(&mut reader, |r| MerkleHash::read(r))?;
        let bound_params_hash = MerkleHash::read(&mut reader)?;
        let unshield = Optional::read(&mut reader, |r| {
            let mut to_address = [0u8; 20];
            r.read_exact(&mut to_address)?;
            let token = TokenData::read(&mut *r)?;
            let value = r.read_u128::<LittleEndian>()?;
            Ok(UnshieldPreimage {
                to_address,
                token,
                value,
            })
        })?;
        Ok(RailgunTransaction {
            version,
            graph_id,
            nullifiers,
            commitments,
            bound_params_hash,
            unshield,
            txid: MerkleHash::read(&mut reader)?,
            utxo_tree_in: reader.read_u32::<LittleEndian>()?,
            utxo_tree_out: reader.read_u32::<LittleEndian>()?,
            utxo_batch_start_position_out: reader.read_u64::<LittleEndian>()?,
            block_number: reader.read_u64::<LittleEndian>()?,
            timestamp: reader.read_u64::<LittleEndian>()?,
            verification_hash: Optional::read(&mut reader, |r| MerkleHash::read(r))?,
        })
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.version.as_u8())?;
        write_bytes(&mut writer, self.graph_id.as_bytes())?;
        Vector::write(&mut writer, &self.nullifiers, |w, n| n.write(w))?;
        Vector::write(&mut writer, &self.commitments, |w, c| c.write(w))?;
        self.bound_params_hash.write(&mut writer)?;
        Optional::write(&mut writer, self.unshield.as_ref(), |w, u| {
            w.write_all(&u.to_address)?;
            u.token.write(&mut *w)?;
            w.write_u128::<LittleEndian>(u.value)
        })?;
        self.txid.write(&mut writer)?;
        writer.write_u32::<LittleEndian>(self.utxo_tree_in)?;
        writer.write_u32::<LittleEndian>(self.utxo_tree_out)?;
        writer.write_u64::<LittleEndian>(self.utxo_batch_start_position_out)?;
        writer.write_u64::<LittleEndian>(self.block_number)?;
        writer.write_u64::<LittleEndian>(self.timestamp)?;
        Optional::write(&mut writer, self.verification_hash, |w, h| h.write(w))
    }
}

/// A leaf of the txid tree: a railgun transaction with its derived hashes.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct RailgunTransactionWithHash {
    #[getset(get = "pub")]
    transaction: RailgunTransaction,
    #[getset(get_copy = "pub")]
    railgun_txid: MerkleHash,
    #[getset(get_copy = "pub")]
    hash: MerkleHash,
}

impl RailgunTransactionWithHash {
    pub fn serialized_version() -> u64 {
        1
    }

    /// Derives the railgun txid and leaf hash. `utxo_tree_capacity` linearises the output position.
    pub fn new(transaction: RailgunTransaction, utxo_tree_capacity: u64) -> Self {
        let railgun_txid = railgun_txid(
            &transaction.nullifiers,
            &transaction.commitments,
            &transaction.bound_params_hash,
        );
        let global_position_out = global_utxo_position(
            transaction.utxo_tree_out,
            transaction.utxo_batch_start_position_out,
            utxo_tree_capacity,
        );
        let hash = railgun_txid_leaf_hash(
            &railgun_txid,
            transaction.utxo_tree_in,
            global_position_out,
        );
        RailgunTransactionWithHash {
            transaction,
            railgun_txid,
            hash,
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let _version = reader.read_u64::<LittleEndian>()?;
        let transaction = RailgunTransaction::read(&mut reader)?;
        let railgun_txid = MerkleHash::read(&mut reader)?;
        let hash = MerkleHash::read(&mut reader)?;
        Ok(RailgunTransactionWithHash {
            transaction,
            railgun_txid,
            hash,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(Self::serialized_version())?;
        self.transaction.write(&mut writer)?;
        self.railgun_txid.write(&mut writer)?;
        self.hash.write(&mut writer)
    }
}

/// Linearises a `(tree, index)` pair of the UTXO tree.
pub fn global_utxo_position(tree: u32, index: u64, capacity: u64) -> u64 {
    tree as u64 * capacity + index
}

/// A contiguous run of commitments inserted by one contract call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentEvent {
    pub tree_number: u32,
    pub start_position: u64,
    pub commitments: Vec<Commitment>,
    pub block_number: u64,
}

/// Everything the bulk indexer returns for one quick sync.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuickSyncEvents {
    pub commitment_events: Vec<CommitmentEvent>,
    pub nullifier_events: Vec<Nullifier>,
    pub unshield_events: Vec<UnshieldStoredEvent>,
    /// Only delivered for V3, where transactions are emitted by the accumulator contract.
    pub railgun_transaction_events: Option<Vec<RailgunTransaction>>,
}

/// Events delivered by a slow sync source through its channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    Commitments(Vec<CommitmentEvent>),
    Nullifiers(Vec<Nullifier>),
    Unshields(Vec<UnshieldStoredEvent>),
    RailgunTransactions(Vec<RailgunTransaction>),
    /// Every event up to and including this block has been sent.
    BlockSynced(u64),
}

/// Which of the two trees a progress event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanKind {
    Utxo,
    Txid,
}

/// Progress event emitted by the engine.
#[derive(Clone, Copy, Debug, PartialEq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ScanProgress {
    chain: Chain,
    txid_version: TxidVersion,
    kind: ScanKind,
    progress: f64,
    status: MerkletreeScanStatus,
}

impl ScanProgress {
    pub fn from_parts(
        chain: Chain,
        txid_version: TxidVersion,
        kind: ScanKind,
        progress: f64,
        status: MerkletreeScanStatus,
    ) -> Self {
        ScanProgress {
            chain,
            txid_version,
            kind,
            progress,
            status,
        }
    }
}

fn read_bytes<R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    Vector::read(&mut reader, |r| r.read_u8())
}

fn write_bytes<W: Write>(mut writer: W, bytes: &[u8]) -> io::Result<()> {
    Vector::write(&mut writer, bytes, |w, byte| w.write_u8(*byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transact(tree: u32, index: u64) -> Commitment {
        Commitment {
            hash: MerkleHash::from_u64(index + 1),
            txid: MerkleHash::from_u64(99),
            block_number: Some(10),
            timestamp: None,
            utxo_tree: tree,
            utxo_index: index,
            kind: CommitmentKind::Transact {
                ciphertext: vec![1, 2, 3],
                railgun_txid: None,
            },
        }
    }

    #[test]
    fn only_transact_commitments_take_a_railgun_txid() {
        let mut commitment = transact(0, 0);
        assert!(commitment.set_railgun_txid(MerkleHash::from_u64(5)));
        assert!(!commitment.set_railgun_txid(MerkleHash::from_u64(5)));
        assert_eq!(commitment.railgun_txid(), Some(MerkleHash::from_u64(5)));

        let mut legacy = Commitment {
            kind: CommitmentKind::LegacyEncrypted {
                ciphertext: vec![9],
            },
            ..transact(0, 1)
        };
        assert!(!legacy.set_railgun_txid(MerkleHash::from_u64(5)));
        assert_eq!(legacy.railgun_txid(), None);
    }

    #[test]
    fn read_write_legacy_generated_commitment() {
        let commitment = Commitment {
            block_number: None,
            kind: CommitmentKind::LegacyGenerated {
                preimage: CommitmentPreimage {
                    npk: MerkleHash::from_u64(3),
                    token: TokenData::erc20([7u8; 20]),
                    value: 1_000_000,
                },
                encrypted_random: vec![4; 16],
            },
            ..transact(1, 4)
        };
        let mut buffer = Vec::new();
        commitment.write(&mut buffer).unwrap();
        assert_eq!(Commitment::read(&buffer[..]).unwrap(), commitment);
    }

    #[test]
    fn erc20_token_hash_is_padded_address() {
        let token = TokenData::erc20([0xab; 20]);
        let hash = token.token_hash();
        assert!(hash.0[..12].iter().all(|byte| *byte == 0));
        assert_eq!(&hash.0[12..], &[0xab; 20]);

        let nft = TokenData {
            token_type: TokenType::Erc721,
            token_address: [0xab; 20],
            token_sub_id: MerkleHash::from_u64(1),
        };
        assert_ne!(nft.token_hash(), hash);
    }

    #[test]
    fn standard_commitments_drop_unshield_output() {
        let transaction = RailgunTransaction {
            version: TxidVersion::V2PoseidonMerkle,
            graph_id: "0x01".to_string(),
            nullifiers: vec![MerkleHash::from_u64(1)],
            commitments: vec![MerkleHash::from_u64(2), MerkleHash::from_u64(3)],
            bound_params_hash: MerkleHash::ZERO,
            unshield: Some(UnshieldPreimage {
                to_address: [1u8; 20],
                token: TokenData::erc20([2u8; 20]),
                value: 100,
            }),
            txid: MerkleHash::from_u64(10),
            utxo_tree_in: 0,
            utxo_tree_out: 0,
            utxo_batch_start_position_out: 4,
            block_number: 1,
            timestamp: 1,
            verification_hash: None,
        };
        assert_eq!(
            transaction.standard_commitments(),
            &[MerkleHash::from_u64(2)]
        );
        let with_hash = RailgunTransactionWithHash::new(transaction, 16);
        let mut buffer = Vec::new();
        with_hash.write(&mut buffer).unwrap();
        assert_eq!(
            RailgunTransactionWithHash::read(&buffer[..]).unwrap(),
            with_hash
        );
    }

    #[test]
    fn global_position_linearises_trees() {
        assert_eq!(global_utxo_position(0, 3, 16), 3);
        assert_eq!(global_utxo_position(2, 3, 16), 35);
    }
}
