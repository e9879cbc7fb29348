//! Persistence of trees, sync cursors and history schema versions.
//!
//! Trees are stored one leaf per key, next to a small meta entry holding tree lengths and
//! validity. Writing a batch only touches the leaves and log entries it changed, then the meta.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use railgun_config::Chain;

use crate::merkletree::txid::{TxidChanges, TxidMerkletree, TxidMeta};
use crate::merkletree::utxo::{UtxoChanges, UtxoMerkletree, UtxoMeta};
use crate::merkletree::Merkletree;
use crate::primitives::{
    Commitment, Nullifier, RailgunTransactionWithHash, TxidVersion, UnshieldStoredEvent,
};

/// Errors associated with reading or writing the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying read/write failed or stored bytes did not decode
    #[error("Io error. {0}")]
    Io(#[from] io::Error),
    /// The meta of a tree refers to an entry that is not stored
    #[error("Missing stored entry {0:?}")]
    Missing(StoreKey),
    /// A writer panicked while holding the store lock
    #[error("Store lock poisoned")]
    Poisoned,
    /// A blocking store task panicked or was cancelled
    #[error("Store task failed. {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Logical location of one stored item.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    UtxoMeta(Chain, TxidVersion),
    /// `(chain, version, tree, position)`
    UtxoLeaf(Chain, TxidVersion, u32, u64),
    /// Entry of the nullifier log
    Nullifier(Chain, TxidVersion, u64),
    /// Entry of the unshield log
    Unshield(Chain, TxidVersion, u64),
    TxidMeta(Chain, TxidVersion),
    /// `(chain, version, tree, index)`
    TxidLeaf(Chain, TxidVersion, u32, u64),
    LastSyncedBlock(Chain, TxidVersion),
    UtxoHistoryVersion(Chain),
    TxidHistoryVersion(Chain),
}

impl StoreKey {
    /// File name used by [`FileStore`]
    pub fn file_name(&self) -> String {
        match self {
            StoreKey::UtxoMeta(chain, version) => {
                format!("utxo-{}-{}-{}.dat", chain.chain_type, chain.id, version.as_u8())
            }
            StoreKey::UtxoLeaf(chain, version, tree, position) => format!(
                "utxo-leaf-{}-{}-{}-{}-{}.dat",
                chain.chain_type,
                chain.id,
                version.as_u8(),
                tree,
                position
            ),
            StoreKey::Nullifier(chain, version, index) => format!(
                "nullifier-{}-{}-{}-{}.dat",
                chain.chain_type,
                chain.id,
                version.as_u8(),
                index
            ),
            StoreKey::Unshield(chain, version, index) => format!(
                "unshield-{}-{}-{}-{}.dat",
                chain.chain_type,
                chain.id,
                version.as_u8(),
                index
            ),
            StoreKey::TxidMeta(chain, version) => {
                format!("txid-{}-{}-{}.dat", chain.chain_type, chain.id, version.as_u8())
            }
            StoreKey::TxidLeaf(chain, version, tree, index) => format!(
                "txid-leaf-{}-{}-{}-{}-{}.dat",
                chain.chain_type,
                chain.id,
                version.as_u8(),
                tree,
                index
            ),
            StoreKey::LastSyncedBlock(chain, version) => format!(
                "last-synced-{}-{}-{}.dat",
                chain.chain_type,
                chain.id,
                version.as_u8()
            ),
            StoreKey::UtxoHistoryVersion(chain) => {
                format!("utxo-history-version-{}-{}.dat", chain.chain_type, chain.id)
            }
            StoreKey::TxidHistoryVersion(chain) => {
                format!("txid-history-version-{}-{}.dat", chain.chain_type, chain.id)
            }
        }
    }
}

/// Byte store backing the engine. Typed accessors are provided on top of `get`/`put`/`delete`.
pub trait EngineStore: Send + Sync {
    /// Returns the stored bytes, or `None` if nothing is stored under `key`
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value
    fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError>;

    /// Removes `key`. Removing a missing key is not an error
    fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;

    /// Loads a stored UTXO tree with its side tables
    fn load_utxo_merkletree(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<Option<UtxoMerkletree>, StoreError> {
        let Some(bytes) = self.get(&StoreKey::UtxoMeta(chain, txid_version))? else {
            return Ok(None);
        };
        let meta = UtxoMeta::read(&bytes[..])?;
        let merkletree = Merkletree::from_layout(meta.layout(), |tree, position| {
            self.get_entry(
                &StoreKey::UtxoLeaf(chain, txid_version, tree, position),
                |bytes| Commitment::read(bytes),
            )
        })?;
        let nullifiers = (0..meta.nullifier_log_len())
            .map(|index| {
                self.get_entry(&StoreKey::Nullifier(chain, txid_version, index), |bytes| {
                    Nullifier::read(bytes)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let unshields = (0..meta.unshield_log_len())
            .map(|index| {
                self.get_entry(&StoreKey::Unshield(chain, txid_version, index), |bytes| {
                    UnshieldStoredEvent::read(bytes)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(UtxoMerkletree::from_stored(
            chain,
            txid_version,
            merkletree,
            nullifiers,
            unshields,
        )))
    }

    /// Writes the leaves and log entries in `changes`, then the tree meta
    fn write_utxo_changes(&self, changes: &UtxoChanges) -> Result<(), StoreError> {
        let (chain, version) = (changes.chain(), changes.txid_version());
        for stored in changes.leaves() {
            self.put_entry(
                &StoreKey::UtxoLeaf(chain, version, stored.tree(), stored.position()),
                |w| stored.leaf().write(w),
            )?;
        }
        for (index, nullifier) in changes.nullifiers() {
            self.put_entry(&StoreKey::Nullifier(chain, version, *index), |w| {
                nullifier.write(w)
            })?;
        }
        for (index, unshield) in changes.unshields() {
            self.put_entry(&StoreKey::Unshield(chain, version, *index), |w| {
                unshield.write(w)
            })?;
        }
        // meta last, so it never counts an entry that was not written
        self.put_entry(&StoreKey::UtxoMeta(chain, version), |w| {
            changes.meta().write(w)
        })
    }

    /// Loads a stored txid tree
    fn load_txid_merkletree(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<Option<TxidMerkletree>, StoreError> {
        let Some(bytes) = self.get(&StoreKey::TxidMeta(chain, txid_version))? else {
            return Ok(None);
        };
        let meta = TxidMeta::read(&bytes[..])?;
        let merkletree = Merkletree::from_layout(meta.layout(), |tree, index| {
            self.get_entry(&StoreKey::TxidLeaf(chain, txid_version, tree, index), |bytes| {
                RailgunTransactionWithHash::read(bytes)
            })
        })?;
        Ok(Some(TxidMerkletree::from_stored(
            chain,
            txid_version,
            merkletree,
            meta.utxo_tree_capacity(),
        )))
    }

    /// Writes the transactions in `changes`, then the tree meta
    fn write_txid_changes(&self, changes: &TxidChanges) -> Result<(), StoreError> {
        let (chain, version) = (changes.chain(), changes.txid_version());
        for stored in changes.leaves() {
            self.put_entry(
                &StoreKey::TxidLeaf(chain, version, stored.tree(), stored.position()),
                |w| stored.leaf().write(w),
            )?;
        }
        self.put_entry(&StoreKey::TxidMeta(chain, version), |w| {
            changes.meta().write(w)
        })
    }

    /// Slow sync cursor
    fn get_last_synced_block(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<Option<u64>, StoreError> {
        self.get_u64(&StoreKey::LastSyncedBlock(chain, txid_version))
    }

    /// Advances the slow sync cursor
    fn set_last_synced_block(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        block: u64,
    ) -> Result<(), StoreError> {
        self.put_u64(&StoreKey::LastSyncedBlock(chain, txid_version), block)
    }

    /// History schema version of the UTXO trees of `chain`
    fn get_utxo_history_version(&self, chain: Chain) -> Result<Option<u64>, StoreError> {
        self.get_u64(&StoreKey::UtxoHistoryVersion(chain))
    }

    /// Records the UTXO history schema version of `chain`
    fn set_utxo_history_version(&self, chain: Chain, version: u64) -> Result<(), StoreError> {
        self.put_u64(&StoreKey::UtxoHistoryVersion(chain), version)
    }

    /// History schema version of the txid trees of `chain`
    fn get_txid_history_version(&self, chain: Chain) -> Result<Option<u64>, StoreError> {
        self.get_u64(&StoreKey::TxidHistoryVersion(chain))
    }

    /// Records the txid history schema version of `chain`
    fn set_txid_history_version(&self, chain: Chain, version: u64) -> Result<(), StoreError> {
        self.put_u64(&StoreKey::TxidHistoryVersion(chain), version)
    }

    /// Reads a little endian u64
    fn get_u64(&self, key: &StoreKey) -> Result<Option<u64>, StoreError> {
        match self.get(key)? {
            Some(bytes) if bytes.len() == 8 => Ok(Some(LittleEndian::read_u64(&bytes))),
            Some(_) => Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                format!("{:?} is not a u64", key),
            ))),
            None => Ok(None),
        }
    }

    /// Writes a little endian u64
    fn put_u64(&self, key: &StoreKey, value: u64) -> Result<(), StoreError> {
        let mut bytes = vec![0u8; 8];
        LittleEndian::write_u64(&mut bytes, value);
        self.put(key, bytes)
    }

    /// Decodes an entry that must be present
    fn get_entry<T, F>(&self, key: &StoreKey, read: F) -> Result<T, StoreError>
    where
        F: FnOnce(&[u8]) -> io::Result<T>,
    {
        let bytes = self.get(key)?.ok_or(StoreError::Missing(*key))?;
        Ok(read(&bytes)?)
    }

    /// Encodes and stores an entry
    fn put_entry<F>(&self, key: &StoreKey, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
    {
        let mut bytes = Vec::new();
        write(&mut bytes)?;
        self.put(key, bytes)
    }
}

/// In memory store, for tests and ephemeral engines
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineStore for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(*key, value);
        Ok(())
    }

    fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per [`StoreKey`] in a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens a store in `dir`, creating it if needed
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(FileStore {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, key: &StoreKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl EngineStore for FileStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path(key);
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value)?;
        std::fs::rename(tmp_path, path)?;
        Ok(())
    }

    fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
