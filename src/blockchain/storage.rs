use std::collections::HashMap;
use std::path::Path;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::session::Session;
use super::wallet::Wallet;

const WALLETS_KEY: &str = "wallets";
const SESSIONS_KEY: &str = "sessions";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Key-value persistence for blocks, wallets and sessions
pub struct Storage {
    /// The database instance
    db: Db,

    /// One JSON record per block, keyed `block_<index>`
    blocks: Tree,

    /// Wallet collection and session map, each a single JSON document
    state: Tree,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish()
    }
}

impl Storage {
    /// Opens (or creates) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// A database that lives only as long as this handle
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let state = db.open_tree("state")?;
        Ok(Self { db, blocks, state })
    }

    fn block_key(index: u64) -> String {
        format!("block_{}", index)
    }

    /// Writes a block record and flushes it to disk
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = encode(block)?;
        self.blocks.insert(Self::block_key(block.index), value)?;
        self.flush()
    }

    /// Loads every stored block, sorted by numeric index
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();

        for result in self.blocks.iter() {
            let (key, value) = result?;
            let block: Block = decode(&value).map_err(|e| {
                StorageError::DeserializationError(format!(
                    "{}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ))
            })?;
            blocks.push(block);
        }

        // keys sort lexically (block_10 < block_2), so order by the index itself
        blocks.sort_by_key(|block| block.index);
        Ok(blocks)
    }

    /// Replaces the stored wallet collection
    pub fn save_wallets(&self, wallets: &[Wallet]) -> Result<(), StorageError> {
        self.state.insert(WALLETS_KEY, encode(&wallets)?)?;
        self.flush()
    }

    pub fn load_wallets(&self) -> Result<Vec<Wallet>, StorageError> {
        self.load_state(WALLETS_KEY)
    }

    /// Replaces the stored session map
    pub fn save_sessions(&self, sessions: &HashMap<String, Session>) -> Result<(), StorageError> {
        self.state.insert(SESSIONS_KEY, encode(sessions)?)?;
        self.flush()
    }

    pub fn load_sessions(&self) -> Result<HashMap<String, Session>, StorageError> {
        self.load_state(SESSIONS_KEY)
    }

    fn load_state<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StorageError> {
        match self.state.get(key)? {
            Some(value) => decode(&value),
            None => {
                warn!("No stored {} found, starting empty", key);
                Ok(T::default())
            }
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}
