use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{error, info};

use super::block::{Block, GENESIS_PREVIOUS_HASH};
use super::chain::BlockchainError;
use super::crypto::Address;
use super::storage::Storage;
use super::transaction::Transaction;

/// The append-only, hash-linked sequence of blocks
#[derive(Debug)]
pub struct Ledger {
    blocks: Vec<Block>,

    /// Leading zero hex digits every non-genesis hash must carry
    difficulty: usize,

    /// Digests of every transfer already in a block
    confirmed: HashSet<String>,

    storage: Arc<Storage>,
}

impl Ledger {
    /// Starts a fresh chain with the genesis block, persisting it
    pub fn genesis(storage: Arc<Storage>, difficulty: usize) -> Result<Self, BlockchainError> {
        let genesis = Block::genesis();
        storage.save_block(&genesis)?;
        info!("Created genesis block {}", genesis.hash);

        Ok(Ledger {
            blocks: vec![genesis],
            difficulty,
            confirmed: HashSet::new(),
            storage,
        })
    }

    /// Rebuilds the chain from persisted blocks.
    ///
    /// # Returns
    ///
    /// `None` when nothing was stored yet. A stored chain that fails
    /// validation is an error, it is never repaired.
    pub fn load(storage: Arc<Storage>, difficulty: usize) -> Result<Option<Self>, BlockchainError> {
        let blocks = storage.load_blocks()?;
        if blocks.is_empty() {
            return Ok(None);
        }

        let confirmed = blocks.iter().flat_map(confirmed_digests).collect();
        let ledger = Ledger {
            blocks,
            difficulty,
            confirmed,
            storage,
        };
        if let Err(err) = ledger.validate() {
            error!("Stored chain failed validation: {}", err);
            return Err(err);
        }

        info!("Loaded {} blocks from storage", ledger.blocks.len());
        Ok(Some(ledger))
    }

    /// Loads the stored chain, or creates genesis if there is none
    pub fn open(storage: Arc<Storage>, difficulty: usize) -> Result<Self, BlockchainError> {
        match Self::load(storage.clone(), difficulty)? {
            Some(ledger) => Ok(ledger),
            None => Self::genesis(storage, difficulty),
        }
    }

    pub fn latest(&self) -> Result<&Block, BlockchainError> {
        self.blocks.last().ok_or(BlockchainError::EmptyChain)
    }

    /// Persists `block`, then pushes it.
    ///
    /// The block must extend the current head and carry a correct,
    /// difficulty-meeting hash; anything else is a `ChainIntegrity` error.
    pub fn append(&mut self, block: Block) -> Result<(), BlockchainError> {
        let latest = self.latest()?;

        if block.index != latest.index + 1 {
            return Err(integrity(format!(
                "block index {} does not follow head {}",
                block.index, latest.index
            )));
        }
        if block.previous_hash != latest.hash {
            return Err(integrity(format!(
                "block {} links to {} but head is {}",
                block.index, block.previous_hash, latest.hash
            )));
        }
        if !block.has_valid_hash() {
            return Err(integrity(format!("block {} hash does not match its contents", block.index)));
        }
        if !block.meets_difficulty(self.difficulty) {
            return Err(integrity(format!(
                "block {} hash {} misses difficulty {}",
                block.index, block.hash, self.difficulty
            )));
        }

        self.storage.save_block(&block)?;
        self.confirmed.extend(confirmed_digests(&block));
        self.blocks.push(block);
        Ok(())
    }

    /// Whether a transfer with the same sender and signed payload is already in a block
    pub fn is_confirmed(&self, transaction: &Transaction) -> bool {
        self.confirmed.contains(&transaction.digest())
    }

    /// Checks the whole chain: genesis shape, sequential indices, linkage,
    /// hash recomputation and difficulty.
    pub fn validate(&self) -> Result<(), BlockchainError> {
        let genesis = self.blocks.first().ok_or(BlockchainError::EmptyChain)?;
        if genesis.index != 0 || genesis.previous_hash != GENESIS_PREVIOUS_HASH {
            return Err(integrity("first block is not a genesis block".to_string()));
        }
        if !genesis.has_valid_hash() {
            return Err(integrity("genesis hash does not match its contents".to_string()));
        }

        for pair in self.blocks.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);

            if current.index != previous.index + 1 {
                return Err(integrity(format!(
                    "index gap between {} and {}",
                    previous.index, current.index
                )));
            }
            if current.previous_hash != previous.hash {
                return Err(integrity(format!("block {} is not linked to its parent", current.index)));
            }
            if !current.has_valid_hash() {
                return Err(integrity(format!("block {} hash does not match its contents", current.index)));
            }
            if !current.meets_difficulty(self.difficulty) {
                return Err(integrity(format!("block {} misses difficulty", current.index)));
            }
        }

        Ok(())
    }

    /// Balances obtained by replaying every transaction in the chain.
    ///
    /// This is the single source of truth; the wallet cache is initialised
    /// and audited against it.
    pub fn replay_balances(&self) -> Result<HashMap<Address, u64>, BlockchainError> {
        let mut totals: HashMap<Address, i128> = HashMap::new();

        for block in &self.blocks {
            for tx in &block.transactions {
                *totals.entry(tx.to.clone()).or_insert(0) += i128::from(tx.amount);
                if let Some(from) = &tx.from {
                    *totals.entry(from.clone()).or_insert(0) -= i128::from(tx.amount);
                }
            }
        }

        totals
            .into_iter()
            .map(|(address, total)| {
                u64::try_from(total)
                    .map(|balance| (address.clone(), balance))
                    .map_err(|_| integrity(format!("replayed balance of {} is {}", address, total)))
            })
            .collect()
    }

    /// Replayed balance of a single address
    pub fn balance_of(&self, address: &Address) -> Result<u64, BlockchainError> {
        Ok(self.replay_balances()?.get(address).copied().unwrap_or(0))
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

fn integrity(message: String) -> BlockchainError {
    BlockchainError::ChainIntegrity(message)
}

fn confirmed_digests(block: &Block) -> impl Iterator<Item = String> + '_ {
    block
        .transactions
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .map(Transaction::digest)
}
