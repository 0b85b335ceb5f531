use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use thiserror::Error;

use super::block::Block;
use super::crypto::{Address, KeyPair};
use super::ledger::Ledger;
use super::mempool::Mempool;
use super::miner::{self, MiningError, SearchLimits};
use super::session::{SessionError, SessionStore, DEFAULT_SESSION_TTL_SECS};
use super::storage::{Storage, StorageError};
use super::transaction::{Transaction, TransactionError};
use super::wallet::{Wallet, WalletError, WalletRegistry};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Wallet error: {0}")]
    WalletError(#[from] WalletError),

    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("Persistence error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Chain is empty")]
    EmptyChain,

    #[error("Chain integrity violated: {0}")]
    ChainIntegrity(String),

    #[error("Mining failed: {0}")]
    MiningFailure(#[from] MiningError),

    #[error("Balance of {address} diverged: cached {cached} + pending {pending}, replayed {replayed}")]
    BalanceDivergence {
        address: Address,
        cached: u64,
        pending: u64,
        replayed: u64,
    },

    #[error("System error: {0}")]
    SystemError(String),
}

/// Consensus and session parameters
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Leading zero hex digits required in a block hash
    pub difficulty: usize,

    /// Coinbase amount per mined block
    pub block_reward: u64,

    pub session_ttl_secs: i64,

    /// Upper bound for one proof-of-work search, `None` for unbounded
    pub max_mining_time: Option<Duration>,
}

impl Default for ChainSettings {
    fn default() -> Self {
        ChainSettings {
            difficulty: 2,
            block_reward: 50,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_mining_time: Some(Duration::from_secs(30)),
        }
    }
}

/// Handle owning every aggregate of the node.
///
/// Locks are always taken in the order wallets → mempool → ledger.
#[derive(Debug)]
pub struct Blockchain {
    ledger: RwLock<Ledger>,

    /// Admitted transactions waiting for the next block
    mempool: Mutex<Mempool>,

    /// Balance cache, key material and the owner flag
    wallets: Mutex<WalletRegistry>,

    sessions: SessionStore,

    /// Serialises session mutation with the write of the resulting snapshot
    session_writes: Mutex<()>,

    storage: Arc<Storage>,

    /// Held for the whole drain → mine → append cycle
    mining: Mutex<()>,

    settings: ChainSettings,

    owner: Address,
}

impl Blockchain {
    /// Opens the node state from `storage`.
    ///
    /// Loads the chain (or creates genesis), rebuilds every cached balance
    /// by replay, makes sure an owner wallet exists and drops expired sessions.
    pub fn open(storage: Storage, settings: ChainSettings) -> Result<Self, BlockchainError> {
        let storage = Arc::new(storage);
        let ledger = Ledger::open(storage.clone(), settings.difficulty)?;

        let mut wallets = WalletRegistry::from_wallets(storage.load_wallets()?);
        wallets.reset_balances(&ledger.replay_balances()?);
        info!("Rebuilt wallet balances from {} blocks", ledger.len());

        let (owner, created) = wallets.ensure_owner();
        if created {
            info!("Created owner wallet {}", owner);
        }
        storage.save_wallets(&wallets.wallets())?;

        let sessions =
            SessionStore::from_sessions(storage.load_sessions()?, settings.session_ttl_secs);
        let purged = sessions.purge_expired(Utc::now());
        if purged > 0 {
            info!("Dropped {} expired sessions", purged);
        }
        storage.save_sessions(&sessions.snapshot())?;

        Ok(Blockchain {
            ledger: RwLock::new(ledger),
            mempool: Mutex::new(Mempool::new()),
            wallets: Mutex::new(wallets),
            sessions,
            session_writes: Mutex::new(()),
            storage,
            mining: Mutex::new(()),
            settings,
            owner,
        })
    }

    /// A node backed by a throwaway database
    pub fn temporary(settings: ChainSettings) -> Result<Self, BlockchainError> {
        Self::open(Storage::temporary()?, settings)
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Address of the node's mining beneficiary
    pub fn owner_address(&self) -> &Address {
        &self.owner
    }

    /// Validates a transaction and moves it into the mempool.
    ///
    /// The sender is debited here, before mining, so a second transfer
    /// cannot spend the same unconfirmed balance. Recipients are credited
    /// when the block is mined. Every check runs before any mutation.
    pub fn add_transaction(&self, transaction: Transaction) -> Result<(), BlockchainError> {
        let from = match &transaction.from {
            Some(from) => from.clone(),
            None => return Err(TransactionError::CoinbaseRejected.into()),
        };
        if transaction.amount == 0 {
            return Err(TransactionError::InvalidAmount("amount must be positive".to_string()).into());
        }
        transaction
            .to
            .to_public_key()
            .map_err(|e| TransactionError::InvalidRecipientAddress(e.to_string()))?;

        let mut wallets = lock(&self.wallets)?;

        if !wallets.contains(&from) {
            return Err(TransactionError::UnknownSender(from.to_string()).into());
        }
        let available = wallets.balance(&from);

        transaction.verify_signature()?;

        if available < transaction.amount {
            return Err(TransactionError::InsufficientBalance {
                required: transaction.amount,
                available,
            }
            .into());
        }

        let mut mempool = lock(&self.mempool)?;
        if mempool.contains(&transaction) || read(&self.ledger)?.is_confirmed(&transaction) {
            return Err(TransactionError::Duplicate.into());
        }

        wallets.debit(&from, transaction.amount)?;
        if let Err(err) = self.storage.save_wallets(&wallets.wallets()) {
            error!("Failed to persist wallets, undoing debit of {}: {}", from, err);
            wallets.credit(&from, transaction.amount)?;
            return Err(err.into());
        }

        info!("Admitted transfer of {} from {} to {}", transaction.amount, from, transaction.to);
        mempool.push(transaction);
        Ok(())
    }

    /// Mines the pending transactions plus a coinbase for `miner_address`
    pub fn mine_block(&self, miner_address: &Address) -> Result<Block, BlockchainError> {
        self.mine_block_with(miner_address, None)
    }

    /// Like [`Blockchain::mine_block`], stopping early once `cancel` is set.
    ///
    /// The proof-of-work search runs without holding any aggregate lock.
    /// The staged transactions leave the mempool only after the block has
    /// been appended, so a failed attempt leaves everything pending.
    pub fn mine_block_with(
        &self,
        miner_address: &Address,
        cancel: Option<&AtomicBool>,
    ) -> Result<Block, BlockchainError> {
        let _mining = lock(&self.mining)?;

        let staged = lock(&self.mempool)?.snapshot();
        let (index, previous_hash) = {
            let ledger = read(&self.ledger)?;
            let latest = ledger.latest()?;
            (latest.index + 1, latest.hash.clone())
        };

        let mut transactions = Vec::with_capacity(staged.len() + 1);
        transactions.push(Transaction::new_coinbase(
            miner_address.clone(),
            self.settings.block_reward,
        ));
        transactions.extend(staged.iter().cloned());

        let timestamp = Utc::now().timestamp_millis();
        let limits = SearchLimits {
            cancel,
            deadline: self.settings.max_mining_time.map(|limit| Instant::now() + limit),
        };

        let started = Instant::now();
        let (nonce, hash) = miner::mine(
            index,
            timestamp,
            &transactions,
            &previous_hash,
            self.settings.difficulty,
            limits,
        )
        .map_err(|err| {
            warn!("Mining block {} failed: {}", index, err);
            err
        })?;

        let block = Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            nonce,
            hash,
        };

        let mut wallets = lock(&self.wallets)?;
        let mut mempool = lock(&self.mempool)?;
        let mut ledger = write(&self.ledger)?;

        if let Err(err) = ledger.append(block.clone()) {
            error!("Refusing to append block {}: {}", block.index, err);
            return Err(err);
        }
        mempool.commit_mined(staged.len());

        // the block is committed; a failure below only leaves the cache stale
        // until the next replay on open
        if let Err(err) = self.credit_recipients(&mut wallets, &mempool, &ledger, &block) {
            error!("Block {} appended but the wallet cache was not updated: {}", block.index, err);
        }

        info!(
            "Mined block {} ({} transactions, nonce {}) in {:?}",
            block.index,
            block.transactions.len(),
            block.nonce,
            started.elapsed()
        );
        Ok(block)
    }

    /// Credits the recipients of a freshly appended block.
    ///
    /// Senders were debited at admission. A recipient missing from the
    /// registry (never seen, or deleted) is restored from the replayed chain,
    /// which already includes `block`.
    fn credit_recipients(
        &self,
        wallets: &mut WalletRegistry,
        mempool: &Mempool,
        ledger: &Ledger,
        block: &Block,
    ) -> Result<(), BlockchainError> {
        let missing: BTreeSet<&Address> = block
            .transactions
            .iter()
            .map(|tx| &tx.to)
            .filter(|address| !wallets.contains(address))
            .collect();

        if !missing.is_empty() {
            let pending_debits = mempool.pending_debits();
            for &address in &missing {
                let replayed = ledger.balance_of(address)?;
                let pending = pending_debits.get(address).copied().unwrap_or(0);
                wallets.credit(address, replayed.saturating_sub(pending))?;
            }
        }

        for transaction in &block.transactions {
            if !missing.contains(&transaction.to) {
                wallets.credit(&transaction.to, transaction.amount)?;
            }
        }
        self.storage.save_wallets(&wallets.wallets())?;
        Ok(())
    }

    /// Checks that every registered wallet's cached balance plus its pending debits equals the replayed balance
    pub fn audit_balances(&self) -> Result<(), BlockchainError> {
        let wallets = lock(&self.wallets)?;
        let mempool = lock(&self.mempool)?;
        let ledger = read(&self.ledger)?;

        let replayed_balances = ledger.replay_balances()?;
        let pending_debits = mempool.pending_debits();

        // deleted wallets are absent until the next replay restores them as shells
        for wallet in wallets.iter() {
            let address = &wallet.address;
            let cached = wallet.balance;
            let pending = pending_debits.get(address).copied().unwrap_or(0);
            let replayed = replayed_balances.get(address).copied().unwrap_or(0);

            if cached.checked_add(pending) != Some(replayed) {
                return Err(BlockchainError::BalanceDivergence {
                    address: address.clone(),
                    cached,
                    pending,
                    replayed,
                });
            }
        }
        Ok(())
    }

    /// Full chain audit
    pub fn validate_chain(&self) -> Result<(), BlockchainError> {
        read(&self.ledger)?.validate()
    }

    pub fn get_chain(&self) -> Result<Vec<Block>, BlockchainError> {
        Ok(read(&self.ledger)?.blocks().to_vec())
    }

    pub fn get_last_block(&self) -> Result<Block, BlockchainError> {
        read(&self.ledger)?.latest().cloned()
    }

    pub fn chain_len(&self) -> Result<usize, BlockchainError> {
        Ok(read(&self.ledger)?.len())
    }

    pub fn get_pending_transactions(&self) -> Result<Vec<Transaction>, BlockchainError> {
        Ok(lock(&self.mempool)?.snapshot())
    }

    pub fn pending_count(&self) -> Result<usize, BlockchainError> {
        Ok(lock(&self.mempool)?.len())
    }

    pub fn has_pending(&self) -> Result<bool, BlockchainError> {
        Ok(!lock(&self.mempool)?.is_empty())
    }

    /// Cached spendable balance and when it last changed
    pub fn get_balance(&self, address: &Address) -> Result<(u64, DateTime<Utc>), BlockchainError> {
        let wallets = lock(&self.wallets)?;
        Ok(wallets
            .get(address)
            .map(|wallet| (wallet.balance, wallet.last_updated))
            .unwrap_or_else(|| (0, Utc::now())))
    }

    /// Registers a new wallet and opens a session for it.
    ///
    /// # Returns
    ///
    /// The generated key pair and the session token
    pub fn create_wallet(&self) -> Result<(KeyPair, String), BlockchainError> {
        let keys = {
            let mut wallets = lock(&self.wallets)?;
            let keys = wallets.create();
            self.storage.save_wallets(&wallets.wallets())?;
            keys
        };
        info!("Created wallet {}", keys.address());

        let token = self.open_session(keys.address())?;
        Ok((keys, token))
    }

    /// Logs in with a private key, returning a session token and the wallet
    pub fn login(&self, private_key: &str) -> Result<(String, Wallet), BlockchainError> {
        let wallet = lock(&self.wallets)?.find_by_private_key(private_key)?.clone();
        let token = self.open_session(&wallet.address)?;
        Ok((token, wallet))
    }

    fn open_session(&self, address: &Address) -> Result<String, BlockchainError> {
        let _writes = lock(&self.session_writes)?;
        let token = self.sessions.create(address, Utc::now());
        self.persist_sessions()?;
        Ok(token)
    }

    /// Resolves a bearer token to its wallet, renewing the session
    pub fn validate_session(&self, token: &str) -> Result<Wallet, BlockchainError> {
        let address = {
            let _writes = lock(&self.session_writes)?;
            match self.sessions.validate(token, Utc::now()) {
                // unknown token, nothing changed
                Err(SessionError::InvalidSession) => return Err(SessionError::InvalidSession.into()),
                // renewed or evicted
                result => {
                    self.persist_sessions()?;
                    result?
                }
            }
        };

        lock(&self.wallets)?
            .get(&address)
            .cloned()
            .ok_or_else(|| SessionError::InvalidSession.into())
    }

    /// Ends a session. Unknown tokens are reported as `InvalidSession`.
    pub fn logout(&self, token: &str) -> Result<(), BlockchainError> {
        let _writes = lock(&self.session_writes)?;
        if !self.sessions.revoke(token) {
            return Err(SessionError::InvalidSession.into());
        }
        self.persist_sessions()
    }

    /// Deletes the wallet behind a valid session, together with all its sessions
    pub fn delete_wallet(&self, token: &str) -> Result<Wallet, BlockchainError> {
        let address = self.validate_session(token)?.address;

        let removed = {
            let mut wallets = lock(&self.wallets)?;
            let removed = wallets.remove(&address)?;
            self.storage.save_wallets(&wallets.wallets())?;
            removed
        };

        {
            let _writes = lock(&self.session_writes)?;
            self.sessions.revoke_address(&address);
            self.persist_sessions()?;
        }
        info!("Deleted wallet {}", address);
        Ok(removed)
    }

    /// Writes the current session map. Callers hold `session_writes`.
    fn persist_sessions(&self) -> Result<(), BlockchainError> {
        self.storage.save_sessions(&self.sessions.snapshot())?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, BlockchainError> {
    mutex
        .lock()
        .map_err(|_| BlockchainError::SystemError("mutex poisoned".to_string()))
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, BlockchainError> {
    lock.read()
        .map_err(|_| BlockchainError::SystemError("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, BlockchainError> {
    lock.write()
        .map_err(|_| BlockchainError::SystemError("lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_chain() -> Blockchain {
        Blockchain::temporary(ChainSettings::default()).unwrap()
    }

    fn transfer(from: &KeyPair, to: &Address, amount: u64, timestamp: i64) -> Transaction {
        let mut transaction = Transaction::new(from.address().clone(), to.clone(), amount, timestamp);
        transaction.sign(from).unwrap();
        transaction
    }

    fn replayed(blockchain: &Blockchain, address: &Address) -> u64 {
        read(&blockchain.ledger).unwrap().balance_of(address).unwrap()
    }

    fn wallet(blockchain: &Blockchain, address: &Address) -> Option<Wallet> {
        lock(&blockchain.wallets).unwrap().get(address).cloned()
    }

    /// A registered wallet holding `reward` coins from one mined block
    fn funded_wallet(blockchain: &Blockchain) -> KeyPair {
        let (keys, _) = blockchain.create_wallet().unwrap();
        blockchain.mine_block(keys.address()).unwrap();
        keys
    }

    #[test]
    fn test_new_blockchain() {
        let blockchain = test_chain();
        let chain = blockchain.get_chain().unwrap();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index, 0);
        assert_eq!(chain[0].previous_hash, "0");

        let owner = wallet(&blockchain, blockchain.owner_address()).unwrap();
        assert!(owner.is_owner);
    }

    #[test]
    fn test_mine_empty_mempool_pays_coinbase_only() {
        let blockchain = test_chain();
        let miner = KeyPair::generate();

        let block = blockchain.mine_block(miner.address()).unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(block.transactions.len(), 1);
        let coinbase = &block.transactions[0];
        assert!(coinbase.from.is_none());
        assert_eq!(&coinbase.to, miner.address());
        assert_eq!(coinbase.amount, 50);

        assert_eq!(blockchain.get_balance(miner.address()).unwrap().0, 50);
        assert_eq!(replayed(&blockchain, miner.address()), 50);
        blockchain.audit_balances().unwrap();
    }

    #[test]
    fn test_add_transaction_and_mine() {
        let blockchain = test_chain();
        let alice = funded_wallet(&blockchain);
        let bob = KeyPair::generate();

        blockchain
            .add_transaction(transfer(&alice, bob.address(), 20, 1))
            .unwrap();

        // debited at admission, not yet credited
        assert_eq!(blockchain.get_balance(alice.address()).unwrap().0, 30);
        assert_eq!(blockchain.get_balance(bob.address()).unwrap().0, 0);
        assert_eq!(blockchain.get_pending_transactions().unwrap().len(), 1);
        blockchain.audit_balances().unwrap();

        let block = blockchain.mine_block(blockchain.owner_address()).unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert!(blockchain.get_pending_transactions().unwrap().is_empty());

        assert_eq!(blockchain.get_balance(alice.address()).unwrap().0, 30);
        assert_eq!(blockchain.get_balance(bob.address()).unwrap().0, 20);
        assert_eq!(replayed(&blockchain, bob.address()), 20);
        blockchain.audit_balances().unwrap();
        assert!(blockchain.validate_chain().is_ok());
    }

    #[test]
    fn test_double_admission_guard() {
        let settings = ChainSettings { block_reward: 10, ..ChainSettings::default() };
        let blockchain = Blockchain::temporary(settings).unwrap();
        let wallet = funded_wallet(&blockchain);
        let recipient = KeyPair::generate();

        blockchain
            .add_transaction(transfer(&wallet, recipient.address(), 8, 1))
            .unwrap();
        let second = blockchain.add_transaction(transfer(&wallet, recipient.address(), 8, 2));

        assert!(matches!(
            second,
            Err(BlockchainError::TransactionError(TransactionError::InsufficientBalance {
                required: 8,
                available: 2
            }))
        ));
        assert_eq!(blockchain.get_pending_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_tampered_transaction_is_rejected() {
        let blockchain = test_chain();
        let alice = funded_wallet(&blockchain);
        let bob = KeyPair::generate();

        let mut tampered = transfer(&alice, bob.address(), 5, 1);
        tampered.amount = 40;
        let result = blockchain.add_transaction(tampered);
        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::InvalidSignature))
        ));

        let mut redirected = transfer(&alice, bob.address(), 5, 1);
        redirected.to = KeyPair::generate().address().clone();
        assert!(matches!(
            blockchain.add_transaction(redirected),
            Err(BlockchainError::TransactionError(TransactionError::InvalidSignature))
        ));

        // rejection leaves state untouched
        assert_eq!(blockchain.get_balance(alice.address()).unwrap().0, 50);
        assert!(blockchain.get_pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_sender_is_rejected() {
        let blockchain = test_chain();
        let stranger = KeyPair::generate();
        let result =
            blockchain.add_transaction(transfer(&stranger, KeyPair::generate().address(), 1, 1));

        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::UnknownSender(_)))
        ));
    }

    #[test]
    fn test_coinbase_and_zero_amount_are_rejected() {
        let blockchain = test_chain();
        let coinbase = Transaction::new_coinbase(KeyPair::generate().address().clone(), 50);
        assert!(matches!(
            blockchain.add_transaction(coinbase),
            Err(BlockchainError::TransactionError(TransactionError::CoinbaseRejected))
        ));

        let alice = funded_wallet(&blockchain);
        let zero = transfer(&alice, KeyPair::generate().address(), 0, 1);
        assert!(matches!(
            blockchain.add_transaction(zero),
            Err(BlockchainError::TransactionError(TransactionError::InvalidAmount(_)))
        ));
    }

    #[test]
    fn test_duplicate_submission_is_rejected() {
        let blockchain = test_chain();
        let alice = funded_wallet(&blockchain);
        let transaction = transfer(&alice, KeyPair::generate().address(), 5, 1);

        blockchain.add_transaction(transaction.clone()).unwrap();
        assert!(matches!(
            blockchain.add_transaction(transaction),
            Err(BlockchainError::TransactionError(TransactionError::Duplicate))
        ));
        assert_eq!(blockchain.get_balance(alice.address()).unwrap().0, 45);
    }

    #[test]
    fn test_failed_mining_keeps_mempool() {
        let settings = ChainSettings { difficulty: 64, ..ChainSettings::default() };
        let blockchain = Blockchain::temporary(settings).unwrap();

        let cancel = AtomicBool::new(true);
        let result = blockchain.mine_block_with(blockchain.owner_address(), Some(&cancel));

        assert!(matches!(result, Err(BlockchainError::MiningFailure(_))));
        assert_eq!(blockchain.chain_len().unwrap(), 1);
    }

    #[test]
    fn test_staged_transactions_survive_failed_mining() {
        let blockchain = test_chain();
        let alice = funded_wallet(&blockchain);
        blockchain
            .add_transaction(transfer(&alice, KeyPair::generate().address(), 5, 1))
            .unwrap();

        // same aggregates, unreachable target
        let stubborn = Blockchain {
            settings: ChainSettings { difficulty: 64, ..ChainSettings::default() },
            ..blockchain
        };
        let cancel = AtomicBool::new(true);
        let result = stubborn.mine_block_with(stubborn.owner_address(), Some(&cancel));
        assert!(result.is_err());
        assert_eq!(stubborn.get_pending_transactions().unwrap().len(), 1);
        stubborn.audit_balances().unwrap();
    }

    #[test]
    fn test_concurrent_mining_never_forks() {
        let blockchain = Arc::new(test_chain());
        let miner = KeyPair::generate().address().clone();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let blockchain = blockchain.clone();
                let miner = miner.clone();
                std::thread::spawn(move || blockchain.mine_block(&miner).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(blockchain.chain_len().unwrap(), 5);
        assert!(blockchain.validate_chain().is_ok());
        assert_eq!(blockchain.get_balance(&miner).unwrap().0, 200);
        blockchain.audit_balances().unwrap();
    }

    #[test]
    fn test_reload_replays_balances() {
        let dir = tempfile::TempDir::new().unwrap();
        let alice_address;
        {
            let blockchain =
                Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default()).unwrap();
            let alice = funded_wallet(&blockchain);
            alice_address = alice.address().clone();
            blockchain
                .add_transaction(transfer(&alice, KeyPair::generate().address(), 20, 1))
                .unwrap();
            // pending transfer is lost with the process
        }

        let blockchain =
            Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default()).unwrap();
        assert_eq!(blockchain.chain_len().unwrap(), 2);
        assert_eq!(blockchain.get_balance(&alice_address).unwrap().0, 50);
        blockchain.audit_balances().unwrap();
    }

    #[test]
    fn test_owner_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let owner = {
            let blockchain =
                Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default()).unwrap();
            blockchain.owner_address().clone()
        };
        let blockchain =
            Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default()).unwrap();
        assert_eq!(blockchain.owner_address(), &owner);
    }

    #[test]
    fn test_wallet_session_lifecycle() {
        let blockchain = test_chain();
        let (keys, token) = blockchain.create_wallet().unwrap();

        let wallet = blockchain.validate_session(&token).unwrap();
        assert_eq!(&wallet.address, keys.address());

        let (login_token, wallet) = blockchain.login(&keys.private_key_hex()).unwrap();
        assert_eq!(&wallet.address, keys.address());

        blockchain.logout(&token).unwrap();
        assert!(matches!(
            blockchain.validate_session(&token),
            Err(BlockchainError::SessionError(SessionError::InvalidSession))
        ));

        blockchain.delete_wallet(&login_token).unwrap();
        assert!(self::wallet(&blockchain, keys.address()).is_none());
        assert!(blockchain.validate_session(&login_token).is_err());
        assert!(blockchain.login(&keys.private_key_hex()).is_err());
    }

    #[test]
    fn test_owner_wallet_cannot_be_deleted() {
        let blockchain = test_chain();
        let owner = wallet(&blockchain, blockchain.owner_address()).unwrap();
        let private_key = owner.private_key.unwrap();

        let (token, _) = blockchain.login(&private_key).unwrap();
        assert!(matches!(
            blockchain.delete_wallet(&token),
            Err(BlockchainError::WalletError(WalletError::OwnerUndeletable))
        ));
    }

    #[test]
    fn test_confirmed_transfer_cannot_be_resubmitted() {
        let blockchain = test_chain();
        let alice = funded_wallet(&blockchain);
        let bob = KeyPair::generate();
        let transaction = transfer(&alice, bob.address(), 20, 1);

        blockchain.add_transaction(transaction.clone()).unwrap();
        blockchain.mine_block(blockchain.owner_address()).unwrap();

        // same JSON as served by GET /blocks
        let copied = blockchain.get_chain().unwrap()[2].transactions[1].clone();
        assert_eq!(copied, transaction);
        assert!(matches!(
            blockchain.add_transaction(copied),
            Err(BlockchainError::TransactionError(TransactionError::Duplicate))
        ));

        blockchain.mine_block(blockchain.owner_address()).unwrap();
        assert_eq!(blockchain.get_balance(alice.address()).unwrap().0, 30);
        assert_eq!(blockchain.get_balance(bob.address()).unwrap().0, 20);
        blockchain.audit_balances().unwrap();
    }

    #[test]
    fn test_resubmission_rejected_after_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let (alice, transaction) = {
            let blockchain =
                Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default()).unwrap();
            let alice = funded_wallet(&blockchain);
            let transaction = transfer(&alice, KeyPair::generate().address(), 20, 1);
            blockchain.add_transaction(transaction.clone()).unwrap();
            blockchain.mine_block(blockchain.owner_address()).unwrap();
            (alice, transaction)
        };

        let blockchain =
            Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default()).unwrap();
        assert!(matches!(
            blockchain.add_transaction(transaction),
            Err(BlockchainError::TransactionError(TransactionError::Duplicate))
        ));
        assert_eq!(blockchain.get_balance(alice.address()).unwrap().0, 30);
    }

    #[test]
    fn test_credit_after_wallet_deletion_matches_replay() {
        let blockchain = test_chain();
        let (keys, token) = blockchain.create_wallet().unwrap();
        blockchain.mine_block(keys.address()).unwrap();

        blockchain.delete_wallet(&token).unwrap();
        blockchain.mine_block(keys.address()).unwrap();

        assert_eq!(blockchain.get_balance(keys.address()).unwrap().0, 100);
        assert_eq!(replayed(&blockchain, keys.address()), 100);
        blockchain.audit_balances().unwrap();
    }

    #[test]
    fn test_deleted_sender_with_pending_transfer_matches_replay() {
        let blockchain = test_chain();
        let (keys, token) = blockchain.create_wallet().unwrap();
        blockchain.mine_block(keys.address()).unwrap();
        let bob = KeyPair::generate();
        blockchain
            .add_transaction(transfer(&keys, bob.address(), 10, 1))
            .unwrap();

        blockchain.delete_wallet(&token).unwrap();
        blockchain.mine_block(keys.address()).unwrap();

        assert_eq!(blockchain.get_balance(keys.address()).unwrap().0, 90);
        assert_eq!(blockchain.get_balance(bob.address()).unwrap().0, 10);
        blockchain.audit_balances().unwrap();
    }

    #[test]
    fn test_block_is_returned_when_credit_overflows() {
        let settings = ChainSettings { block_reward: u64::MAX, ..ChainSettings::default() };
        let blockchain = Blockchain::temporary(settings).unwrap();
        let miner = KeyPair::generate();

        blockchain.mine_block(miner.address()).unwrap();
        let second = blockchain.mine_block(miner.address()).unwrap();

        assert_eq!(second.index, 2);
        assert_eq!(blockchain.chain_len().unwrap(), 3);
        assert!(blockchain.get_pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_logins_are_all_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let tokens: Vec<String> = {
            let blockchain = Arc::new(
                Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default())
                    .unwrap(),
            );
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let blockchain = blockchain.clone();
                    std::thread::spawn(move || blockchain.create_wallet().unwrap().1)
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        };

        let blockchain =
            Blockchain::open(Storage::open(dir.path()).unwrap(), ChainSettings::default()).unwrap();
        for token in &tokens {
            assert!(blockchain.validate_session(token).is_ok());
        }
    }

    #[test]
    fn test_unknown_token_leaves_stored_sessions_alone() {
        let blockchain = test_chain();
        let address = KeyPair::generate().address().clone();
        // in memory only
        let unsaved = blockchain.sessions.create(&address, Utc::now());

        assert!(matches!(
            blockchain.validate_session("not-a-token"),
            Err(BlockchainError::SessionError(SessionError::InvalidSession))
        ));
        assert!(!blockchain.storage.load_sessions().unwrap().contains_key(&unsaved));

        let (_, token) = blockchain.create_wallet().unwrap();
        blockchain.validate_session(&token).unwrap();
        let stored = blockchain.storage.load_sessions().unwrap();
        assert!(stored.contains_key(&token));
        assert!(stored.contains_key(&unsaved));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_admission_never_overdraws(
            steps in prop::collection::vec((0usize..3, 0usize..3, 1u64..80, any::<bool>()), 1..25)
        ) {
            let blockchain = test_chain();
            let wallets: Vec<KeyPair> = (0..3).map(|_| funded_wallet(&blockchain)).collect();

            for (i, (from, to, amount, mine)) in steps.into_iter().enumerate() {
                let transaction = transfer(&wallets[from], wallets[to].address(), amount, i as i64);
                let before = blockchain.get_balance(wallets[from].address()).unwrap().0;

                match blockchain.add_transaction(transaction) {
                    Ok(()) => prop_assert!(before >= amount),
                    Err(BlockchainError::TransactionError(
                        TransactionError::InsufficientBalance { .. },
                    )) => prop_assert!(before < amount),
                    Err(other) => prop_assert!(false, "unexpected rejection: {}", other),
                }

                if mine {
                    blockchain.mine_block(blockchain.owner_address()).unwrap();
                }
                blockchain.audit_balances().unwrap();
            }

            blockchain.mine_block(blockchain.owner_address()).unwrap();
            blockchain.audit_balances().unwrap();
            for wallet in &wallets {
                let cached = blockchain.get_balance(wallet.address()).unwrap().0;
                prop_assert_eq!(cached, replayed(&blockchain, wallet.address()));
            }
        }
    }
}
