// Blockchain module
//
// Core of the node:
// - Cryptographic primitives (secp256k1, SHA-256)
// - Transactions and blocks
// - Proof of work search
// - Ledger (hash-linked chain) and balance replay
// - Mempool, wallet registry and session store
// - Persistence
// - Mining orchestration and the background miner

pub mod block;
pub mod chain;
pub mod crypto;
pub mod ledger;
pub mod mempool;
pub mod miner;
pub mod session;
pub mod storage;
pub mod transaction;
pub mod wallet;
pub mod worker;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, ChainSettings};
pub use crypto::Address;
pub use storage::Storage;
pub use transaction::Transaction;
pub use worker::{spawn_miner, spawn_ticker, MiningHandle};
