use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::crypto::sha256_hex;
use super::transaction::Transaction;

/// Previous-hash sentinel carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Represents a block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Transactions in this block, coinbase first
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Proof of work
    pub nonce: u64,

    /// Hash of this block
    pub hash: String,
}

impl Block {
    /// Builds block 0. Every field is fixed so all nodes agree on its hash.
    pub fn genesis() -> Self {
        let transactions = Vec::new();
        let hash = Self::calculate_hash(0, 0, &transactions, GENESIS_PREVIOUS_HASH, 0);

        Block {
            index: 0,
            timestamp: 0,
            transactions,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            nonce: 0,
            hash,
        }
    }

    /// Calculates the SHA-256 of `index ∥ timestamp ∥ json(transactions) ∥ previous_hash ∥ nonce`
    ///
    /// # Returns
    ///
    /// The hash as a lowercase hexadecimal string
    pub fn calculate_hash(
        index: u64,
        timestamp: i64,
        transactions: &[Transaction],
        previous_hash: &str,
        nonce: u64,
    ) -> String {
        let mut preimage = format!("{}{}", index, timestamp);
        preimage.push_str(&canonical_transactions(transactions));
        preimage.push_str(previous_hash);
        preimage.push_str(&nonce.to_string());

        sha256_hex(preimage.as_bytes())
    }

    /// Recomputes the hash from the block's own fields
    pub fn compute_hash(&self) -> String {
        Self::calculate_hash(
            self.index,
            self.timestamp,
            &self.transactions,
            &self.previous_hash,
            self.nonce,
        )
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        meets_difficulty(&self.hash, difficulty)
    }
}

/// True when `hash` starts with `difficulty` hex zeros
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Compact JSON of the transaction list. Field order is fixed by the struct definition.
fn canonical_transactions(transactions: &[Transaction]) -> String {
    // Serializing plain structs of strings and integers cannot fail.
    serde_json::to_string(transactions).unwrap_or_default()
}
