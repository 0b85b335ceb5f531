use std::collections::HashMap;

use super::crypto::Address;
use super::transaction::Transaction;

/// FIFO staging area for admitted, not yet mined transactions.
///
/// Mining takes a snapshot of the queue and only removes that prefix once
/// the block holding it has been appended, so a failed attempt loses nothing.
#[derive(Debug, Default, Clone)]
pub struct Mempool {
    transactions: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Copy of the pending queue, oldest first
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }

    /// Whether a transfer with the same sender and signed payload is pending
    pub fn contains(&self, transaction: &Transaction) -> bool {
        let digest = transaction.digest();
        self.transactions.iter().any(|pending| pending.digest() == digest)
    }

    /// Drops the first `count` entries after they were mined.
    ///
    /// Admission only appends, so the mined snapshot is still the prefix.
    pub fn commit_mined(&mut self, count: usize) {
        let count = count.min(self.transactions.len());
        self.transactions.drain(..count);
    }

    /// Total amount each sender has pending, already debited from the wallet cache
    pub fn pending_debits(&self) -> HashMap<Address, u64> {
        let mut debits = HashMap::new();
        for tx in &self.transactions {
            if let Some(from) = &tx.from {
                *debits.entry(from.clone()).or_insert(0) += tx.amount;
            }
        }
        debits
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
