use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;

use super::block::{meets_difficulty, Block};
use super::transaction::Transaction;

/// How many nonces are tried between checks of the cancel flag and deadline
const CHECK_INTERVAL: u64 = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiningError {
    #[error("mining cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    #[error("mining timed out after {attempts} attempts")]
    Timeout { attempts: u64 },

    #[error("nonce space exhausted")]
    Exhausted,
}

/// Stops a running search early. The default never stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchLimits<'a> {
    pub cancel: Option<&'a AtomicBool>,
    pub deadline: Option<Instant>,
}

impl SearchLimits<'_> {
    fn check(&self, attempts: u64) -> Result<(), MiningError> {
        if let Some(cancel) = self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(MiningError::Cancelled { attempts });
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MiningError::Timeout { attempts });
            }
        }
        Ok(())
    }
}

/// Proof-of-work search.
///
/// Tries nonces from 0 upward until the block hash starts with
/// `difficulty` hex zeros. Apart from CPU time the search is a pure
/// function of its inputs.
///
/// # Returns
///
/// The winning `(nonce, hash)`
pub fn mine(
    index: u64,
    timestamp: i64,
    transactions: &[Transaction],
    previous_hash: &str,
    difficulty: usize,
    limits: SearchLimits<'_>,
) -> Result<(u64, String), MiningError> {
    let mut nonce: u64 = 0;

    loop {
        let hash = Block::calculate_hash(index, timestamp, transactions, previous_hash, nonce);
        if meets_difficulty(&hash, difficulty) {
            return Ok((nonce, hash));
        }

        nonce = nonce.checked_add(1).ok_or(MiningError::Exhausted)?;
        if nonce % CHECK_INTERVAL == 0 {
            limits.check(nonce)?;
        }
    }
}
