use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;

struct MiningJob {
    miner: Address,
    reply: oneshot::Sender<Result<Block, BlockchainError>>,
}

/// Enqueues mining jobs for the background miner thread.
///
/// Jobs run one at a time, in submission order. Once every handle is
/// dropped the thread drains its queue and exits.
#[derive(Clone, Debug)]
pub struct MiningHandle {
    jobs: mpsc::UnboundedSender<MiningJob>,
    cancel: Arc<AtomicBool>,
}

impl MiningHandle {
    /// Queues a job and waits for the mined block
    pub async fn mine(&self, miner: Address) -> Result<Block, BlockchainError> {
        let (reply, result) = oneshot::channel();
        self.jobs
            .send(MiningJob { miner, reply })
            .map_err(|_| BlockchainError::SystemError("mining worker stopped".to_string()))?;

        result
            .await
            .map_err(|_| BlockchainError::SystemError("mining worker dropped the job".to_string()))?
    }

    /// Aborts the search in progress and every queued one
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Starts the miner thread
pub fn spawn_miner(
    blockchain: Arc<Blockchain>,
) -> std::io::Result<(MiningHandle, thread::JoinHandle<()>)> {
    let (jobs, mut queue) = mpsc::unbounded_channel::<MiningJob>();
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();

    let thread = thread::Builder::new()
        .name("miner".to_string())
        .spawn(move || {
            info!("Mining worker started");
            while let Some(job) = queue.blocking_recv() {
                let result = blockchain.mine_block_with(&job.miner, Some(&*flag));
                if let Err(err) = &result {
                    warn!("Mining job for {} failed: {}", job.miner, err);
                }
                // the requester may have gone away
                let _ = job.reply.send(result);
            }
            info!("Mining worker stopped");
        })?;

    Ok((MiningHandle { jobs, cancel }, thread))
}

/// Every `period`, mines a block for the owner wallet if anything is pending
pub fn spawn_ticker(
    blockchain: Arc<Blockchain>,
    handle: MiningHandle,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            match blockchain.has_pending() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    error!("Mining tick could not read the mempool: {}", err);
                    continue;
                }
            }

            info!(
                "Mining tick: {} pending transactions",
                blockchain.pending_count().unwrap_or_default()
            );
            match handle.mine(blockchain.owner_address().clone()).await {
                Ok(block) => info!("Mining tick produced block {}", block.index),
                Err(err) => warn!("Mining tick failed: {}", err),
            }
        }
    })
}
