/// SyncController (spec §4.8): top-level state machine driving the pipeline
/// from "cold start" through ongoing live sync, reacting to reorgs and
/// transient failures, and shutting down cleanly on signal.
///
/// Grounded on the teacher's `sync.rs` (`run_sync_service`): detect current
/// sync state from the Store, then loop between a catch-up mode and a
/// steady-state polling mode. The teacher chooses between file-import and
/// RPC-monitor modes; here there is only one source (the node's REST API),
/// so the same state-machine shape collapses to "catch up in batches, then
/// poll" with reorg detection folded into every iteration (spec §4.4, §4.8).
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::holder::HolderAggregator;
use crate::node_client::NodeClient;
use crate::parser;
use crate::projector::Projector;
use crate::reorg::ReorgDetector;
use crate::store::Store;
use crate::types::{IndexerError, Result};
use crate::workpool::WorkPool;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Catching up: local height trails the node's tip by more than one
    /// batch. Runs the WorkPool at full configured concurrency.
    CatchingUp,
    /// Within one batch of the tip: still fetches/commits, but is the state
    /// from which "live" behavior (reorg-sensitive single-block commits) is
    /// expected (spec §4.8).
    Live,
    /// A reorg was detected and is being rewound before resuming forward
    /// progress.
    Reorging,
}

pub struct SyncController {
    node: Arc<NodeClient>,
    store: Store,
    config: AppConfig,
}

impl SyncController {
    pub fn new(node: Arc<NodeClient>, store: Store, config: AppConfig) -> Self {
        Self { node, store, config }
    }

    fn reorg_detector(&self) -> ReorgDetector {
        ReorgDetector::new(self.node.clone(), self.config.max_reorg_depth)
    }

    /// Run until `shutdown` resolves (spec §4.8 "graceful shutdown: finish
    /// the in-flight batch, do not start a new one").
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping sync loop");
                    return Ok(());
                }
                result = self.step() => {
                    if let Err(e) = result {
                        error!(error = %e, "sync step failed");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// One iteration: detect state, act on it, report progress via metrics.
    async fn step(&self) -> Result<()> {
        let status = self.store.get_sync_status()?;
        let local_height = status.current_height;

        let detector = self.reorg_detector();
        if local_height > 0 && detector.is_reorged_at(&self.store, local_height).await? {
            self.handle_reorg(&detector, local_height).await?;
            return Ok(());
        }

        let info = self.node.info().await?;
        metrics::set_chain_tip_height("node", info.full_height as i64);
        metrics::set_chain_tip_height("store", local_height as i64);

        // `current_height = 0` is ambiguous: either nothing has synced yet
        // (fresh store), or genesis (height 0) is the last committed block.
        // Only the former honors `initial_height` (spec §6 "start-from
        // height") — once genesis itself is on disk, `initial_height` must
        // not retroactively move the cursor.
        let next_height = if local_height == 0 && self.store.get_block_at_height(0)?.is_none() {
            self.config.initial_height
        } else {
            local_height + 1
        };

        if info.full_height < next_height {
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
            return Ok(());
        }

        let remaining = info.full_height - next_height + 1;
        let state = if remaining > self.config.batch_size {
            SyncState::CatchingUp
        } else {
            SyncState::Live
        };

        let batch_end = next_height
            .saturating_add(self.config.batch_size)
            .saturating_sub(1)
            .min(info.full_height);

        info!(
            ?state,
            from = next_height,
            to = batch_end,
            node_tip = info.full_height,
            "advancing sync"
        );

        self.run_batch(next_height, batch_end, info.full_height).await
    }

    async fn run_batch(&self, start: u32, end: u32, target_height: u32) -> Result<()> {
        let pool = WorkPool::new(self.config.max_workers);
        let node = self.node.clone();
        let network_prefix = self.config.network_prefix;
        let genesis_height = 0;
        let max_retries = self.config.max_block_retries;

        // Tracks the lowest height whose fetch/parse/commit actually failed,
        // so the poison marker (spec §4.6 "flagged in a poison table") names
        // the real offending height rather than the whole batch's start.
        let failed_height = Arc::new(std::sync::atomic::AtomicU32::new(u32::MAX));

        let fetch_parse = {
            let failed_height = failed_height.clone();
            move |height: u32| {
                let node = node.clone();
                let failed_height = failed_height.clone();
                async move {
                    let mut attempt = 0;
                    loop {
                        let raw = node.block_at_height(height).await;
                        match raw {
                            Ok(raw) => {
                                metrics::increment_blocks_processed("fetched", 1);
                                let parsed = parser::parse_block(&raw, network_prefix, genesis_height);
                                if parsed.is_err() {
                                    failed_height.fetch_min(height, std::sync::atomic::Ordering::Relaxed);
                                } else {
                                    metrics::increment_blocks_processed("parsed", 1);
                                }
                                return parsed;
                            }
                            Err(IndexerError::Unavailable) if attempt < max_retries => {
                                attempt += 1;
                                continue;
                            }
                            Err(e) => {
                                failed_height.fetch_min(height, std::sync::atomic::Ordering::Relaxed);
                                return Err(e);
                            }
                        }
                    }
                }
            }
        };

        let commit_failed_height = failed_height.clone();
        let result = pool
            .run(start..=end, fetch_parse, move |parsed| {
                let failed_height = commit_failed_height.clone();
                async move {
                    let height = parsed.block.height;
                    let projector = Projector::new(&self.store);
                    let outcome = projector.project_block(&parsed, target_height);
                    if outcome.is_err() {
                        failed_height.fetch_min(height, std::sync::atomic::Ordering::Relaxed);
                    } else {
                        metrics::increment_blocks_processed("committed", 1);
                    }
                    outcome
                }
            })
            .await;

        match result {
            Ok(last_committed) => {
                info!(last_committed, "batch committed");
                Ok(())
            }
            Err(IndexerError::BadBlock(reason)) => {
                let poisoned_height = match failed_height.load(std::sync::atomic::Ordering::Relaxed) {
                    u32::MAX => start,
                    height => height,
                };
                warn!(poisoned_height, reason = %reason, "marking height poisoned after exhausting retries");
                metrics::record_poison_block();
                let mut tx = self.store.begin();
                self.store.mark_poison(&mut tx, poisoned_height, &reason)?;
                self.store.commit(tx)?;
                Err(IndexerError::BadBlock(reason))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_reorg(&self, detector: &ReorgDetector, local_height: u32) -> Result<()> {
        warn!(local_height, "reorg detected, finding fork point");
        metrics::record_reorg_event();

        let fork_point = detector.find_fork_point(&self.store, local_height).await?;
        let holder = HolderAggregator::new(&self.store);

        // Delta reversal and row deletion land in one `Tx`/commit: a crash
        // between the two would otherwise leave `token_balances` reverted
        // while the block's rows still exist, violating the "rewind is
        // all-or-nothing" guarantee (spec §4.2, §8 reorg-inverse law).
        for height in &fork_point.orphaned_heights {
            if let Some(block) = self.store.get_block_at_height(*height)? {
                let mut tx = self.store.begin();
                holder.revert_block_deltas_into(&mut tx, *height)?;
                self.store.rewind_block(&mut tx, &block)?;
                self.store.commit(tx)?;
                self.node.invalidate(&block.id).await;
            }
        }

        info!(
            fork_height = fork_point.fork_height,
            orphaned = fork_point.orphaned_heights.len(),
            "reorg rewind complete"
        );
        Ok(())
    }
}
