/// ReorgDetector (spec §4.4): finds the fork point between the locally
/// stored chain and the node's current chain by walking lineage backward.
///
/// Grounded on the teacher's `reorg.rs` `find_fork_point`/`handle_reorg`
/// shape (walk backward comparing stored vs. live hashes, then roll back to
/// the common ancestor), generalized from a synchronous Bitcoin-style RPC
/// client to the async `NodeClient` and bounded by `max_reorg_depth` (spec
/// §4.4, §7: deeper reorgs are refused rather than silently rewound).
use std::sync::Arc;

use tracing::{info, warn};

use crate::node_client::NodeClient;
use crate::store::Store;
use crate::types::{IndexerError, Result};

/// Result of a successful fork-point search: the last block both chains
/// agree on, and every local height that must be rewound to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkPoint {
    pub fork_height: u32,
    /// Heights to orphan, from the old tip down to (but not including) the
    /// fork height. Callers rewind in this order (spec §4.4: "highest height
    /// first").
    pub orphaned_heights: Vec<u32>,
}

pub struct ReorgDetector {
    node: Arc<NodeClient>,
    max_reorg_depth: u32,
}

impl ReorgDetector {
    pub fn new(node: Arc<NodeClient>, max_reorg_depth: u32) -> Self {
        Self {
            node,
            max_reorg_depth,
        }
    }

    /// Walk backward from `local_tip_height` comparing the locally-stored
    /// block id at each height against the node's id at that height, until a
    /// match is found. Returns `IndexerError::ReorgTooDeep` if the walkback
    /// exceeds `max_reorg_depth` without finding a common ancestor.
    pub async fn find_fork_point(&self, store: &Store, local_tip_height: u32) -> Result<ForkPoint> {
        let mut height = local_tip_height;
        let mut orphaned = Vec::new();

        loop {
            let local_block = store.get_block_at_height(height)?;
            let remote_ids = self.node.block_ids_at(height).await?;

            let matches = match &local_block {
                Some(block) => remote_ids.iter().any(|id| id == &block.id),
                None => false,
            };

            if matches {
                if !orphaned.is_empty() {
                    warn!(
                        fork_height = height,
                        orphaned = orphaned.len(),
                        "reorg fork point found"
                    );
                }
                return Ok(ForkPoint {
                    fork_height: height,
                    orphaned_heights: orphaned,
                });
            }

            orphaned.push(height);

            if orphaned.len() as u32 >= self.max_reorg_depth {
                return Err(IndexerError::ReorgTooDeep {
                    depth: orphaned.len() as u32,
                    max: self.max_reorg_depth,
                });
            }

            if height == 0 {
                return Err(IndexerError::ReorgTooDeep {
                    depth: orphaned.len() as u32,
                    max: self.max_reorg_depth,
                });
            }

            height -= 1;
        }
    }

    /// Convenience check: does the node's current tip disagree with our
    /// stored block at `height`? Used by SyncController before committing a
    /// new block at a height we thought was settled (spec §4.4, §4.8).
    pub async fn is_reorged_at(&self, store: &Store, height: u32) -> Result<bool> {
        let local = store.get_block_at_height(height)?;
        let Some(local) = local else { return Ok(false) };
        let remote_ids = self.node.block_ids_at(height).await?;
        Ok(!remote_ids.iter().any(|id| id == &local.id))
    }
}
