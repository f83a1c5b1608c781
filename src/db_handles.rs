use std::sync::Arc;
use rocksdb::DB;

/// Column families realizing the relational schema of spec.md §4.2/§6 over
/// RocksDB (SPEC_FULL.md §11). One CF per entity table, plus explicit
/// secondary-index CFs for every required lookup path.
pub const CF_BLOCKS: &str = "blocks";
pub const CF_BLOCKS_BY_ID: &str = "blocks_by_id";
pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_TX_BY_BLOCK: &str = "tx_by_block";
pub const CF_OUTPUTS: &str = "outputs";
pub const CF_OUTPUTS_BY_ADDRESS: &str = "outputs_by_address";
pub const CF_INPUTS: &str = "inputs";
pub const CF_ASSETS: &str = "assets";
pub const CF_ASSETS_BY_TOKEN: &str = "assets_by_token";
pub const CF_TOKENS: &str = "tokens";
pub const CF_TOKEN_BALANCES: &str = "token_balances";
pub const CF_SYNC_STATUS: &str = "sync_status";
pub const CF_POISON: &str = "poison";
pub const CF_APPLIED_BLOCKS: &str = "applied_blocks";

pub const ALL_COLUMN_FAMILIES: &[&str] = &[
    CF_BLOCKS,
    CF_BLOCKS_BY_ID,
    CF_TRANSACTIONS,
    CF_TX_BY_BLOCK,
    CF_OUTPUTS,
    CF_OUTPUTS_BY_ADDRESS,
    CF_INPUTS,
    CF_ASSETS,
    CF_ASSETS_BY_TOKEN,
    CF_TOKENS,
    CF_TOKEN_BALANCES,
    CF_SYNC_STATUS,
    CF_POISON,
    CF_APPLIED_BLOCKS,
];

/// Cached column family handles for efficient access.
///
/// Grounded on the teacher's `db_handles.rs`: validate every required CF
/// exists once at startup, then hand out `&Arc<DB>` so hot paths never do a
/// string-keyed CF lookup.
#[derive(Clone)]
pub struct DbHandles {
    db: Arc<DB>,
}

impl DbHandles {
    /// Create new DbHandles, validating that all required column families
    /// exist at startup.
    pub fn new(db: Arc<DB>) -> Result<Self, String> {
        for cf_name in ALL_COLUMN_FAMILIES {
            if db.cf_handle(cf_name).is_none() {
                return Err(format!("{} column family not found", cf_name));
            }
        }

        Ok(Self { db })
    }

    /// Get database reference
    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }
}
