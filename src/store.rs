/// Store (spec §4.2): the sole persistence layer, presenting a relational
/// projection (tables + foreign keys + required indexes) over RocksDB.
///
/// Grounded on the teacher's `atomic_writer.rs` (`AtomicBatchWriter`): a
/// single `rocksdb::WriteBatch` spanning every column family touched by one
/// logical unit of work, committed all-or-nothing. Here that unit of work is
/// "one block" (spec §4.6's Projector contract), and the CF layout realizes
/// the schema of spec.md §4.2/§6 per SPEC_FULL.md §11.
use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use rocksdb::{WriteBatch, DB};

use crate::db_handles::{
    CF_APPLIED_BLOCKS, CF_ASSETS, CF_ASSETS_BY_TOKEN, CF_BLOCKS, CF_BLOCKS_BY_ID, CF_INPUTS,
    CF_OUTPUTS, CF_OUTPUTS_BY_ADDRESS, CF_POISON, CF_SYNC_STATUS, CF_TOKENS, CF_TOKEN_BALANCES,
    CF_TRANSACTIONS, CF_TX_BY_BLOCK,
};
use crate::metrics;
use crate::types::{
    Asset, BalanceDelta, Block, IndexerError, Input, Output, Result, SyncStatus, Token,
    Transaction, COINBASE_SENTINEL,
};

fn height_key(height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(4);
    key.write_u32::<BigEndian>(height).unwrap();
    key
}

fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len() + 1);
    out.extend_from_slice(a);
    out.push(0u8);
    out.extend_from_slice(b);
    out
}

fn ser<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| IndexerError::Store(format!("serialize failed: {e}")))
}

fn deser<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| IndexerError::Store(format!("deserialize failed: {e}")))
}

/// A unit-of-work accumulator. Collects writes for one block and commits them
/// atomically via a single `WriteBatch` (spec §4.2 "commit is all-or-nothing
/// across every table touched by one block").
pub struct Tx {
    batch: WriteBatch,
    ops: HashMap<&'static str, usize>,
}

impl Tx {
    fn new() -> Self {
        Self {
            batch: WriteBatch::default(),
            ops: HashMap::new(),
        }
    }

    fn record(&mut self, cf: &'static str) {
        *self.ops.entry(cf).or_insert(0) += 1;
    }

    pub fn pending_count(&self) -> usize {
        self.ops.values().sum()
    }
}

/// Transactional relational projection over RocksDB (spec §4.2).
pub struct Store {
    db: Arc<DB>,
}

impl Store {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    fn cf(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| IndexerError::Store(format!("column family `{name}` not found")))
    }

    /// Begin a new transaction. Nothing is visible to readers until `commit`.
    pub fn begin(&self) -> Tx {
        Tx::new()
    }

    /// Commit a transaction atomically. All-or-nothing: either every write
    /// lands, or (on any RocksDB error) none do.
    pub fn commit(&self, tx: Tx) -> Result<()> {
        if let Err(e) = self.db.write(tx.batch) {
            metrics::record_store_error();
            return Err(e.into());
        }
        Ok(())
    }

    // -- writes (accumulate into `tx`, not yet visible) ---------------------

    pub fn upsert_block(&self, tx: &mut Tx, block: &Block) -> Result<()> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_by_id = self.cf(CF_BLOCKS_BY_ID)?;
        tx.batch
            .put_cf(&cf_blocks, height_key(block.height), ser(block)?);
        tx.batch
            .put_cf(&cf_by_id, block.id.as_bytes(), height_key(block.height));
        tx.record(CF_BLOCKS);
        tx.record(CF_BLOCKS_BY_ID);
        Ok(())
    }

    pub fn upsert_tx(&self, tx: &mut Tx, transaction: &Transaction) -> Result<()> {
        let cf_txs = self.cf(CF_TRANSACTIONS)?;
        let cf_by_block = self.cf(CF_TX_BY_BLOCK)?;
        tx.batch
            .put_cf(&cf_txs, transaction.id.as_bytes(), ser(transaction)?);
        tx.batch.put_cf(
            &cf_by_block,
            concat(transaction.block_id.as_bytes(), &height_key(transaction.index_in_block)),
            transaction.id.as_bytes(),
        );
        tx.record(CF_TRANSACTIONS);
        tx.record(CF_TX_BY_BLOCK);
        Ok(())
    }

    pub fn bulk_insert_outputs(&self, tx: &mut Tx, outputs: &[Output]) -> Result<()> {
        let cf_outputs = self.cf(CF_OUTPUTS)?;
        let cf_by_address = self.cf(CF_OUTPUTS_BY_ADDRESS)?;
        for output in outputs {
            tx.batch
                .put_cf(&cf_outputs, output.box_id.as_bytes(), ser(output)?);
            if let Some(address) = &output.address {
                tx.batch.put_cf(
                    &cf_by_address,
                    concat(address.as_bytes(), output.box_id.as_bytes()),
                    b"",
                );
            }
            tx.record(CF_OUTPUTS);
        }
        Ok(())
    }

    pub fn bulk_insert_inputs(&self, tx: &mut Tx, inputs: &[Input]) -> Result<()> {
        let cf_inputs = self.cf(CF_INPUTS)?;
        for input in inputs {
            tx.batch.put_cf(
                &cf_inputs,
                concat(input.tx_id.as_bytes(), &height_key(input.index_in_tx)),
                ser(input)?,
            );
            tx.record(CF_INPUTS);
        }
        Ok(())
    }

    pub fn bulk_insert_assets(&self, tx: &mut Tx, assets: &[Asset]) -> Result<()> {
        let cf_assets = self.cf(CF_ASSETS)?;
        let cf_by_token = self.cf(CF_ASSETS_BY_TOKEN)?;
        for asset in assets {
            tx.batch.put_cf(
                &cf_assets,
                concat(asset.box_id.as_bytes(), &height_key(asset.index_in_outputs)),
                ser(asset)?,
            );
            tx.batch.put_cf(
                &cf_by_token,
                concat(asset.token_id.as_bytes(), asset.box_id.as_bytes()),
                b"",
            );
            tx.record(CF_ASSETS);
        }
        Ok(())
    }

    /// Mark `box_id` spent by `spending_tx_id` (spec §4.6 step 2: forward
    /// resolution of intra-block spends relies on this being visible to
    /// later steps within the same Projector pass via re-read).
    pub fn mark_output_spent(&self, tx: &mut Tx, box_id: &str, spending_tx_id: &str) -> Result<()> {
        let cf_outputs = self.cf(CF_OUTPUTS)?;
        let mut output: Output = match self.db.get_cf(&cf_outputs, box_id.as_bytes())? {
            Some(bytes) => deser(&bytes)?,
            None => return Err(IndexerError::Store(format!("output {box_id} not found"))),
        };
        output.spent_by_tx_id = Some(spending_tx_id.to_string());
        tx.batch.put_cf(&cf_outputs, box_id.as_bytes(), ser(&output)?);
        tx.record(CF_OUTPUTS);
        Ok(())
    }

    /// Apply signed balance adjustments to `token_balances` (spec §4.7).
    /// Reading the prior balance bypasses any writes still pending in `tx`
    /// (spec §4.2: reads observe only committed state) — callers must not
    /// apply the same `(token_id, address)` pair twice within one `Tx`.
    pub fn apply_balance_deltas(&self, tx: &mut Tx, deltas: &[BalanceDelta]) -> Result<()> {
        let cf_balances = self.cf(CF_TOKEN_BALANCES)?;
        for delta in deltas {
            let key = concat(delta.token_id.as_bytes(), delta.address.as_bytes());
            let current: i64 = match self.db.get_cf(&cf_balances, &key)? {
                Some(bytes) => i64::from_le_bytes(bytes.as_slice().try_into().map_err(|_| {
                    IndexerError::Store("corrupt token_balances entry".to_string())
                })?),
                None => 0,
            };
            let updated = current + delta.delta;
            tx.batch.put_cf(&cf_balances, &key, updated.to_le_bytes());
            tx.record(CF_TOKEN_BALANCES);
        }
        Ok(())
    }

    pub fn upsert_token(&self, tx: &mut Tx, token: &Token) -> Result<()> {
        let cf_tokens = self.cf(CF_TOKENS)?;
        tx.batch
            .put_cf(&cf_tokens, token.token_id.as_bytes(), ser(token)?);
        tx.record(CF_TOKENS);
        Ok(())
    }

    pub fn set_sync_status(&self, tx: &mut Tx, status: &SyncStatus) -> Result<()> {
        let cf_status = self.cf(CF_SYNC_STATUS)?;
        tx.batch.put_cf(&cf_status, b"status", ser(status)?);
        tx.record(CF_SYNC_STATUS);
        Ok(())
    }

    /// Record that `height` has had its balance deltas applied (idempotency
    /// marker), storing the deltas themselves so the HolderAggregator can
    /// reverse them on reorg (spec §4.7 "must be reversible").
    pub fn mark_block_applied(&self, tx: &mut Tx, height: u32, deltas: &[BalanceDelta]) -> Result<()> {
        let cf_applied = self.cf(CF_APPLIED_BLOCKS)?;
        tx.batch
            .put_cf(&cf_applied, height_key(height), ser(deltas)?);
        tx.record(CF_APPLIED_BLOCKS);
        Ok(())
    }

    pub fn is_block_applied(&self, height: u32) -> Result<bool> {
        let cf_applied = self.cf(CF_APPLIED_BLOCKS)?;
        Ok(self.db.get_cf(&cf_applied, height_key(height))?.is_some())
    }

    pub fn get_applied_deltas(&self, height: u32) -> Result<Option<Vec<BalanceDelta>>> {
        let cf_applied = self.cf(CF_APPLIED_BLOCKS)?;
        match self.db.get_cf(&cf_applied, height_key(height))? {
            Some(bytes) => Ok(Some(deser(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove only the applied-deltas marker for `height`, leaving the block
    /// record itself untouched. Used by the HolderAggregator when reverting
    /// balance effects independently of a full block rewind.
    pub fn clear_block_applied(&self, tx: &mut Tx, height: u32) -> Result<()> {
        let cf_applied = self.cf(CF_APPLIED_BLOCKS)?;
        tx.batch.delete_cf(&cf_applied, height_key(height));
        tx.record(CF_APPLIED_BLOCKS);
        Ok(())
    }

    pub fn mark_poison(&self, tx: &mut Tx, height: u32, reason: &str) -> Result<()> {
        let cf_poison = self.cf(CF_POISON)?;
        tx.batch
            .put_cf(&cf_poison, height_key(height), reason.as_bytes());
        tx.record(CF_POISON);
        Ok(())
    }

    /// Delete every record attached to `height` — block, transactions,
    /// outputs, inputs, assets — and clear its applied-deltas marker, undoing
    /// one block (spec §4.2 "cascades to their txs/outputs/inputs/assets";
    /// §4.4 rewind step, applied once per height from the fork point forward
    /// to the old tip). Outputs this block's transactions spent are
    /// re-credited by unsetting `spent_by_tx_id` (spec §4.2 "re-credits spent
    /// outputs... where the spending tx was rewound") unless that output
    /// belongs to the same block being rewound, in which case it is being
    /// deleted outright.
    pub fn rewind_block(&self, tx: &mut Tx, block: &Block) -> Result<()> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_by_id = self.cf(CF_BLOCKS_BY_ID)?;
        let cf_applied = self.cf(CF_APPLIED_BLOCKS)?;
        let cf_txs = self.cf(CF_TRANSACTIONS)?;
        let cf_tx_by_block = self.cf(CF_TX_BY_BLOCK)?;
        let cf_outputs = self.cf(CF_OUTPUTS)?;
        let cf_outputs_by_address = self.cf(CF_OUTPUTS_BY_ADDRESS)?;
        let cf_inputs = self.cf(CF_INPUTS)?;
        let cf_assets = self.cf(CF_ASSETS)?;
        let cf_assets_by_token = self.cf(CF_ASSETS_BY_TOKEN)?;

        let prefix = block.id.as_bytes().to_vec();
        let mut tx_ids: Vec<String> = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf_tx_by_block, &prefix) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            tx_ids.push(String::from_utf8_lossy(&value).into_owned());
            tx.batch.delete_cf(&cf_tx_by_block, key);
            tx.record(CF_TX_BY_BLOCK);
        }

        let mut created_box_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut txns: Vec<Transaction> = Vec::new();
        for tx_id in &tx_ids {
            if let Some(bytes) = self.db.get_cf(&cf_txs, tx_id.as_bytes())? {
                let txn: Transaction = deser(&bytes)?;
                for output in &txn.outputs {
                    created_box_ids.insert(output.box_id.clone());
                }
                txns.push(txn);
            }
        }

        for txn in &txns {
            for output in &txn.outputs {
                tx.batch.delete_cf(&cf_outputs, output.box_id.as_bytes());
                tx.record(CF_OUTPUTS);
                if let Some(address) = &output.address {
                    tx.batch.delete_cf(
                        &cf_outputs_by_address,
                        concat(address.as_bytes(), output.box_id.as_bytes()),
                    );
                }
            }

            for input in &txn.inputs {
                tx.batch.delete_cf(
                    &cf_inputs,
                    concat(input.tx_id.as_bytes(), &height_key(input.index_in_tx)),
                );
                tx.record(CF_INPUTS);

                if input.box_id == COINBASE_SENTINEL || created_box_ids.contains(&input.box_id) {
                    continue;
                }
                if let Some(bytes) = self.db.get_cf(&cf_outputs, input.box_id.as_bytes())? {
                    let mut spent: Output = deser(&bytes)?;
                    spent.spent_by_tx_id = None;
                    tx.batch.put_cf(&cf_outputs, input.box_id.as_bytes(), ser(&spent)?);
                    tx.record(CF_OUTPUTS);
                }
            }

            for asset in &txn.assets {
                tx.batch.delete_cf(
                    &cf_assets,
                    concat(asset.box_id.as_bytes(), &height_key(asset.index_in_outputs)),
                );
                tx.batch.delete_cf(
                    &cf_assets_by_token,
                    concat(asset.token_id.as_bytes(), asset.box_id.as_bytes()),
                );
                tx.record(CF_ASSETS);
            }

            tx.batch.delete_cf(&cf_txs, txn.id.as_bytes());
            tx.record(CF_TRANSACTIONS);
        }

        tx.batch.delete_cf(&cf_blocks, height_key(block.height));
        tx.batch.delete_cf(&cf_by_id, block.id.as_bytes());
        tx.batch.delete_cf(&cf_applied, height_key(block.height));
        tx.record(CF_BLOCKS);
        tx.record(CF_BLOCKS_BY_ID);
        tx.record(CF_APPLIED_BLOCKS);
        Ok(())
    }

    // -- reads (always observe last-committed state) -------------------------

    pub fn get_output(&self, box_id: &str) -> Result<Option<Output>> {
        let cf_outputs = self.cf(CF_OUTPUTS)?;
        match self.db.get_cf(&cf_outputs, box_id.as_bytes())? {
            Some(bytes) => Ok(Some(deser(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_at_height(&self, height: u32) -> Result<Option<Block>> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(&cf_blocks, height_key(height))? {
            Some(bytes) => Ok(Some(deser(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_by_id(&self, block_id: &str) -> Result<Option<Block>> {
        let cf_by_id = self.cf(CF_BLOCKS_BY_ID)?;
        match self.db.get_cf(&cf_by_id, block_id.as_bytes())? {
            Some(height_bytes) => {
                let height = u32::from_be_bytes(
                    height_bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| IndexerError::Store("corrupt blocks_by_id entry".to_string()))?,
                );
                self.get_block_at_height(height)
            }
            None => Ok(None),
        }
    }

    pub fn get_sync_status(&self) -> Result<SyncStatus> {
        let cf_status = self.cf(CF_SYNC_STATUS)?;
        match self.db.get_cf(&cf_status, b"status")? {
            Some(bytes) => deser(&bytes),
            None => Ok(SyncStatus::default()),
        }
    }

    pub fn get_token(&self, token_id: &str) -> Result<Option<Token>> {
        let cf_tokens = self.cf(CF_TOKENS)?;
        match self.db.get_cf(&cf_tokens, token_id.as_bytes())? {
            Some(bytes) => Ok(Some(deser(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Assets attached to `box_id`, found via a prefix scan of `assets`
    /// (keyed `box_id || index_in_outputs`). Used by the Projector to resolve
    /// assets of a spent box that was created in an earlier, already
    /// committed block.
    pub fn get_assets_for_box(&self, box_id: &str) -> Result<Vec<Asset>> {
        let cf_assets = self.cf(CF_ASSETS)?;
        let prefix = concat(box_id.as_bytes(), &[]);
        let mut out = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf_assets, &prefix) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            out.push(deser(&value)?);
        }
        Ok(out)
    }

    pub fn get_token_balance(&self, token_id: &str, address: &str) -> Result<i64> {
        let cf_balances = self.cf(CF_TOKEN_BALANCES)?;
        let key = concat(token_id.as_bytes(), address.as_bytes());
        match self.db.get_cf(&cf_balances, &key)? {
            Some(bytes) => Ok(i64::from_le_bytes(bytes.as_slice().try_into().map_err(
                |_| IndexerError::Store("corrupt token_balances entry".to_string()),
            )?)),
            None => Ok(0),
        }
    }
}
