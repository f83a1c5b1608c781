/// HolderAggregator (spec §4.7): incrementally maintains `token_balances`
/// from per-block signed deltas, idempotently and reversibly.
///
/// Grounded on the teacher's `address_rollback.rs`/`spent_utxo.rs`: explicit
/// per-block undo data stored alongside the index so a reorg can reverse
/// exactly what one block contributed without a full rebuild. Here the undo
/// data is the very `Vec<BalanceDelta>` the Projector computed, kept in the
/// `applied_blocks` column family (spec §4.7 "store enough to reverse a
/// block's effect without recomputation").
use crate::store::{Store, Tx};
use crate::types::{BalanceDelta, RegisterValue, Result, Token, TokenMeta};

pub struct HolderAggregator<'a> {
    store: &'a Store,
}

impl<'a> HolderAggregator<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Apply `deltas` for `height`. Idempotent: if `height` was already
    /// applied (spec §4.7 "re-running the same block must be a no-op"), this
    /// returns `Ok(())` without touching balances again.
    pub fn apply_block_deltas(&self, height: u32, deltas: &[BalanceDelta]) -> Result<()> {
        if self.store.is_block_applied(height)? {
            return Ok(());
        }

        let mut tx = self.store.begin();
        self.store.apply_balance_deltas(&mut tx, deltas)?;
        self.store.mark_block_applied(&mut tx, height, deltas)?;
        self.store.commit(tx)?;
        Ok(())
    }

    /// Reverse whatever `height` applied, using the stored undo data. A
    /// no-op if `height` was never applied (already reverted, or never
    /// reached this stage — spec §4.7 "reversal must itself be idempotent").
    /// Opens and commits its own `Tx`; callers that need the reversal folded
    /// into a larger atomic unit of work (e.g. reorg rewind, which must also
    /// delete the block's rows in the same commit — spec §4.2 "rewind of
    /// range `(h, tip]` is all-or-nothing") should use
    /// `revert_block_deltas_into` instead.
    pub fn revert_block_deltas(&self, height: u32) -> Result<()> {
        let mut tx = self.store.begin();
        self.revert_block_deltas_into(&mut tx, height)?;
        self.store.commit(tx)
    }

    /// Accumulate the inverse of `height`'s applied deltas into the caller's
    /// `tx`, without committing. Lets a caller combine the delta reversal
    /// with other writes (e.g. `Store::rewind_block`) into one atomic
    /// commit.
    pub fn revert_block_deltas_into(&self, tx: &mut Tx, height: u32) -> Result<()> {
        let Some(deltas) = self.store.get_applied_deltas(height)? else {
            return Ok(());
        };

        let inverse: Vec<BalanceDelta> = deltas
            .into_iter()
            .map(|d| BalanceDelta {
                token_id: d.token_id,
                address: d.address,
                delta: -d.delta,
            })
            .collect();

        self.store.apply_balance_deltas(tx, &inverse)?;
        self.store.clear_block_applied(tx, height)?;
        Ok(())
    }

    /// Record token metadata the first time a token id is observed (spec
    /// §4.7 "token rows are created lazily on first mint"). Re-minting the
    /// same token id leaves the stored metadata untouched. Takes the
    /// caller's `Tx` rather than opening its own, so the Projector can fold
    /// this write into the same atomic commit as the rest of the block
    /// (spec §4.6: "one transaction" per block).
    pub fn record_token_if_new(
        &self,
        tx: &mut Tx,
        token_id: &str,
        first_seen_height: u32,
        meta: TokenMeta,
    ) -> Result<()> {
        if self.store.get_token(token_id)?.is_some() {
            return Ok(());
        }
        self.store.upsert_token(
            tx,
            &Token {
                token_id: token_id.to_string(),
                name: meta.name,
                description: meta.description,
                decimals: meta.decimals,
                total_supply: None,
                first_seen_height,
            },
        )?;
        Ok(())
    }
}

/// Best-effort decode of an Ergo register holding a `Coll[SByte]` constant
/// (R4/R5: token name/description) into a UTF-8 string.
///
/// Ergo register values are hex-encoded serialized `ErgoValue` constants: one
/// type-descriptor byte (`0x0e` for `Coll[SByte]`), a VLQ-encoded length, then
/// the raw bytes. Full sigma-constant parsing (arbitrary nested types) is out
/// of scope (spec.md Non-goals: no script execution/interpretation); this
/// decodes only the one shape token metadata actually uses and returns `None`
/// on anything else, per spec §4.7 "decode failures yield NULL, never abort
/// the block".
pub fn decode_register_string(reg: &RegisterValue) -> Option<String> {
    let bytes = hex::decode(&reg.0).ok()?;
    if bytes.len() < 2 || bytes[0] != 0x0e {
        return None;
    }
    let (len, header_len) = read_vlq(&bytes[1..])?;
    let start = 1 + header_len;
    let end = start.checked_add(len as usize)?;
    let payload = bytes.get(start..end)?;
    String::from_utf8(payload.to_vec()).ok()
}

/// Best-effort decode of an Ergo register holding an `SInt`/`SLong` constant
/// (R6: decimals) into an unsigned integer.
pub fn decode_register_int(reg: &RegisterValue) -> Option<u32> {
    let bytes = hex::decode(&reg.0).ok()?;
    if bytes.len() < 2 || (bytes[0] != 0x04 && bytes[0] != 0x05) {
        return None;
    }
    let (value, _) = read_vlq(&bytes[1..])?;
    u32::try_from(zigzag_decode(value)).ok()
}

/// Decode a little-endian base-128 VLQ, returning `(value, bytes_consumed)`.
fn read_vlq(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_handles::ALL_COLUMN_FAMILIES;
    use rocksdb::{Options, DB};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, dir.path(), ALL_COLUMN_FAMILIES).unwrap();
        (Store::new(Arc::new(db)), dir)
    }

    fn delta(token_id: &str, address: &str, amount: i64) -> BalanceDelta {
        BalanceDelta {
            token_id: token_id.to_string(),
            address: address.to_string(),
            delta: amount,
        }
    }

    #[test]
    fn apply_then_revert_restores_prior_balance() {
        let (store, _dir) = test_store();
        let holder = HolderAggregator::new(&store);
        let deltas = vec![delta("ERG", "addr1", 500)];

        holder.apply_block_deltas(10, &deltas).unwrap();
        assert_eq!(store.get_token_balance("ERG", "addr1").unwrap(), 500);

        holder.revert_block_deltas(10).unwrap();
        assert_eq!(store.get_token_balance("ERG", "addr1").unwrap(), 0);
        assert!(!store.is_block_applied(10).unwrap());
    }

    #[test]
    fn apply_is_idempotent_for_an_already_applied_height() {
        let (store, _dir) = test_store();
        let holder = HolderAggregator::new(&store);
        let deltas = vec![delta("ERG", "addr1", 100)];

        holder.apply_block_deltas(1, &deltas).unwrap();
        holder.apply_block_deltas(1, &deltas).unwrap();

        assert_eq!(store.get_token_balance("ERG", "addr1").unwrap(), 100);
    }

    #[test]
    fn revert_on_never_applied_height_is_a_no_op() {
        let (store, _dir) = test_store();
        let holder = HolderAggregator::new(&store);
        holder.revert_block_deltas(42).unwrap();
        assert!(!store.is_block_applied(42).unwrap());
    }

    #[test]
    fn token_metadata_recorded_once_and_not_overwritten_on_remint() {
        let (store, _dir) = test_store();
        let holder = HolderAggregator::new(&store);

        let mut tx = store.begin();
        holder
            .record_token_if_new(
                &mut tx,
                "tok1",
                10,
                TokenMeta { name: Some("First".to_string()), description: None, decimals: Some(0) },
            )
            .unwrap();
        store.commit(tx).unwrap();

        let mut tx = store.begin();
        holder
            .record_token_if_new(
                &mut tx,
                "tok1",
                20,
                TokenMeta { name: Some("Second".to_string()), description: None, decimals: Some(2) },
            )
            .unwrap();
        store.commit(tx).unwrap();

        let token = store.get_token("tok1").unwrap().unwrap();
        assert_eq!(token.name.as_deref(), Some("First"));
        assert_eq!(token.first_seen_height, 10);
    }

    #[test]
    fn decodes_a_well_formed_name_register() {
        // 0x0e ('Coll[SByte]' marker) + VLQ length(5) + "token" in ASCII.
        let mut bytes = vec![0x0e, 0x05];
        bytes.extend_from_slice(b"token");
        let reg = RegisterValue(hex::encode(bytes));
        assert_eq!(decode_register_string(&reg).as_deref(), Some("token"));
    }

    #[test]
    fn malformed_register_decodes_to_none_rather_than_panicking() {
        let reg = RegisterValue("not-hex-at-all".to_string());
        assert_eq!(decode_register_string(&reg), None);
        assert_eq!(decode_register_int(&reg), None);
    }
}
