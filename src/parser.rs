/// Parser (spec §4.3): pure transformation from node JSON into internal
/// entity records. No I/O; safe to run on many blocks in parallel (this is
/// what lets WorkPool fan fetch+parse out across tasks).
use std::collections::HashMap;

use crate::address::address_from_ergo_tree;
use crate::types::{
    Asset, Block, IndexerError, Input, NodeFullBlock, Output, ParsedBlock, RegisterValue, Result,
    Transaction, COINBASE_SENTINEL,
};

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn require_hex(field: &str, value: &str) -> Result<()> {
    if !is_hex(value) {
        return Err(IndexerError::BadBlock(format!(
            "field `{}` is not valid hex: `{}`",
            field, value
        )));
    }
    Ok(())
}

/// Registers and extension fields arrive as JSON; most are plain hex strings
/// (`"0e0e..."`), which `serde_json::Value::to_string()` would re-quote into
/// `"\"0e0e...\""` and so poison any downstream `hex::decode`. Pull the inner
/// scalar out when the value is a JSON string; only fall back to the raw JSON
/// rendering for the (rare, non-hex) structured-value case, kept as an opaque
/// blob per spec §9 ("unknown register keys are preserved as opaque blobs").
fn register_value_from_json(value: &serde_json::Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Parse a node `FullBlock` response into the internal `ParsedBlock` record,
/// computing addresses and positional indices along the way.
///
/// `network_prefix` feeds the Parser's address-derivation step (spec §4.3);
/// `genesis_height` identifies the one height at which `tx_count == 0` is
/// legal (spec §8 "A block with tx_count = 0 is legal only for genesis-like
/// special heights; elsewhere flagged BadBlock").
pub fn parse_block(
    raw: &NodeFullBlock,
    network_prefix: u8,
    genesis_height: u32,
) -> Result<ParsedBlock> {
    let header = &raw.header;
    require_hex("header.id", &header.id)?;
    require_hex("header.parentId", &header.parent_id)?;

    let node_txs = &raw.block_transactions.transactions;

    if node_txs.is_empty() && header.height != genesis_height {
        return Err(IndexerError::BadBlock(format!(
            "block at height {} has zero transactions but is not the genesis height",
            header.height
        )));
    }

    let mut transactions = Vec::with_capacity(node_txs.len());
    for (tx_index, node_tx) in node_txs.iter().enumerate() {
        let tx = parse_transaction(node_tx, &header.id, tx_index as u32, header.timestamp, network_prefix)?;
        transactions.push(tx);
    }

    let block = Block {
        id: header.id.clone(),
        header_id: header.id.clone(),
        parent_id: header.parent_id.clone(),
        height: header.height,
        timestamp_ms: header.timestamp,
        difficulty: header.difficulty.clone(),
        size: header.size,
        tx_count: node_txs.len() as u32,
        miner_address: None,
        main_chain: true,
        version: header.version,
        pow_solutions: header.pow_solutions.as_ref().map(|v| v.to_string()),
    };

    Ok(ParsedBlock { block, transactions })
}

fn parse_transaction(
    node_tx: &crate::types::NodeTransaction,
    block_id: &str,
    index_in_block: u32,
    timestamp_ms: u64,
    network_prefix: u8,
) -> Result<Transaction> {
    require_hex("tx.id", &node_tx.id)?;

    if node_tx.outputs.is_empty() {
        return Err(IndexerError::BadBlock(format!(
            "transaction {} has no outputs",
            node_tx.id
        )));
    }

    let mut outputs = Vec::with_capacity(node_tx.outputs.len());
    let mut assets = Vec::new();

    for (out_index, node_out) in node_tx.outputs.iter().enumerate() {
        require_hex("output.boxId", &node_out.box_id)?;
        require_hex("output.ergoTree", &node_out.ergo_tree)?;

        if node_out.value < 0 {
            return Err(IndexerError::BadBlock(format!(
                "output {} has negative value {}",
                node_out.box_id, node_out.value
            )));
        }
        if node_out.creation_height < 0 {
            return Err(IndexerError::BadBlock(format!(
                "output {} has negative creation_height",
                node_out.box_id
            )));
        }

        let address = address_from_ergo_tree(&node_out.ergo_tree, network_prefix);

        let mut registers = HashMap::with_capacity(node_out.additional_registers.len());
        for (key, value) in &node_out.additional_registers {
            registers.insert(key.clone(), RegisterValue(register_value_from_json(value)));
        }

        for (asset_index, node_asset) in node_out.assets.iter().enumerate() {
            require_hex("asset.tokenId", &node_asset.token_id)?;
            assets.push(Asset {
                token_id: node_asset.token_id.clone(),
                box_id: node_out.box_id.clone(),
                index_in_outputs: asset_index as u32,
                amount: node_asset.amount,
            });
        }

        outputs.push(Output {
            box_id: node_out.box_id.clone(),
            tx_id: node_tx.id.clone(),
            index_in_tx: out_index as u32,
            value: node_out.value as u64,
            creation_height: node_out.creation_height as u32,
            address,
            ergo_tree: node_out.ergo_tree.clone(),
            additional_registers: registers,
            spent_by_tx_id: None,
        });
    }

    let mut inputs = Vec::with_capacity(node_tx.inputs.len());
    for (in_index, node_in) in node_tx.inputs.iter().enumerate() {
        if node_in.box_id != COINBASE_SENTINEL {
            require_hex("input.boxId", &node_in.box_id)?;
        }

        let mut extension = HashMap::with_capacity(node_in.extension.len());
        for (key, value) in &node_in.extension {
            extension.insert(key.clone(), RegisterValue(register_value_from_json(value)));
        }

        inputs.push(Input {
            box_id: node_in.box_id.clone(),
            tx_id: node_tx.id.clone(),
            index_in_tx: in_index as u32,
            proof_bytes: node_in.spending_proof.as_ref().map(|v| v.to_string()),
            extension,
        });
    }

    Ok(Transaction {
        id: node_tx.id.clone(),
        block_id: block_id.to_string(),
        index_in_block,
        timestamp_ms,
        size: node_tx.size,
        main_chain: true,
        inputs,
        outputs,
        assets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        NodeAsset, NodeBlockHeader, NodeBlockTransactions, NodeInput, NodeOutput, NodeTransaction,
    };
    use std::collections::HashMap as Map;

    fn sample_header(height: u32) -> NodeBlockHeader {
        NodeBlockHeader {
            id: "aa".repeat(32),
            parent_id: "bb".repeat(32),
            height,
            timestamp: 1_700_000_000_000,
            difficulty: "123456".to_string(),
            size: 1000,
            version: 2,
            pow_solutions: None,
            miner_pk: None,
        }
    }

    fn sample_tx(id: &str, box_id: &str, input_box: &str) -> NodeTransaction {
        NodeTransaction {
            id: id.to_string(),
            size: 200,
            inputs: vec![NodeInput {
                box_id: input_box.to_string(),
                spending_proof: None,
                extension: Map::new(),
            }],
            outputs: vec![NodeOutput {
                box_id: box_id.to_string(),
                value: 1_000_000_000,
                ergo_tree: "0008cd0279c5ac0e03".to_string(),
                creation_height: 10,
                assets: vec![NodeAsset {
                    token_id: "cc".repeat(32),
                    amount: 1000,
                }],
                additional_registers: Map::new(),
            }],
        }
    }

    #[test]
    fn parses_a_well_formed_block() {
        let raw = NodeFullBlock {
            header: sample_header(10),
            block_transactions: NodeBlockTransactions {
                transactions: vec![sample_tx(&"11".repeat(32), &"22".repeat(32), COINBASE_SENTINEL)],
            },
        };

        let parsed = parse_block(&raw, 0x00, 0).expect("parse should succeed");
        assert_eq!(parsed.block.height, 10);
        assert_eq!(parsed.transactions.len(), 1);
        let tx = &parsed.transactions[0];
        assert_eq!(tx.index_in_block, 0);
        assert_eq!(tx.outputs[0].index_in_tx, 0);
        assert!(tx.outputs[0].address.is_some());
        assert_eq!(tx.assets.len(), 1);
    }

    #[test]
    fn rejects_non_hex_box_id() {
        let mut tx = sample_tx(&"11".repeat(32), "not-hex", COINBASE_SENTINEL);
        tx.outputs[0].box_id = "zz-not-hex".to_string();
        let raw = NodeFullBlock {
            header: sample_header(10),
            block_transactions: NodeBlockTransactions { transactions: vec![tx] },
        };
        assert!(matches!(parse_block(&raw, 0x00, 0), Err(IndexerError::BadBlock(_))));
    }

    #[test]
    fn rejects_negative_value() {
        let mut tx = sample_tx(&"11".repeat(32), &"22".repeat(32), COINBASE_SENTINEL);
        tx.outputs[0].value = -5;
        let raw = NodeFullBlock {
            header: sample_header(10),
            block_transactions: NodeBlockTransactions { transactions: vec![tx] },
        };
        assert!(matches!(parse_block(&raw, 0x00, 0), Err(IndexerError::BadBlock(_))));
    }

    #[test]
    fn allows_empty_transactions_only_at_genesis_height() {
        let raw = NodeFullBlock {
            header: sample_header(0),
            block_transactions: NodeBlockTransactions { transactions: vec![] },
        };
        assert!(parse_block(&raw, 0x00, 0).is_ok());

        let raw_nonzero = NodeFullBlock {
            header: sample_header(5),
            block_transactions: NodeBlockTransactions { transactions: vec![] },
        };
        assert!(matches!(
            parse_block(&raw_nonzero, 0x00, 0),
            Err(IndexerError::BadBlock(_))
        ));
    }

    #[test]
    fn parser_is_deterministic() {
        let raw = NodeFullBlock {
            header: sample_header(10),
            block_transactions: NodeBlockTransactions {
                transactions: vec![sample_tx(&"11".repeat(32), &"22".repeat(32), COINBASE_SENTINEL)],
            },
        };
        let a = parse_block(&raw, 0x00, 0).unwrap();
        let b = parse_block(&raw, 0x00, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn register_json_strings_are_unwrapped_not_requoted() {
        let mut tx = sample_tx(&"11".repeat(32), &"22".repeat(32), COINBASE_SENTINEL);
        tx.outputs[0]
            .additional_registers
            .insert("R4".to_string(), serde_json::Value::String("0e05746f6b656e".to_string()));
        let raw = NodeFullBlock {
            header: sample_header(10),
            block_transactions: NodeBlockTransactions { transactions: vec![tx] },
        };

        let parsed = parse_block(&raw, 0x00, 0).unwrap();
        let reg = &parsed.transactions[0].outputs[0].additional_registers["R4"];
        assert_eq!(reg.0, "0e05746f6b656e");
        assert!(hex::decode(&reg.0).is_ok());
    }
}
