//! Output Script Parser
//!
//! Scans a locking script once, dispatching to the bitcom decoders after
//! `OP_RETURN` / `|`, to the ord envelope decoder after
//! `OP_FALSE OP_IF "ord"`, and finally searching for an ordlock listing.
//! Parsing is a pure function of its inputs.

use bitcoin::{Transaction, Txid};
use tracing::debug;

use crate::bitcom::parse_bitcom;
use crate::bsv20::TokenParser;
use crate::inscription::{parse_inscription, ORD_MARKER};
use crate::ordlock::parse_ordlock;
use crate::outpoint::{ByteString, Outpoint};
use crate::script::{p2pkh_hash, read_op, OP_0, OP_DATA_1, OP_IF, OP_RETURN, P2PKH_LEN};
use crate::txo::{Txo, TxoData};

/// Result of scanning one locking script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedScript {
    /// Owner hash from a P2PKH prefix, or from an ordlock listing
    pub pkhash: Option<ByteString>,
    pub data: TxoData,
}

/// Decode the locking script of output `vout` into its embedded records
///
/// # Arguments
/// * `tx` - The owning transaction (SIGMA signatures commit to its inputs)
/// * `vout` - Index of the output to decode; out of range yields an empty result
/// * `height` - Block height, `None` while unconfirmed
/// * `tokens` - Sub-parser for token-operation payloads
pub fn parse_output_script(
    tx: &Transaction,
    vout: u32,
    height: Option<u32>,
    tokens: &dyn TokenParser,
) -> ParsedScript {
    match tx.output.get(vout as usize) {
        Some(output) => scan_script(output.script_pubkey.as_bytes(), tx, height, tokens),
        None => {
            debug!(vout, outputs = tx.output.len(), "output index out of range");
            ParsedScript::default()
        }
    }
}

fn scan_script(
    script: &[u8],
    tx: &Transaction,
    height: Option<u32>,
    tokens: &dyn TokenParser,
) -> ParsedScript {
    let mut data = TxoData::default();
    let mut pkhash = p2pkh_hash(script).map(ByteString::from);
    let start = if pkhash.is_some() { P2PKH_LEN } else { 0 };

    let mut op_false = None;
    let mut op_if = None;
    let mut op_return = None;

    let mut pos = start;
    while pos < script.len() {
        let op_start = pos;
        let op = match read_op(script, &mut pos) {
            Ok(op) => op,
            Err(e) => {
                debug!("stopping script scan: {}", e);
                break;
            }
        };

        match op.op_code {
            OP_0 => op_false = Some(op_start),
            OP_IF => op_if = Some(op_start),
            OP_RETURN => {
                op_return.get_or_insert(op_start);
                if let Err(e) = parse_bitcom(script, tx, &mut pos, &mut data) {
                    debug!("bitcom segment unreadable: {}", e);
                }
                continue;
            }
            OP_DATA_1 if op.is_pipe() && op_return.is_some() => {
                if let Err(e) = parse_bitcom(script, tx, &mut pos, &mut data) {
                    debug!("bitcom segment unreadable: {}", e);
                }
                continue;
            }
            _ => {}
        }

        let opens_envelope = op_start >= 2
            && op.data == ORD_MARKER
            && op_if == Some(op_start - 1)
            && op_false == Some(op_start - 2);
        if opens_envelope {
            parse_inscription(script, &mut pos, height, tokens, &mut data);
        }
    }

    if let Some(lock) = parse_ordlock(script) {
        pkhash = Some(ByteString(lock.owner));
        data.listing = lock.listing;
    }

    ParsedScript { pkhash, data }
}

/// Parse every output of a transaction into `Txo` records
pub fn parse_transaction(
    tx: &Transaction,
    txid: Txid,
    height: Option<u32>,
    idx: u64,
    tokens: &dyn TokenParser,
) -> Vec<Txo> {
    tx.output
        .iter()
        .enumerate()
        .map(|(vout, output)| {
            let vout = vout as u32;
            let parsed = parse_output_script(tx, vout, height, tokens);
            Txo {
                txid,
                vout,
                outpoint: Outpoint::from_txid(&txid, vout),
                satoshis: output.value.to_sat(),
                height,
                idx,
                pkhash: parsed.pkhash,
                data: parsed.data,
            }
        })
        .collect()
}
