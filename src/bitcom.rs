//! Bitcom Protocol Decoding
//!
//! Auxiliary metadata embedded after an `OP_RETURN` (or a `|` continuation)
//! is introduced by a push carrying a protocol identifier. This module maps
//! identifiers to protocols and decodes MAP key/value sets, B file
//! attachments and SIGMA attestations.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use bitcoin::address::{NetworkUnchecked, ParseError};
use bitcoin::consensus::encode::{self, VarInt};
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::sign_message::{MessageSignature, MessageSignatureError, BITCOIN_SIGNED_MSG_PREFIX};
use bitcoin::{Address, Transaction};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::outpoint::txid_display_bytes;
use crate::script::{read_op, ScriptError, ScriptOp, OP_RETURN};
use crate::txo::{File, MapValue, Sigma, TxoData};

/// MAP key whose value may itself be JSON
pub const MAP_SUB_TYPE_DATA_KEY: &str = "subTypeData";

/// Bitcom protocols we decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitcomProtocol {
    /// MAP key/value sets
    Map,
    /// B file attachments
    B,
    /// SIGMA signed attestations
    Sigma,
}

impl BitcomProtocol {
    /// Returns the protocol identifier as it appears in the script
    pub fn identifier(&self) -> &'static str {
        match self {
            BitcomProtocol::Map => "1PuQa7K62MiKCtssSLKy1kh56WWU7MtUR5",
            BitcomProtocol::B => "19HxigV4QyBv3tHpQVcUEQyq1pzZVdoAut",
            BitcomProtocol::Sigma => "SIGMA",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BitcomProtocol::Map => "MAP",
            BitcomProtocol::B => "B",
            BitcomProtocol::Sigma => "SIGMA",
        }
    }
}

/// Static lookup table for protocol identifiers
static PROTOCOLS: LazyLock<HashMap<&'static [u8], BitcomProtocol>> = LazyLock::new(|| {
    [BitcomProtocol::Map, BitcomProtocol::B, BitcomProtocol::Sigma]
        .into_iter()
        .map(|p| (p.identifier().as_bytes(), p))
        .collect()
});

static SECP: LazyLock<Secp256k1<VerifyOnly>> = LazyLock::new(Secp256k1::verification_only);

/// Get the protocol for a pushed identifier, if it is one we decode
pub fn get_protocol(identifier: &[u8]) -> Option<BitcomProtocol> {
    PROTOCOLS.get(identifier).copied()
}

/// Decode one bitcom segment starting at `*pos`, which must sit right after
/// the `OP_RETURN` or `|` that introduced it.
///
/// Unknown identifiers rewind the cursor so the outer scan sees the push
/// again. Errors only surface when the identifier itself cannot be read.
pub fn parse_bitcom(
    script: &[u8],
    tx: &Transaction,
    pos: &mut usize,
    data: &mut TxoData,
) -> Result<(), ScriptError> {
    let start = *pos;
    let op = read_op(script, pos)?;

    match get_protocol(op.data) {
        Some(BitcomProtocol::Map) => parse_map(script, pos, data),
        Some(BitcomProtocol::B) => data.b = Some(parse_b(script, pos)),
        Some(BitcomProtocol::Sigma) => {
            let sigma = parse_sigma(script, tx, start, pos);
            data.sigmas.push(sigma);
        }
        None => *pos = start,
    }
    Ok(())
}

/// Read the next op unless it ends the segment. The cursor is restored when
/// it does, so the separator is seen by the outer scan.
fn next_field<'a>(script: &'a [u8], pos: &mut usize) -> Option<ScriptOp<'a>> {
    let prev = *pos;
    match read_op(script, pos) {
        Ok(op) if !op.is_bitcom_separator() => Some(op),
        _ => {
            *pos = prev;
            None
        }
    }
}

fn parse_map(script: &[u8], pos: &mut usize, data: &mut TxoData) {
    match read_op(script, pos) {
        Ok(op) if op.data == b"SET" => {}
        _ => return,
    }

    let map = data.map.get_or_insert_with(BTreeMap::new);
    loop {
        let Some(key) = next_field(script, pos) else {
            break;
        };
        let Some(value) = next_field(script, pos) else {
            break;
        };

        let (Ok(key), Ok(value)) = (
            std::str::from_utf8(key.data),
            std::str::from_utf8(value.data),
        ) else {
            debug!("skipping MAP pair with invalid utf-8");
            continue;
        };
        map.insert(
            strip_null(key).to_string(),
            MapValue::Text(strip_null(value).to_string()),
        );
    }

    if let Some(MapValue::Text(raw)) = map.get(MAP_SUB_TYPE_DATA_KEY) {
        if let Ok(nested) = serde_json::from_str::<serde_json::Value>(raw) {
            map.insert(MAP_SUB_TYPE_DATA_KEY.to_string(), MapValue::Json(nested));
        }
    }
}

/// A lone null byte stands for the empty string
fn strip_null(s: &str) -> &str {
    if s == "\0" {
        ""
    } else {
        s
    }
}

fn parse_b(script: &[u8], pos: &mut usize) -> File {
    let mut file = File::default();
    for field in 0..4 {
        let Some(op) = next_field(script, pos) else {
            break;
        };
        match field {
            0 => file.content = op.data.to_vec(),
            1 => file.mime_type = String::from_utf8_lossy(op.data).into_owned(),
            2 => file.encoding = String::from_utf8_lossy(op.data).into_owned(),
            _ => file.name = String::from_utf8_lossy(op.data).into_owned(),
        }
    }
    file.seal();
    file
}

/// `start` is the position of the SIGMA identifier push
fn parse_sigma(script: &[u8], tx: &Transaction, start: usize, pos: &mut usize) -> Sigma {
    let mut sigma = Sigma::default();
    for field in 0..4 {
        let Some(op) = next_field(script, pos) else {
            break;
        };
        match field {
            0 => sigma.algorithm = String::from_utf8_lossy(op.data).into_owned(),
            1 => sigma.address = String::from_utf8_lossy(op.data).into_owned(),
            2 => sigma.signature = op.data.into(),
            _ => {
                if let Ok(vin) = std::str::from_utf8(op.data).unwrap_or_default().parse::<u32>() {
                    sigma.vin = vin;
                }
            }
        }
    }

    let Some(signed_end) = signed_script_end(script, start) else {
        return sigma;
    };
    let Some(input) = tx.input.get(sigma.vin as usize) else {
        debug!(vin = sigma.vin, "SIGMA references missing input");
        return sigma;
    };

    let mut outpoint = txid_display_bytes(&input.previous_output.txid).to_vec();
    outpoint.extend_from_slice(&input.previous_output.vout.to_le_bytes());
    let hash = message_hash(&outpoint, &script[..signed_end]);

    match verify_signed_message(&sigma.address, sigma.signature.as_slice(), &hash) {
        Ok(true) => sigma.valid = true,
        Ok(false) => debug!(address = %sigma.address, "SIGMA signer mismatch"),
        Err(e) => debug!("SIGMA verification failed: {}", e),
    }
    sigma
}

/// End of the script region covered by a SIGMA signature: everything before
/// the `OP_RETURN` or `|` push that introduced the segment
fn signed_script_end(script: &[u8], start: usize) -> Option<usize> {
    let marker = start.checked_sub(1)?;
    match script.get(marker)? {
        &OP_RETURN => Some(marker),
        &b'|' => marker.checked_sub(1),
        _ => None,
    }
}

/// `sha256(sha256(outpoint) || sha256(script))`
pub fn message_hash(outpoint: &[u8], signed_script: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(Sha256::digest(outpoint));
    hasher.update(Sha256::digest(signed_script));
    hasher.finalize().into()
}

/// Digest a Bitcoin signed message commits to
pub fn signed_message_digest(message: &[u8]) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(BITCOIN_SIGNED_MSG_PREFIX);
    engine.input(&encode::serialize(&VarInt::from(message.len())));
    engine.input(message);
    sha256d::Hash::from_engine(engine)
}

#[derive(Error, Debug)]
enum VerifyError {
    #[error("invalid address: {0}")]
    Address(#[from] ParseError),

    #[error(transparent)]
    Signature(#[from] MessageSignatureError),
}

/// Check that a compact signature over `message` recovers to `address`
fn verify_signed_message(
    address: &str,
    signature: &[u8],
    message: &[u8],
) -> Result<bool, VerifyError> {
    // The recovered key is compared as a pubkey hash, so the address network is irrelevant.
    let address = address.parse::<Address<NetworkUnchecked>>()?.assume_checked();
    let sig = MessageSignature::from_slice(signature)?;
    Ok(sig.is_signed_by_address(&*SECP, &address, signed_message_digest(message))?)
}
