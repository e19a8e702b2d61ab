//! Transaction Decoder
//!
//! Decodes raw transaction bytes delivered by the feed. A transaction that
//! cannot be decoded means the feed is corrupt; callers treat it as fatal.

use bitcoin::consensus::encode;
use bitcoin::Transaction;
use thiserror::Error;

/// Errors that can occur during transaction decoding
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to decode transaction: {0}")]
    Consensus(#[from] encode::Error),

    #[error("Empty input data")]
    EmptyInput,
}

/// Decode a transaction from its consensus serialization
///
/// # Arguments
/// * `raw` - The serialized transaction bytes
///
/// # Returns
/// The decoded transaction, or an error if the bytes are not exactly one transaction
pub fn decode_transaction(raw: &[u8]) -> Result<Transaction, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::EmptyInput);
    }
    Ok(encode::deserialize(raw)?)
}
