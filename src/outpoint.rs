//! Compact Binary Identifiers
//!
//! `Outpoint` is a 36-byte reference to one output of one transaction: the 32-byte
//! txid in display order followed by the output index as a big-endian u32.
//! `ByteString` is an opaque byte blob that serializes to lowercase hex.

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of an encoded outpoint
pub const OUTPOINT_LEN: usize = 36;

/// Errors that can occur while decoding an outpoint
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OutpointError {
    #[error("Invalid outpoint length: {0}")]
    InvalidLength(usize),

    #[error("Invalid txid hex: {0}")]
    InvalidTxid(String),

    #[error("Missing output index separator")]
    MissingSeparator,

    #[error("Invalid output index: {0}")]
    InvalidVout(String),
}

/// Reference to a single transaction output
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Outpoint([u8; OUTPOINT_LEN]);

impl Outpoint {
    /// Build an outpoint from a display-order txid and an output index
    pub fn new(txid: [u8; 32], vout: u32) -> Self {
        let mut bytes = [0u8; OUTPOINT_LEN];
        bytes[..32].copy_from_slice(&txid);
        bytes[32..].copy_from_slice(&vout.to_be_bytes());
        Self(bytes)
    }

    /// Build an outpoint from a transaction id as decoded off the wire
    pub fn from_txid(txid: &Txid, vout: u32) -> Self {
        Self::new(txid_display_bytes(txid), vout)
    }

    /// Decode the raw 36-byte form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OutpointError> {
        let raw: [u8; OUTPOINT_LEN] = bytes
            .try_into()
            .map_err(|_| OutpointError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }

    /// The txid portion, in display order
    pub fn txid(&self) -> &[u8] {
        &self.0[..32]
    }

    /// The output index
    pub fn vout(&self) -> u32 {
        u32::from_be_bytes([self.0[32], self.0[33], self.0[34], self.0[35]])
    }

    pub fn as_bytes(&self) -> &[u8; OUTPOINT_LEN] {
        &self.0
    }
}

/// Txid bytes in the order they are displayed (reverse of wire order)
pub fn txid_display_bytes(txid: &Txid) -> [u8; 32] {
    let mut bytes = txid.to_byte_array();
    bytes.reverse();
    bytes
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", hex::encode(self.txid()), self.vout())
    }
}

impl fmt::Debug for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Outpoint({})", self)
    }
}

impl FromStr for Outpoint {
    type Err = OutpointError;

    /// Accepts `<txid>_<vout>` and `<txid>.<vout>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 66 || !s.is_char_boundary(64) {
            return Err(OutpointError::InvalidLength(s.len()));
        }
        let (txid_hex, rest) = s.split_at(64);
        let vout_str = rest
            .strip_prefix('_')
            .or_else(|| rest.strip_prefix('.'))
            .ok_or(OutpointError::MissingSeparator)?;

        let mut txid = [0u8; 32];
        hex::decode_to_slice(txid_hex, &mut txid)
            .map_err(|e| OutpointError::InvalidTxid(e.to_string()))?;
        let vout = vout_str
            .parse::<u32>()
            .map_err(|e| OutpointError::InvalidVout(e.to_string()))?;

        Ok(Self::new(txid, vout))
    }
}

impl Serialize for Outpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Outpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Byte blob that serializes to hex
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteString(#[serde(with = "hex::serde")] pub Vec<u8>);

impl ByteString {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for ByteString {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for ByteString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteString({})", hex::encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TXID_HEX: &str = "9f0e4c8a1b2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f708192a3b4c5d6e7f8091a2b";

    // ==================== Outpoint tests ====================

    #[test]
    fn test_outpoint_layout_is_txid_then_big_endian_vout() {
        let op = Outpoint::new([0xaa; 32], 1);
        assert_eq!(&op.as_bytes()[..32], &[0xaa; 32]);
        assert_eq!(&op.as_bytes()[32..], &[0, 0, 0, 1]);
        assert_eq!(op.vout(), 1);
    }

    #[test]
    fn test_outpoint_display() {
        let op: Outpoint = format!("{}_7", TXID_HEX).parse().unwrap();
        assert_eq!(op.to_string(), format!("{}_7", TXID_HEX));
    }

    #[test]
    fn test_outpoint_parse_dot_separator() {
        let underscore: Outpoint = format!("{}_12", TXID_HEX).parse().unwrap();
        let dot: Outpoint = format!("{}.12", TXID_HEX).parse().unwrap();
        assert_eq!(underscore, dot);
    }

    #[test]
    fn test_outpoint_parse_rejects_short_input() {
        assert!(matches!(
            "abcd_1".parse::<Outpoint>(),
            Err(OutpointError::InvalidLength(6))
        ));
    }

    #[test]
    fn test_outpoint_parse_rejects_bad_separator() {
        let result = format!("{}:1", TXID_HEX).parse::<Outpoint>();
        assert_eq!(result, Err(OutpointError::MissingSeparator));
    }

    #[test]
    fn test_outpoint_parse_rejects_bad_hex() {
        let bad = format!("{}zz_1", &TXID_HEX[..62]);
        assert!(matches!(bad.parse::<Outpoint>(), Err(OutpointError::InvalidTxid(_))));
    }

    #[test]
    fn test_outpoint_parse_rejects_bad_vout() {
        let bad = format!("{}_-1", TXID_HEX);
        assert!(matches!(bad.parse::<Outpoint>(), Err(OutpointError::InvalidVout(_))));
    }

    #[test]
    fn test_outpoint_from_bytes_length() {
        assert!(Outpoint::from_bytes(&[0u8; 36]).is_ok());
        assert_eq!(
            Outpoint::from_bytes(&[0u8; 35]),
            Err(OutpointError::InvalidLength(35))
        );
    }

    #[test]
    fn test_outpoint_from_txid_uses_display_order() {
        let txid: Txid = TXID_HEX.parse().unwrap();
        let op = Outpoint::from_txid(&txid, 3);
        assert_eq!(hex::encode(op.txid()), TXID_HEX);
        assert_eq!(op.to_string(), format!("{}_3", TXID_HEX));
    }

    #[test]
    fn test_outpoint_json_is_string() {
        let op = Outpoint::new([0x01; 32], 2);
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, format!("\"{}_2\"", "01".repeat(32)));
        let back: Outpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    proptest! {
        #[test]
        fn prop_outpoint_text_round_trip(txid in any::<[u8; 32]>(), vout in any::<u32>()) {
            let op = Outpoint::new(txid, vout);
            let parsed: Outpoint = op.to_string().parse().unwrap();
            prop_assert_eq!(parsed.as_bytes(), op.as_bytes());
        }
    }

    // ==================== ByteString tests ====================

    #[test]
    fn test_byte_string_serializes_to_hex() {
        let bs = ByteString(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(serde_json::to_string(&bs).unwrap(), "\"deadbeef\"");
    }

    #[test]
    fn test_byte_string_deserialize_invalid_hex() {
        let result: Result<ByteString, _> = serde_json::from_str("\"xyz\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_byte_string_field_round_trips_in_json() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Holder {
            hash: ByteString,
        }
        let holder = Holder {
            hash: ByteString(vec![0x00, 0xff]),
        };
        let json = serde_json::to_string(&holder).unwrap();
        assert_eq!(json, r#"{"hash":"00ff"}"#);
        assert_eq!(serde_json::from_str::<Holder>(&json).unwrap(), holder);
    }

    #[test]
    fn test_byte_string_deserialize_uppercase_hex() {
        let bs: ByteString = serde_json::from_str("\"DEADBEEF\"").unwrap();
        assert_eq!(bs.as_slice(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_byte_string_empty() {
        let bs: ByteString = serde_json::from_str("\"\"").unwrap();
        assert!(bs.is_empty());
    }
}
