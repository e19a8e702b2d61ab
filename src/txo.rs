//! Parsed Output Records
//!
//! Types produced by the script parser for a single transaction output. All
//! `TxoData` fields stay empty unless the matching protocol was recognized.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bsv20::Bsv20;
use crate::outpoint::{ByteString, Outpoint};

/// One transaction output under analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txo {
    pub txid: Txid,
    pub vout: u32,
    pub outpoint: Outpoint,
    pub satoshis: u64,
    /// Block height, absent while unconfirmed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Position of the owning transaction within its block
    pub idx: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkhash: Option<ByteString>,
    pub data: TxoData,
}

/// Aggregated decode results for one output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxoData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<String, MapValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b: Option<File>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sigmas: Vec<Sigma>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inscription: Option<Inscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing: Option<Listing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bsv20: Option<Bsv20>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub types: BTreeSet<TxoTag>,
}

impl Txo {
    /// Serialize the record to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a record from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl TxoData {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Category of payload detected in an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxoTag {
    Inscription,
    Json,
    Text,
    Bsv20,
}

impl TxoTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxoTag::Inscription => "inscription",
            TxoTag::Json => "json",
            TxoTag::Text => "text",
            TxoTag::Bsv20 => "bsv20",
        }
    }
}

/// Value of a MAP key: plain text, or structured data when the key is known
/// to carry nested JSON and the text parsed cleanly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapValue {
    Text(String),
    Json(serde_json::Value),
}

impl MapValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MapValue::Text(s) => Some(s),
            MapValue::Json(_) => None,
        }
    }
}

/// Embedded file. `size` and `hash` are always derived from `content`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub hash: ByteString,
    pub size: u32,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub encoding: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub name: String,
    #[serde(with = "hex::serde", default)]
    pub content: Vec<u8>,
}

impl File {
    pub fn new(content: Vec<u8>) -> Self {
        let mut file = Self {
            content,
            ..Default::default()
        };
        file.seal();
        file
    }

    /// Recompute size and digest from the current content
    pub fn seal(&mut self) {
        self.size = self.content.len() as u32;
        self.hash = ByteString(Sha256::digest(&self.content).to_vec());
    }
}

/// Signed attestation over the transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sigma {
    pub algorithm: String,
    pub address: String,
    pub signature: ByteString,
    pub vin: u32,
    pub valid: bool,
}

/// Content inscribed through the ord envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inscription {
    pub file: File,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<BTreeSet<String>>,
}

/// Marketplace listing extracted from an ordlock script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub price: u64,
    pub payout: ByteString,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_digest_of_empty_content() {
        let file = File::new(Vec::new());
        assert_eq!(file.size, 0);
        assert_eq!(
            hex::encode(file.hash.as_slice()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_digest_matches_sha256() {
        let file = File::new(b"hello".to_vec());
        assert_eq!(file.size, 5);
        assert_eq!(file.hash.as_slice(), Sha256::digest(b"hello").as_slice());
    }

    #[test]
    fn test_txo_data_default_is_empty() {
        assert!(TxoData::default().is_empty());
        let data = TxoData {
            types: BTreeSet::from([TxoTag::Text]),
            ..Default::default()
        };
        assert!(!data.is_empty());
    }

    #[test]
    fn test_tags_serialize_lowercase() {
        let tags = BTreeSet::from([TxoTag::Inscription, TxoTag::Bsv20]);
        assert_eq!(
            serde_json::to_string(&tags).unwrap(),
            "[\"inscription\",\"bsv20\"]"
        );
        assert_eq!(TxoTag::Json.as_str(), "json");
    }

    #[test]
    fn test_map_value_untagged_json() {
        let text = MapValue::Text("demo".to_string());
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"demo\"");
        assert_eq!(text.as_text(), Some("demo"));

        let nested = MapValue::Json(serde_json::json!({"a": 1}));
        assert_eq!(serde_json::to_string(&nested).unwrap(), "{\"a\":1}");
        assert_eq!(nested.as_text(), None);
    }

    #[test]
    fn test_txo_data_skips_absent_fields() {
        let json = serde_json::to_string(&TxoData::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
