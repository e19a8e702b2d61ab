//! Token Operation Sub-Parser
//!
//! The script parser hands qualifying inscription content to a `TokenParser`.
//! `Bsv20Parser` understands the plain `bsv-20` JSON envelope
//! (`deploy` / `mint` / `transfer`); richer validation happens after settlement.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol marker carried in the `p` field
pub const BSV20_PROTOCOL: &str = "bsv-20";

/// Parses token-operation payloads out of inscription content
pub trait TokenParser: Send + Sync {
    /// Returns `None` when the content is not a token operation
    fn parse(&self, content: &[u8], height: Option<u32>) -> Option<Bsv20>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bsv20Op {
    Deploy,
    Mint,
    Transfer,
}

impl Bsv20Op {
    fn parse_op(op: &str) -> Option<Self> {
        match op {
            "deploy" => Some(Bsv20Op::Deploy),
            "mint" => Some(Bsv20Op::Mint),
            "transfer" => Some(Bsv20Op::Transfer),
            _ => None,
        }
    }
}

/// Token operation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bsv20 {
    pub op: Bsv20Op,
    pub ticker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Default token parser for the `bsv-20` JSON envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct Bsv20Parser;

impl TokenParser for Bsv20Parser {
    fn parse(&self, content: &[u8], height: Option<u32>) -> Option<Bsv20> {
        let value: Value = serde_json::from_slice(content).ok()?;
        let obj = value.as_object()?;

        if obj.get("p")?.as_str()? != BSV20_PROTOCOL {
            return None;
        }
        let op = Bsv20Op::parse_op(&obj.get("op")?.as_str()?.to_lowercase())?;
        let ticker = obj.get("tick")?.as_str()?.to_string();
        if ticker.is_empty() {
            return None;
        }

        let amount = numeric_field(obj.get("amt"))?;
        let max = numeric_field(obj.get("max"))?;
        let limit = numeric_field(obj.get("lim"))?;
        let decimals = match numeric_field(obj.get("dec"))? {
            Some(dec) => Some(u8::try_from(dec).ok().filter(|d| *d <= 18)?),
            None => None,
        };

        match op {
            Bsv20Op::Deploy if max.is_none() => return None,
            Bsv20Op::Mint | Bsv20Op::Transfer if amount.is_none() => return None,
            _ => {}
        }

        Some(Bsv20 {
            op,
            ticker,
            amount,
            max,
            limit,
            decimals,
            height,
        })
    }
}

/// Absent fields are `Some(None)`; present fields must be decimal strings
fn numeric_field(value: Option<&Value>) -> Option<Option<u64>> {
    match value {
        None => Some(None),
        Some(v) => v.as_str()?.parse::<u64>().ok().map(Some),
    }
}
