//! BSV20 Indexer Library
//!
//! This crate provides components for ingesting an ordered transaction feed,
//! parsing every output for embedded data protocols (MAP, B, SIGMA, ord
//! inscriptions, ordlock listings, token operations), and checkpointing
//! progress behind a settlement lag.

pub mod bitcom;
pub mod bsv20;
pub mod config;
pub mod decoder;
pub mod feed;
pub mod graph;
pub mod indexer;
pub mod inscription;
pub mod ordlock;
pub mod outpoint;
pub mod parser;
pub mod script;
pub mod store;
pub mod txo;
pub mod worker;

// Re-export commonly used types
pub use config::IndexerConfig;
pub use decoder::{decode_transaction, DecodeError};
pub use feed::{Feed, FeedEvent, JsonLinesFeed};
pub use graph::{TxnGraph, TxnNode};
pub use indexer::{Indexer, IndexerError, Shutdown};
pub use outpoint::{ByteString, Outpoint};
pub use parser::{parse_output_script, parse_transaction};
pub use store::{MemoryStore, RedisStore};
pub use txo::{Txo, TxoData};
