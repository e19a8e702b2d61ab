//! Persistence Collaborators
//!
//! The coordinator and workers talk to storage through four narrow traits:
//! checkpoints, Txo persistence, "indexed" notifications, and settlement.
//! `RedisStore` backs the first three with Redis; `MemoryStore` keeps
//! everything in-process for tests and dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, info};

use crate::outpoint::Outpoint;
use crate::txo::Txo;

/// Redis hash holding one checkpoint field per indexer name
pub const PROGRESS_KEY: &str = "progress";

/// Default pub/sub channel for "indexed" notifications
pub const DEFAULT_CHANNEL: &str = "indexed";

/// Key prefix for persisted Txo records
pub const TXO_KEY_PREFIX: &str = "txo:";

/// Raise a checkpoint only when the new height is larger; returns the stored height
const ADVANCE_CHECKPOINT_LUA: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
local height = tonumber(ARGV[2])
if height > current then
    redis.call('HSET', KEYS[1], ARGV[1], height)
    return height
end
return current
"#;

/// Errors that can occur while talking to storage
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable per-indexer progress marker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Checkpoints: Send + Sync {
    /// Stored height for `indexer`, if any
    async fn load(&self, indexer: &str) -> Result<Option<u32>, StoreError>;

    /// Raise the checkpoint to `height`; a lower height leaves it untouched.
    /// Returns the height stored afterwards.
    async fn advance(&self, indexer: &str, height: u32) -> Result<u32, StoreError>;
}

/// Destination for parsed outputs
#[async_trait]
pub trait TxoSink: Send + Sync {
    async fn save_txo(&self, txo: &Txo) -> Result<(), StoreError>;
}

/// Announces that every transaction up to a height has been processed
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn indexed(&self, height: u32) -> Result<(), StoreError>;
}

/// Post-processing hook for heights past the settlement lag
#[async_trait]
pub trait SettlementHandler: Send + Sync {
    async fn settle(&self, height: u32) -> Result<(), StoreError>;
}

/// Settlement handler that only records the height in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSettlement;

#[async_trait]
impl SettlementHandler for LogSettlement {
    async fn settle(&self, height: u32) -> Result<(), StoreError> {
        info!("Settled height {}", height);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store implementing every collaborator trait
#[derive(Debug, Default)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<String, u32>>,
    txos: Mutex<Vec<Txo>>,
    notifications: Mutex<Vec<u32>>,
    settled: Mutex<Vec<u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a checkpoint
    pub fn with_checkpoint(indexer: &str, height: u32) -> Self {
        let store = Self::default();
        lock(&store.checkpoints).insert(indexer.to_string(), height);
        store
    }

    pub fn checkpoint(&self, indexer: &str) -> Option<u32> {
        lock(&self.checkpoints).get(indexer).copied()
    }

    /// Saved records in the order they were persisted
    pub fn txos(&self) -> Vec<Txo> {
        lock(&self.txos).clone()
    }

    /// Latest record saved for an outpoint
    pub fn txo(&self, outpoint: &Outpoint) -> Option<Txo> {
        lock(&self.txos)
            .iter()
            .rev()
            .find(|t| t.outpoint == *outpoint)
            .cloned()
    }

    pub fn notifications(&self) -> Vec<u32> {
        lock(&self.notifications).clone()
    }

    pub fn settled(&self) -> Vec<u32> {
        lock(&self.settled).clone()
    }
}

#[async_trait]
impl Checkpoints for MemoryStore {
    async fn load(&self, indexer: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.checkpoint(indexer))
    }

    async fn advance(&self, indexer: &str, height: u32) -> Result<u32, StoreError> {
        let mut checkpoints = lock(&self.checkpoints);
        let current = checkpoints.entry(indexer.to_string()).or_insert(0);
        if height > *current {
            *current = height;
        }
        Ok(*current)
    }
}

#[async_trait]
impl TxoSink for MemoryStore {
    async fn save_txo(&self, txo: &Txo) -> Result<(), StoreError> {
        lock(&self.txos).push(txo.clone());
        Ok(())
    }
}

#[async_trait]
impl Notifier for MemoryStore {
    async fn indexed(&self, height: u32) -> Result<(), StoreError> {
        lock(&self.notifications).push(height);
        Ok(())
    }
}

#[async_trait]
impl SettlementHandler for MemoryStore {
    async fn settle(&self, height: u32) -> Result<(), StoreError> {
        lock(&self.settled).push(height);
        Ok(())
    }
}

/// Redis key for a persisted Txo
pub fn txo_key(outpoint: &Outpoint) -> String {
    format!("{}{}", TXO_KEY_PREFIX, outpoint)
}

/// Redis-backed checkpoints, Txo persistence and notifications
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    channel: String,
}

impl RedisStore {
    /// Create a store over an established connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `channel` - The pub/sub channel for "indexed" notifications
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    /// Create a store with the default notification channel
    pub fn with_default_channel(connection: MultiplexedConnection) -> Self {
        Self::new(connection, DEFAULT_CHANNEL)
    }

    /// Open a connection to `url` and wrap it
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis at {}", url);
        Ok(Self::with_default_channel(connection))
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Checkpoints for RedisStore {
    async fn load(&self, indexer: &str) -> Result<Option<u32>, StoreError> {
        let mut conn = self.connection.clone();
        let height: Option<u32> = conn.hget(PROGRESS_KEY, indexer).await?;
        Ok(height)
    }

    async fn advance(&self, indexer: &str, height: u32) -> Result<u32, StoreError> {
        let mut conn = self.connection.clone();
        let stored: u32 = redis::Script::new(ADVANCE_CHECKPOINT_LUA)
            .key(PROGRESS_KEY)
            .arg(indexer)
            .arg(height)
            .invoke_async(&mut conn)
            .await?;
        debug!("Checkpoint for {} now {}", indexer, stored);
        Ok(stored)
    }
}

#[async_trait]
impl TxoSink for RedisStore {
    async fn save_txo(&self, txo: &Txo) -> Result<(), StoreError> {
        let json = txo.to_json()?;
        let mut conn = self.connection.clone();
        let _: () = conn.set(txo_key(&txo.outpoint), json).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for RedisStore {
    async fn indexed(&self, height: u32) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let subscribers: i64 = conn.publish(&self.channel, height.to_string()).await?;
        debug!("Published indexed {} to {} subscribers", height, subscribers);
        Ok(())
    }
}
