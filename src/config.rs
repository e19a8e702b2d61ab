//! Indexer Configuration
//!
//! Defaults mirror the production deployment. Every field can be overridden
//! from the environment.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::feed::STDIN_PATH;

/// Name under which progress is checkpointed
pub const DEFAULT_INDEXER: &str = "bsv20";

/// Number of concurrent workers
pub const DEFAULT_THREADS: usize = 64;

/// Lowest height the indexer tracks; also the reset threshold
pub const DEFAULT_MIN_HEIGHT: u32 = 783_968;

/// Blocks a height must be buried under before it is checkpointed
pub const DEFAULT_SETTLEMENT_LAG: u32 = 6;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Capacity of the queue between the feed and the dispatcher
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1_000_000;

/// Capacity of the queue between the dispatcher and the workers
pub const DEFAULT_READY_QUEUE_CAPACITY: usize = 10_000;

/// Capacity of the settled-height hand-off
pub const SETTLED_QUEUE_CAPACITY: usize = 100;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Indexer name cannot be empty")]
    EmptyIndexer,
}

/// Process configuration, read from unprefixed environment variables
/// (`THREADS`, `REDIS_URL`, ...). Unset variables keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub indexer: String,
    pub threads: usize,
    pub min_height: u32,
    pub settlement_lag: u32,
    pub redis_url: String,
    /// Feed input; `-` reads stdin
    pub feed_path: String,
    /// Upper bound on a single persistence call; 0 waits indefinitely
    pub persist_timeout_ms: u64,
    pub event_queue_capacity: usize,
    pub ready_queue_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            indexer: DEFAULT_INDEXER.to_string(),
            threads: DEFAULT_THREADS,
            min_height: DEFAULT_MIN_HEIGHT,
            settlement_lag: DEFAULT_SETTLEMENT_LAG,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            feed_path: STDIN_PATH.to_string(),
            persist_timeout_ms: 0,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            ready_queue_capacity: DEFAULT_READY_QUEUE_CAPACITY,
        }
    }
}

impl IndexerConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(environment())
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::load(environment().source(Some(vars)))
    }

    fn load(source: config::Environment) -> Result<Self, ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.indexer.is_empty() {
            return Err(ConfigError::EmptyIndexer);
        }
        if self.threads == 0 {
            return Err(ConfigError::Zero("THREADS"));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Zero("EVENT_QUEUE_CAPACITY"));
        }
        if self.ready_queue_capacity == 0 {
            return Err(ConfigError::Zero("READY_QUEUE_CAPACITY"));
        }
        Ok(())
    }

    /// Persistence deadline, `None` when unbounded
    pub fn persist_timeout(&self) -> Option<Duration> {
        (self.persist_timeout_ms > 0).then(|| Duration::from_millis(self.persist_timeout_ms))
    }

    /// Checkpoint height once `height` has been fully processed
    pub fn settled_height(&self, height: u32) -> u32 {
        height.saturating_sub(self.settlement_lag)
    }
}

// `__` nests keys, so single underscores stay part of the field name.
fn environment() -> config::Environment {
    config::Environment::default()
        .separator("__")
        .try_parsing(true)
}
