//! Transaction Feed
//!
//! The indexer consumes an ordered stream of transaction and status events.
//! `JsonLinesFeed` reads that stream as newline-delimited JSON from a file or
//! from stdin, pushing events into the bounded event queue so a slow consumer
//! applies backpressure to the reader.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Feed path meaning "read standard input"
pub const STDIN_PATH: &str = "-";

/// Errors that can occur while subscribing to or reading the feed
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Feed file not found at path: {0}")]
    NotFound(String),

    #[error("Failed to open feed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed feed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Already subscribed")]
    AlreadySubscribed,
}

/// One event delivered by the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    /// A transaction, confirmed (`height > 0`) or from the mempool (`height == 0`)
    Transaction {
        id: String,
        #[serde(with = "hex::serde")]
        transaction: Vec<u8>,
        #[serde(default)]
        height: u32,
        #[serde(default)]
        idx: u64,
    },
    /// A control signal from the feed
    Status {
        code: u32,
        #[serde(default)]
        height: u32,
        #[serde(default)]
        message: String,
    },
}

impl FeedEvent {
    /// Parse one JSON line
    pub fn from_json(line: &str) -> Result<Self, FeedError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Serialize to a single JSON line
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Source of feed events
#[async_trait]
pub trait Feed: Send {
    /// Start delivering events from `from_height` onward into `events`
    async fn subscribe(
        &mut self,
        from_height: u32,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<(), FeedError>;

    /// Stop delivering events. Safe to call more than once.
    async fn unsubscribe(&mut self);
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// Where a `JsonLinesFeed` reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Stdin,
    File(PathBuf),
}

impl FeedSource {
    /// `-` selects stdin; anything else is a file path (with `~/` expanded)
    pub fn from_path(path: &str) -> Self {
        if path == STDIN_PATH {
            FeedSource::Stdin
        } else {
            FeedSource::File(PathBuf::from(expand_path(path)))
        }
    }
}

/// Newline-delimited JSON feed
pub struct JsonLinesFeed {
    source: FeedSource,
    reader: Option<JoinHandle<()>>,
}

impl JsonLinesFeed {
    pub fn new(source: FeedSource) -> Self {
        Self {
            source,
            reader: None,
        }
    }

    /// Create a feed from a path, `-` meaning stdin
    pub fn with_path(path: &str) -> Self {
        Self::new(FeedSource::from_path(path))
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    /// Whether the reader task is still delivering events
    pub fn is_active(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.is_finished())
    }
}

#[async_trait]
impl Feed for JsonLinesFeed {
    async fn subscribe(
        &mut self,
        from_height: u32,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<(), FeedError> {
        if self.is_active() {
            return Err(FeedError::AlreadySubscribed);
        }

        let reader = match &self.source {
            FeedSource::Stdin => {
                info!("Subscribing to stdin from height {}", from_height);
                tokio::spawn(read_events(tokio::io::stdin(), from_height, events))
            }
            FeedSource::File(path) => {
                if !Path::new(path).exists() {
                    return Err(FeedError::NotFound(path.display().to_string()));
                }
                let file = tokio::fs::File::open(path).await?;
                info!("Subscribing to {} from height {}", path.display(), from_height);
                tokio::spawn(read_events(file, from_height, events))
            }
        };
        self.reader = Some(reader);
        Ok(())
    }

    async fn unsubscribe(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            info!("Unsubscribed from feed");
        }
    }
}

impl Drop for JsonLinesFeed {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Whether an event at or after `from_height` should be delivered
fn wanted(event: &FeedEvent, from_height: u32) -> bool {
    match event {
        FeedEvent::Transaction { height, .. } => *height == 0 || *height >= from_height,
        FeedEvent::Status { .. } => true,
    }
}

async fn read_events<R>(input: R, from_height: u32, events: mpsc::Sender<FeedEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0u64;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Feed read failed: {}", e);
                break;
            }
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event = match FeedEvent::from_json(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping feed line {}: {}", line_no, e);
                continue;
            }
        };
        if !wanted(&event, from_height) {
            continue;
        }
        if events.send(event).await.is_err() {
            debug!("Event queue closed, stopping feed reader");
            return;
        }
    }
    debug!("Feed reached end of input after {} lines", line_no);
}
