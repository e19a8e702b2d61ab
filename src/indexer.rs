//! Indexing Coordinator
//!
//! Drives the feed: admits transactions into the dependency graph, hands ready
//! ones to the worker pool, and at every block-complete status waits for the
//! graph to drain before notifying, checkpointing, and settling.
//!
//! Checkpoint writes only happen after a full drain, so a restart resumes
//! from a point at or before the last fully-processed block.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bsv20::{Bsv20Parser, TokenParser};
use crate::config::{ConfigError, IndexerConfig, SETTLED_QUEUE_CAPACITY};
use crate::decoder::{decode_transaction, DecodeError};
use crate::feed::{Feed, FeedError, FeedEvent};
use crate::graph::{Admission, TxnGraph, TxnNode};
use crate::store::{
    Checkpoints, LogSettlement, Notifier, SettlementHandler, StoreError, TxoSink,
};
use crate::worker::{WorkerContext, WorkerError, WorkerPool};

/// Status code: every transaction of the reported block has been delivered
pub const STATUS_BLOCK_COMPLETE: u32 = 200;

/// Status code: the feed is finished and the indexer should exit
pub const STATUS_TERMINAL: u32 = 999;

/// How long a clean stop waits for queued settlements before abandoning them
pub const SETTLEMENT_GRACE: Duration = Duration::from_secs(5);

/// Errors that stop the indexer. All of them are fatal.
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Failed to decode transaction {id}: {source}")]
    Decode {
        id: String,
        #[source]
        source: DecodeError,
    },

    #[error("Feed reset to height {height}, below minimum tracked height {min_height}")]
    Reset { height: u32, min_height: u32 },

    #[error("Checkpoint write for height {height} failed: {source}")]
    Checkpoint {
        height: u32,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ready queue closed while dispatching")]
    WorkersStopped,
}

/// Why the indexer stopped without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// The feed sent the terminal status
    Terminal { message: String },
    /// The feed ran out of events
    FeedClosed,
    /// The process was asked to stop
    Signal,
}

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Streaming,
    /// Waiting for every admitted transaction to finish
    Draining(u32),
    /// Notifying and checkpointing a fully processed block
    Settling(u32),
}

pub struct Indexer {
    config: IndexerConfig,
    graph: Arc<TxnGraph>,
    checkpoints: Arc<dyn Checkpoints>,
    sink: Arc<dyn TxoSink>,
    notifier: Arc<dyn Notifier>,
    settlement: Arc<dyn SettlementHandler>,
    tokens: Arc<dyn TokenParser>,
    settle_grace: Duration,
    phase: Phase,
}

impl Indexer {
    /// Create an indexer backed by a single store for checkpoints, outputs and notifications
    pub fn new<S>(config: IndexerConfig, store: Arc<S>) -> Self
    where
        S: Checkpoints + TxoSink + Notifier + 'static,
    {
        Self::with_parts(config, store.clone(), store.clone(), store)
    }

    pub fn with_parts(
        config: IndexerConfig,
        checkpoints: Arc<dyn Checkpoints>,
        sink: Arc<dyn TxoSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            graph: Arc::new(TxnGraph::new()),
            checkpoints,
            sink,
            notifier,
            settlement: Arc::new(LogSettlement),
            tokens: Arc::new(Bsv20Parser),
            settle_grace: SETTLEMENT_GRACE,
            phase: Phase::Streaming,
        }
    }

    /// Replace the settlement hook
    pub fn with_settlement(mut self, settlement: Arc<dyn SettlementHandler>) -> Self {
        self.settlement = settlement;
        self
    }

    /// Bound the wait for queued settlements on a clean stop
    pub fn with_settlement_grace(mut self, grace: Duration) -> Self {
        self.settle_grace = grace;
        self
    }

    /// Replace the token sub-parser
    pub fn with_token_parser(mut self, tokens: Arc<dyn TokenParser>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Height to subscribe from: the stored checkpoint, but never below the minimum
    pub async fn start_height(&self) -> Result<u32, IndexerError> {
        let checkpoint = self.checkpoints.load(&self.config.indexer).await?;
        Ok(checkpoint.unwrap_or(0).max(self.config.min_height))
    }

    /// Subscribe to `feed` and index until a shutdown condition or a fatal error.
    ///
    /// The feed is unsubscribed on every exit path.
    pub async fn run<F: Feed + ?Sized>(&mut self, feed: &mut F) -> Result<Shutdown, IndexerError> {
        let from_height = self.start_height().await?;
        info!(
            "Indexer {} starting from height {}",
            self.config.indexer, from_height
        );

        let (event_tx, mut events) = mpsc::channel(self.config.event_queue_capacity);
        feed.subscribe(from_height, event_tx).await?;

        let outcome = self.process(&mut events).await;
        feed.unsubscribe().await;

        match &outcome {
            Ok(shutdown) => info!("Indexer stopped: {:?}", shutdown),
            Err(e) => error!("Indexer failed: {}", e),
        }
        outcome
    }

    /// Consume events until a shutdown condition or a fatal error
    pub async fn process(
        &mut self,
        events: &mut mpsc::Receiver<FeedEvent>,
    ) -> Result<Shutdown, IndexerError> {
        let (ready_tx, ready_rx) = mpsc::channel(self.config.ready_queue_capacity);
        let mut workers = WorkerPool::spawn(
            self.config.threads,
            ready_rx,
            WorkerContext {
                graph: Arc::clone(&self.graph),
                sink: Arc::clone(&self.sink),
                tokens: Arc::clone(&self.tokens),
                persist_timeout: self.config.persist_timeout(),
                ready_tx: ready_tx.clone(),
            },
        );

        let (settled_tx, settled_rx) = mpsc::channel(SETTLED_QUEUE_CAPACITY);
        let mut settler = tokio::spawn(run_settlement(Arc::clone(&self.settlement), settled_rx));

        let outcome = loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Feed closed, finishing {} outstanding transactions", self.graph.outstanding());
                        break self.drain(&mut workers).await.map(|()| Shutdown::FeedClosed);
                    };
                    match self.handle_event(event, &ready_tx, &settled_tx, &mut workers).await {
                        Ok(Some(shutdown)) => break Ok(shutdown),
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
                err = workers.failure() => break Err(err.into()),
            }
        };

        workers.shutdown();
        drop(settled_tx);
        if outcome.is_ok() {
            // Let queued settlements finish on a clean stop.
            match tokio::time::timeout(self.settle_grace, &mut settler).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Settlement task ended abnormally: {}", e),
                Err(_) => {
                    warn!("Settlement still running after {:?}, abandoning it", self.settle_grace);
                    settler.abort();
                }
            }
        } else {
            settler.abort();
        }
        outcome
    }

    async fn handle_event(
        &mut self,
        event: FeedEvent,
        ready_tx: &mpsc::Sender<Arc<TxnNode>>,
        settled_tx: &mpsc::Sender<u32>,
        workers: &mut WorkerPool,
    ) -> Result<Option<Shutdown>, IndexerError> {
        match event {
            FeedEvent::Transaction {
                id,
                transaction,
                height,
                idx,
            } => {
                self.admit(id, &transaction, height, idx, ready_tx, workers).await?;
                Ok(None)
            }
            FeedEvent::Status {
                code,
                height,
                message,
            } => {
                if code == STATUS_TERMINAL {
                    info!("Feed finished: {}", message);
                    return Ok(Some(Shutdown::Terminal { message }));
                }
                if height > 0 && height < self.config.min_height {
                    error!(
                        "Feed reset to {} below minimum {} ({}): {}",
                        height, self.config.min_height, code, message
                    );
                    return Err(IndexerError::Reset {
                        height,
                        min_height: self.config.min_height,
                    });
                }
                if code == STATUS_BLOCK_COMPLETE {
                    self.complete_block(height, settled_tx, workers).await?;
                } else {
                    info!("Feed status {} at {}: {}", code, height, message);
                }
                Ok(None)
            }
        }
    }

    async fn admit(
        &self,
        id: String,
        raw: &[u8],
        height: u32,
        idx: u64,
        ready_tx: &mpsc::Sender<Arc<TxnNode>>,
        workers: &mut WorkerPool,
    ) -> Result<(), IndexerError> {
        let tx = match decode_transaction(raw) {
            Ok(tx) => tx,
            Err(source) => return Err(IndexerError::Decode { id, source }),
        };

        let node = TxnNode {
            id,
            tx,
            height: (height > 0).then_some(height),
            idx,
        };
        match self.graph.admit(node) {
            Admission::Ready(node) => {
                if ready_tx.send(node).await.is_err() {
                    // Every worker has exited; surface why.
                    return Err(match workers.first_failure().await {
                        Some(e) => e.into(),
                        None => IndexerError::WorkersStopped,
                    });
                }
            }
            Admission::Pending(parents) => debug!("Transaction waiting on {} parents", parents),
            Admission::Duplicate => debug!("Ignoring duplicate transaction"),
        }
        Ok(())
    }

    /// Wait until every admitted transaction has been processed
    async fn drain(&self, workers: &mut WorkerPool) -> Result<(), IndexerError> {
        tokio::select! {
            _ = self.graph.wait_drained() => Ok(()),
            err = workers.failure() => Err(err.into()),
        }
    }

    /// Barrier for a completed block: drain, notify, checkpoint, settle
    async fn complete_block(
        &mut self,
        height: u32,
        settled_tx: &mpsc::Sender<u32>,
        workers: &mut WorkerPool,
    ) -> Result<(), IndexerError> {
        self.phase = Phase::Draining(height);
        debug!("Draining {} transactions for block {}", self.graph.outstanding(), height);
        self.drain(workers).await?;

        self.phase = Phase::Settling(height);
        let indexed = height.saturating_sub(1);
        if let Err(e) = self.notifier.indexed(indexed).await {
            warn!("Failed to publish indexed {}: {}", indexed, e);
        }

        let settled = self.config.settled_height(height);
        self.checkpoints
            .advance(&self.config.indexer, settled)
            .await
            .map_err(|source| IndexerError::Checkpoint {
                height: settled,
                source,
            })?;
        info!("Block {} complete, checkpoint {}", height, settled);

        if settled_tx.send(settled).await.is_err() {
            warn!("Settlement task stopped, dropping height {}", settled);
        }
        self.phase = Phase::Streaming;
        Ok(())
    }
}

async fn run_settlement(handler: Arc<dyn SettlementHandler>, mut settled: mpsc::Receiver<u32>) {
    while let Some(height) = settled.recv().await {
        if let Err(e) = handler.settle(height).await {
            warn!("Settlement of height {} failed: {}", height, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bitcoin::absolute::LockTime;
    use bitcoin::consensus::encode::serialize;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

    use async_trait::async_trait;

    use crate::store::{MemoryStore, MockCheckpoints};
    use crate::txo::Txo;

    fn config() -> IndexerConfig {
        IndexerConfig {
            threads: 4,
            min_height: 1_000,
            event_queue_capacity: 64,
            ready_queue_capacity: 64,
            ..Default::default()
        }
    }

    fn tx_event(sats: u64, height: u32) -> FeedEvent {
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(sats),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        FeedEvent::Transaction {
            id: tx.compute_txid().to_string(),
            transaction: serialize(&tx),
            height,
            idx: 0,
        }
    }

    fn status(code: u32, height: u32) -> FeedEvent {
        FeedEvent::Status {
            code,
            height,
            message: String::new(),
        }
    }

    async fn run_events(
        indexer: &mut Indexer,
        events: Vec<FeedEvent>,
    ) -> Result<Shutdown, IndexerError> {
        let (tx, mut rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), indexer.process(&mut rx))
            .await
            .unwrap()
    }

    // ==================== status handling tests ====================

    #[tokio::test]
    async fn test_terminal_status_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let mut indexer = Indexer::new(config(), store.clone());

        let outcome = run_events(&mut indexer, vec![status(STATUS_TERMINAL, 0)]).await;
        assert_eq!(
            outcome.unwrap(),
            Shutdown::Terminal {
                message: String::new()
            }
        );
        assert_eq!(store.checkpoint("bsv20"), None);
    }

    #[tokio::test]
    async fn test_feed_end_shuts_down() {
        let mut indexer = Indexer::new(config(), Arc::new(MemoryStore::new()));
        let outcome = run_events(&mut indexer, vec![]).await;
        assert_eq!(outcome.unwrap(), Shutdown::FeedClosed);
    }

    #[tokio::test]
    async fn test_block_complete_checkpoints_with_lag() {
        let store = Arc::new(MemoryStore::new());
        let mut indexer =
            Indexer::new(config(), store.clone()).with_settlement(store.clone());

        let outcome = run_events(
            &mut indexer,
            vec![
                tx_event(1, 1_010),
                tx_event(2, 1_010),
                status(STATUS_BLOCK_COMPLETE, 1_010),
            ],
        )
        .await;

        assert_eq!(outcome.unwrap(), Shutdown::FeedClosed);
        assert_eq!(store.txos().len(), 2);
        assert_eq!(store.notifications(), vec![1_009]);
        assert_eq!(store.checkpoint("bsv20"), Some(1_004));
        assert_eq!(store.settled(), vec![1_004]);
        assert_eq!(indexer.phase(), Phase::Streaming);
    }

    #[tokio::test]
    async fn test_low_block_checkpoints_zero() {
        let store = Arc::new(MemoryStore::new());
        let config = IndexerConfig {
            min_height: 0,
            ..config()
        };
        let mut indexer = Indexer::new(config, store.clone());

        run_events(&mut indexer, vec![status(STATUS_BLOCK_COMPLETE, 5)])
            .await
            .unwrap();
        assert_eq!(store.notifications(), vec![4]);
        assert_eq!(store.checkpoint("bsv20"), Some(0));
    }

    #[tokio::test]
    async fn test_reset_below_minimum_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let mut indexer = Indexer::new(config(), store.clone());

        let outcome = run_events(
            &mut indexer,
            vec![tx_event(1, 0), status(STATUS_BLOCK_COMPLETE, 10)],
        )
        .await;

        assert!(matches!(
            outcome,
            Err(IndexerError::Reset {
                height: 10,
                min_height: 1_000
            })
        ));
        assert_eq!(store.checkpoint("bsv20"), None);
        assert!(store.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_status_without_height_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let mut indexer = Indexer::new(config(), store.clone());
        let outcome = run_events(&mut indexer, vec![status(1, 0)]).await;
        assert_eq!(outcome.unwrap(), Shutdown::FeedClosed);
    }

    #[tokio::test]
    async fn test_undecodable_transaction_is_fatal() {
        let mut indexer = Indexer::new(config(), Arc::new(MemoryStore::new()));
        let outcome = run_events(
            &mut indexer,
            vec![FeedEvent::Transaction {
                id: "bad".to_string(),
                transaction: vec![0xde, 0xad],
                height: 1_001,
                idx: 0,
            }],
        )
        .await;
        assert!(matches!(outcome, Err(IndexerError::Decode { ref id, .. }) if id == "bad"));
    }

    // ==================== checkpoint tests ====================

    #[tokio::test]
    async fn test_start_height_respects_minimum() {
        let indexer = Indexer::new(config(), Arc::new(MemoryStore::with_checkpoint("bsv20", 10)));
        assert_eq!(indexer.start_height().await.unwrap(), 1_000);

        let indexer = Indexer::new(config(), Arc::new(MemoryStore::with_checkpoint("bsv20", 5_000)));
        assert_eq!(indexer.start_height().await.unwrap(), 5_000);

        let indexer = Indexer::new(config(), Arc::new(MemoryStore::new()));
        assert_eq!(indexer.start_height().await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let mut checkpoints = MockCheckpoints::new();
        checkpoints
            .expect_advance()
            .times(1)
            .returning(|_, _| Err(StoreError::Unavailable("redis down".to_string())));

        let mut indexer =
            Indexer::with_parts(config(), Arc::new(checkpoints), store.clone(), store.clone());
        let outcome = run_events(
            &mut indexer,
            vec![tx_event(1, 1_010), status(STATUS_BLOCK_COMPLETE, 1_010)],
        )
        .await;

        assert!(matches!(
            outcome,
            Err(IndexerError::Checkpoint { height: 1_004, .. })
        ));
        assert_eq!(store.txos().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_never_writes_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let mut checkpoints = MockCheckpoints::new();
        checkpoints.expect_advance().never();

        let mut indexer =
            Indexer::with_parts(config(), Arc::new(checkpoints), store.clone(), store);
        let outcome = run_events(&mut indexer, vec![status(STATUS_BLOCK_COMPLETE, 999)]).await;
        assert!(matches!(outcome, Err(IndexerError::Reset { .. })));
    }

    // ==================== worker failure tests ====================

    /// Fails every save after a short delay
    struct SlowFailingSink;

    #[async_trait]
    impl TxoSink for SlowFailingSink {
        async fn save_txo(&self, _txo: &Txo) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(StoreError::Unavailable("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_into_dead_pool_reports_worker_error() {
        let store = Arc::new(MemoryStore::new());
        let config = IndexerConfig {
            threads: 1,
            ready_queue_capacity: 1,
            ..config()
        };
        let mut indexer =
            Indexer::with_parts(config, store.clone(), Arc::new(SlowFailingSink), store);

        // The third dispatch blocks on the full ready queue while the only worker fails.
        let outcome = run_events(
            &mut indexer,
            vec![tx_event(1, 1_010), tx_event(2, 1_010), tx_event(3, 1_010)],
        )
        .await;

        assert!(matches!(
            outcome,
            Err(IndexerError::Worker(WorkerError::Persist { .. }))
        ));
    }

    // ==================== settlement tests ====================

    struct StuckSettlement;

    #[async_trait]
    impl SettlementHandler for StuckSettlement {
        async fn settle(&self, _height: u32) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stuck_settlement_does_not_block_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let mut indexer = Indexer::new(config(), store.clone())
            .with_settlement(Arc::new(StuckSettlement))
            .with_settlement_grace(Duration::from_millis(50));

        let outcome = run_events(
            &mut indexer,
            vec![tx_event(1, 1_010), status(STATUS_BLOCK_COMPLETE, 1_010)],
        )
        .await;

        assert_eq!(outcome.unwrap(), Shutdown::FeedClosed);
        assert_eq!(store.checkpoint("bsv20"), Some(1_004));
    }
}
