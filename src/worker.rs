//! Worker Pool
//!
//! A fixed number of tokio tasks share the ready queue. Each worker parses a
//! ready transaction, persists its outputs, and then releases the children
//! that were waiting on it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::bsv20::TokenParser;
use crate::graph::{TxnGraph, TxnNode};
use crate::parser::parse_transaction;
use crate::store::{StoreError, TxoSink};

/// Errors that stop a worker. All of them are fatal to the process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to persist output of {txid}: {source}")]
    Persist {
        txid: String,
        #[source]
        source: StoreError,
    },

    #[error("Persisting output of {txid} timed out after {timeout:?}")]
    PersistTimeout { txid: String, timeout: Duration },

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// Everything a worker needs besides the queue itself
#[derive(Clone)]
pub struct WorkerContext {
    pub graph: Arc<TxnGraph>,
    pub sink: Arc<dyn TxoSink>,
    pub tokens: Arc<dyn TokenParser>,
    /// Upper bound on a single persistence call; `None` waits indefinitely
    pub persist_timeout: Option<Duration>,
    /// Producer side of the ready queue, used to hand off released children
    pub ready_tx: mpsc::Sender<Arc<TxnNode>>,
}

pub struct WorkerPool {
    tasks: JoinSet<Result<(), WorkerError>>,
}

impl WorkerPool {
    /// Start `size` workers consuming `ready_rx`
    pub fn spawn(size: usize, ready_rx: mpsc::Receiver<Arc<TxnNode>>, ctx: WorkerContext) -> Self {
        let ready_rx = Arc::new(Mutex::new(ready_rx));
        let mut tasks = JoinSet::new();
        for worker_id in 0..size {
            let ctx = ctx.clone();
            let ready_rx = Arc::clone(&ready_rx);
            tasks.spawn(async move { run_worker(worker_id, ctx, ready_rx).await });
        }
        debug!("Started {} workers", size);
        Self { tasks }
    }

    /// Resolve with the first worker failure. Never resolves while all workers are healthy.
    pub async fn failure(&mut self) -> WorkerError {
        match self.first_failure().await {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }

    /// Wait for workers to exit and return the first failure, or `None` if
    /// every worker exited cleanly.
    pub async fn first_failure(&mut self) -> Option<WorkerError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Some(e),
                Err(e) => return Some(WorkerError::Panicked(e.to_string())),
            }
        }
        None
    }

    /// Stop every worker. In-flight work is abandoned.
    pub fn shutdown(&mut self) {
        self.tasks.abort_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}

async fn run_worker(
    worker_id: usize,
    ctx: WorkerContext,
    ready_rx: Arc<Mutex<mpsc::Receiver<Arc<TxnNode>>>>,
) -> Result<(), WorkerError> {
    let mut backlog: Vec<Arc<TxnNode>> = Vec::new();

    loop {
        let node = match backlog.pop() {
            Some(node) => node,
            None => {
                let next = ready_rx.lock().await.recv().await;
                match next {
                    Some(node) => node,
                    None => return Ok(()),
                }
            }
        };

        if let Err(e) = process(&ctx, &node).await {
            error!("Worker {} failed on {}: {}", worker_id, node.id, e);
            return Err(e);
        }

        for child in ctx.graph.complete(&node.id) {
            match ctx.ready_tx.try_send(child) {
                Ok(()) => {}
                Err(TrySendError::Full(child)) | Err(TrySendError::Closed(child)) => {
                    backlog.push(child)
                }
            }
        }
    }
}

async fn process(ctx: &WorkerContext, node: &TxnNode) -> Result<(), WorkerError> {
    let txid = node.tx.compute_txid();
    let txos = parse_transaction(&node.tx, txid, node.height, node.idx, ctx.tokens.as_ref());

    for txo in &txos {
        let save = ctx.sink.save_txo(txo);
        let saved = match ctx.persist_timeout {
            Some(timeout) => tokio::time::timeout(timeout, save).await.map_err(|_| {
                WorkerError::PersistTimeout {
                    txid: node.id.clone(),
                    timeout,
                }
            })?,
            None => save.await,
        };
        saved.map_err(|source| WorkerError::Persist {
            txid: node.id.clone(),
            source,
        })?;
    }

    debug!("Processed {} ({} outputs)", node.id, txos.len());
    Ok(())
}
