//! Transaction Dependency Graph
//!
//! Tracks in-flight transactions and the in-batch parent/child edges between
//! them. A transaction becomes ready once every tracked parent has completed.
//! The number of tracked transactions is published on a watch channel so the
//! block barrier can wait for it to reach zero.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitcoin::Transaction;
use tokio::sync::watch;

/// A transaction admitted for processing
#[derive(Debug, Clone)]
pub struct TxnNode {
    /// Identity as delivered by the feed (txid hex)
    pub id: String,
    pub tx: Transaction,
    /// Block height, `None` while unconfirmed
    pub height: Option<u32>,
    /// Position within the block
    pub idx: u64,
}

/// Outcome of admitting a transaction
#[derive(Debug)]
pub enum Admission {
    /// No tracked parents; hand to a worker now
    Ready(Arc<TxnNode>),
    /// Waiting on this many tracked parents
    Pending(usize),
    /// Already tracked; ignored
    Duplicate,
}

struct Entry {
    node: Arc<TxnNode>,
    parents: HashSet<String>,
    children: HashSet<String>,
}

/// Concurrent dependency table shared by the dispatcher and the workers
pub struct TxnGraph {
    nodes: Mutex<HashMap<String, Entry>>,
    outstanding: watch::Sender<usize>,
}

impl Default for TxnGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnGraph {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            nodes: Mutex::new(HashMap::new()),
            outstanding,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a transaction, wiring it to every parent still tracked.
    ///
    /// Parents that already completed (or were never seen) are not edges.
    pub fn admit(&self, node: TxnNode) -> Admission {
        let mut nodes = self.lock();
        if nodes.contains_key(&node.id) {
            return Admission::Duplicate;
        }

        let mut parents = HashSet::new();
        for input in &node.tx.input {
            let parent_id = input.previous_output.txid.to_string();
            if let Some(parent) = nodes.get_mut(&parent_id) {
                parent.children.insert(node.id.clone());
                parents.insert(parent_id);
            }
        }

        let pending = parents.len();
        let node = Arc::new(node);
        nodes.insert(
            node.id.clone(),
            Entry {
                node: Arc::clone(&node),
                parents,
                children: HashSet::new(),
            },
        );
        self.outstanding.send_replace(nodes.len());

        if pending == 0 {
            Admission::Ready(node)
        } else {
            Admission::Pending(pending)
        }
    }

    /// Remove a processed transaction and return the children it unblocked.
    ///
    /// Released children stay tracked until they complete themselves, so the
    /// outstanding count never reaches zero while work is still queued.
    pub fn complete(&self, id: &str) -> Vec<Arc<TxnNode>> {
        let mut nodes = self.lock();
        let Some(entry) = nodes.remove(id) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for child_id in entry.children {
            if let Some(child) = nodes.get_mut(&child_id) {
                child.parents.remove(id);
                if child.parents.is_empty() {
                    ready.push(Arc::clone(&child.node));
                }
            }
        }
        self.outstanding.send_replace(nodes.len());
        ready
    }

    /// Number of tracked transactions
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Resolve once no transaction is tracked
    pub async fn wait_drained(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
