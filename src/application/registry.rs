//! Correlates script round-trips with the callbacks that complete them.
//!
//! An entry is inserted before its script is dispatched and removed exactly
//! once: by the matching callback, by a timeout, or by teardown.

use crate::domain::payment::{BackendFunction, BackendResponse, TransactionId, parse_script_result};
use crate::error::BackendError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

pub type Completion = Result<BackendResponse, BackendError>;

#[derive(Debug)]
struct PendingTransaction {
    completion: oneshot::Sender<Completion>,
    function: BackendFunction,
    created_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionRegistry {
    pending: Arc<Mutex<HashMap<TransactionId, PendingTransaction>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh id. The receiver resolves when the entry is completed.
    pub async fn register(
        &self,
        function: BackendFunction,
    ) -> (TransactionId, oneshot::Receiver<Completion>) {
        let id = TransactionId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingTransaction {
                completion: tx,
                function,
                created_at: Instant::now(),
            },
        );
        debug!(transaction_id = %id, %function, "registered transaction");
        (id, rx)
    }

    /// Completes an entry. Returns false when the id is unknown or already done.
    pub async fn resolve(&self, id: TransactionId, completion: Completion) -> bool {
        let Some(entry) = self.pending.lock().await.remove(&id) else {
            warn!(transaction_id = %id, "no pending transaction for callback");
            return false;
        };
        debug!(
            transaction_id = %id,
            function = %entry.function,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            ok = completion.is_ok(),
            "transaction completed"
        );
        if entry.completion.send(completion).is_err() {
            debug!(transaction_id = %id, "caller stopped waiting");
        }
        true
    }

    /// Drops an entry without completing it.
    pub async fn remove(&self, id: TransactionId) -> bool {
        self.pending.lock().await.remove(&id).is_some()
    }

    /// Fails every pending entry. Used on teardown.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(transaction_id = %id, function = %entry.function, "failing pending transaction");
            let _ = entry
                .completion
                .send(Err(BackendError::Closed(reason.to_string())));
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn callbacks(&self) -> ScriptCallbacks {
        ScriptCallbacks {
            registry: self.clone(),
        }
    }
}

/// Entry point for results posted back by the script surface.
#[derive(Debug, Clone)]
pub struct ScriptCallbacks {
    registry: TransactionRegistry,
}

impl ScriptCallbacks {
    /// Routes a raw result to its pending transaction. Unknown, malformed or
    /// repeated ids are dropped and reported as false.
    pub async fn post_result(&self, transaction_id: &str, raw: &str) -> bool {
        let Some(id) = TransactionId::parse(transaction_id) else {
            warn!(transaction_id, "callback with malformed transaction id");
            return false;
        };
        self.registry.resolve(id, parse_script_result(raw)).await
    }
}
