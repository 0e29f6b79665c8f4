use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::operation::now_ms;
use super::{KeyValueStore, OperationType, QueuedOperation, StorageError};
use crate::config::QueueConfig;

/// Result of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    /// Failed but kept for a later pass
    pub failed: usize,
    /// Failed for the last allowed time and given up on
    pub dropped: usize,
}

/// Durable queue of mutations that could not be sent right away.
///
/// Every mutation is followed by a full persist of the queue under its single
/// storage key. Persistence problems are logged and degrade the queue (oldest
/// entries go first); they never reach the caller.
pub struct OfflineQueue {
    storage: Box<dyn KeyValueStore>,
    config: QueueConfig,
    operations: Mutex<Vec<QueuedOperation>>,
    /// Serializes drains so an operation is never sent twice concurrently
    drain_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// Load the queue from storage, pruning expired entries.
    ///
    /// Unreadable or corrupt storage yields an empty queue.
    pub fn load(storage: impl KeyValueStore + 'static, config: QueueConfig) -> Self {
        let (operations, dirty) = match storage.get_item(&config.storage_key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<QueuedOperation>>(&raw) {
                Ok(operations) => (operations, false),
                Err(e) => {
                    warn!(error = %e, "Offline queue is corrupt, starting empty");
                    (Vec::new(), true)
                }
            },
            Ok(None) => (Vec::new(), false),
            Err(e) => {
                error!(error = %e, "Failed to read offline queue, starting empty");
                (Vec::new(), false)
            }
        };

        let queue = Self {
            storage: Box::new(storage),
            config,
            operations: Mutex::new(operations),
            drain_lock: tokio::sync::Mutex::new(()),
        };

        let exhausted = queue.drop_exhausted();
        let pruned = queue.prune_expired();
        if dirty && exhausted == 0 && pruned == 0 {
            let mut operations = queue.lock();
            queue.save(&mut operations);
        }
        debug!(pending = queue.len(), exhausted, pruned, "Offline queue loaded");
        queue
    }

    /// Drop stored entries already at the retry ceiling (it may have been
    /// lowered since they were written). Returns the number dropped.
    fn drop_exhausted(&self) -> usize {
        let max_retries = self.config.max_retries;
        let mut operations = self.lock();
        let before = operations.len();
        operations.retain(|op| {
            let keep = op.retries < max_retries;
            if !keep {
                warn!(id = %op.id, retries = op.retries, max_retries, "Dropping queued operation over retry limit");
            }
            keep
        });
        let dropped = before - operations.len();
        if dropped > 0 {
            self.save(&mut operations);
        }
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedOperation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an operation and persist. Returns the operation id.
    pub fn enqueue(&self, op_type: OperationType, data: Value, data_type: Option<&str>) -> String {
        let mut operations = self.lock();

        // Strictly increasing timestamps keep "most recent" well defined
        let latest = operations.iter().map(|op| op.timestamp).max().unwrap_or(i64::MIN);
        let timestamp = now_ms().max(latest.saturating_add(1));

        let operation =
            QueuedOperation::new(op_type, data, data_type.map(str::to_string), timestamp);
        let id = operation.id.clone();
        operations.push(operation);
        info!(id = %id, op_type = %op_type, data_type = ?data_type, "Operation queued");

        self.save(&mut operations);
        id
    }

    /// Remove one operation. Returns false when it was not queued.
    pub fn remove(&self, id: &str) -> bool {
        let mut operations = self.lock();
        let before = operations.len();
        operations.retain(|op| op.id != id);
        let removed = operations.len() != before;
        self.save(&mut operations);
        removed
    }

    pub fn clear(&self) {
        let mut operations = self.lock();
        operations.clear();
        self.save(&mut operations);
        info!("Offline queue cleared");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the queued operations
    pub fn operations(&self) -> Vec<QueuedOperation> {
        self.lock().clone()
    }

    /// Drop entries older than the configured max age, whatever their retry count.
    /// Returns the number of entries dropped.
    pub fn prune_expired(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.config.max_age().as_millis() as i64);
        let mut operations = self.lock();
        let before = operations.len();
        operations.retain(|op| op.timestamp >= cutoff);
        let pruned = before - operations.len();
        if pruned > 0 {
            info!(pruned, "Expired operations pruned from offline queue");
            self.save(&mut operations);
        }
        pruned
    }

    /// Replay queued operations through `send`.
    ///
    /// Works on a snapshot taken at call time: operations enqueued while the
    /// drain runs wait for the next pass. A failing operation has its retry
    /// count raised and is dropped once it reaches the configured maximum.
    pub async fn process_queue<F, Fut, E>(&self, mut send: F) -> DrainReport
    where
        F: FnMut(QueuedOperation) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let _drain = self.drain_lock.lock().await;
        self.prune_expired();

        let snapshot = self.operations();
        let mut report = DrainReport::default();
        if snapshot.is_empty() {
            return report;
        }
        debug!(count = snapshot.len(), "Processing offline queue");

        for operation in snapshot {
            let id = operation.id.clone();
            match send(operation).await {
                Ok(()) => {
                    self.complete(&id);
                    report.sent += 1;
                }
                Err(e) => {
                    if self.record_failure(&id, &e.to_string()) {
                        report.dropped += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            dropped = report.dropped,
            remaining = self.len(),
            "Offline queue processed"
        );
        report
    }

    fn complete(&self, id: &str) {
        let mut operations = self.lock();
        operations.retain(|op| op.id != id);
        debug!(id, "Queued operation delivered");
        self.save(&mut operations);
    }

    /// Returns true when the operation hit the retry ceiling and was dropped
    fn record_failure(&self, id: &str, error: &str) -> bool {
        let mut operations = self.lock();
        let Some(index) = operations.iter().position(|op| op.id == id) else {
            // Removed while it was being sent
            return false;
        };

        operations[index].retries += 1;
        let retries = operations[index].retries;
        let dropped = retries >= self.config.max_retries;
        if dropped {
            let operation = operations.remove(index);
            warn!(
                id,
                op_type = %operation.op_type,
                retries,
                error,
                "Giving up on queued operation after max retries"
            );
        } else {
            debug!(id, retries, error, "Queued operation failed, will retry");
        }

        self.save(&mut operations);
        dropped
    }

    /// Persist, logging instead of propagating any failure
    fn save(&self, operations: &mut Vec<QueuedOperation>) {
        if let Err(e) = self.persist(operations) {
            error!(error = %e, "Failed to persist offline queue");
        }
    }

    /// Apply the size policy and write the queue.
    ///
    /// On a quota error the queue shrinks to `quota_keep` entries, then to
    /// empty, so memory and storage never disagree about what is queued.
    fn persist(&self, operations: &mut Vec<QueuedOperation>) -> Result<(), StorageError> {
        if operations.len() > self.config.max_entries {
            warn!(
                count = operations.len(),
                max = self.config.max_entries,
                "Offline queue over max entries, keeping most recent"
            );
            keep_most_recent(operations, self.config.max_entries);
        }

        let mut serialized = serde_json::to_string(operations)?;
        if serialized.len() > self.config.max_bytes {
            warn!(
                bytes = serialized.len(),
                max = self.config.max_bytes,
                "Offline queue too large, keeping most recent"
            );
            keep_most_recent(operations, self.config.oversize_keep);
            serialized = serde_json::to_string(operations)?;
        }

        let key = &self.config.storage_key;
        match self.storage.set_item(key, &serialized) {
            Err(e) if e.is_quota() => {
                warn!(error = %e, keep = self.config.quota_keep, "Storage quota hit, shrinking offline queue");
                keep_most_recent(operations, self.config.quota_keep);
                let serialized = serde_json::to_string(operations)?;
                match self.storage.set_item(key, &serialized) {
                    Err(e) if e.is_quota() => {
                        warn!(error = %e, "Storage quota still exceeded, emptying offline queue");
                        operations.clear();
                        self.storage
                            .set_item(key, "[]")
                            .or_else(|_| self.storage.remove_item(key))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

/// Keep the `count` newest entries, newest first
fn keep_most_recent(operations: &mut Vec<QueuedOperation>, count: usize) {
    operations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    operations.truncate(count);
}
