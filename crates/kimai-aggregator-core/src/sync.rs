//! Send-or-queue delivery of user mutations.
//!
//! `SyncService` tries to deliver settings updates and data writes right away
//! through the backend client. When the backend is unreachable the mutation
//! goes into the offline queue instead, and `flush` replays it later.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{ApiError, AuthenticatedClient};
use crate::queue::{DrainReport, OfflineQueue, OperationType, QueuedOperation};

const SETTINGS_PATH: &str = "/user/settings";
const DATA_PATH: &str = "/user/data";

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Delivered; carries the response body
    Sent(Value),
    /// Backend unreachable; carries the queued operation id
    Queued(String),
}

pub struct SyncService {
    client: AuthenticatedClient,
    queue: Arc<OfflineQueue>,
}

impl SyncService {
    pub fn new(client: AuthenticatedClient, queue: Arc<OfflineQueue>) -> Self {
        Self { client, queue }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub async fn save_settings(&self, settings: Value) -> Result<SaveOutcome, ApiError> {
        self.send_or_queue(OperationType::Settings, None, settings).await
    }

    pub async fn save_data(&self, data_type: &str, data: Value) -> Result<SaveOutcome, ApiError> {
        self.send_or_queue(OperationType::Data, Some(data_type), data).await
    }

    async fn send_or_queue(
        &self,
        op_type: OperationType,
        data_type: Option<&str>,
        data: Value,
    ) -> Result<SaveOutcome, ApiError> {
        match deliver(&self.client, op_type, data_type, &data).await {
            Ok(body) => Ok(SaveOutcome::Sent(body)),
            Err(e) if is_transient(&e) => {
                warn!(op_type = %op_type, error = %e, "Backend unreachable, queueing operation");
                let id = self.queue.enqueue(op_type, data, data_type);
                Ok(SaveOutcome::Queued(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Replay everything currently queued
    pub async fn flush(&self) -> DrainReport {
        self.queue
            .process_queue(|operation: QueuedOperation| {
                let client = self.client.clone();
                async move {
                    deliver(
                        &client,
                        operation.op_type,
                        operation.data_type.as_deref(),
                        &operation.data,
                    )
                    .await
                    .map(|_| ())
                }
            })
            .await
    }

    /// Flush the queue every `every` until the handle is aborted
    pub fn spawn_periodic_flush(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if self.queue.is_empty() {
                    continue;
                }
                let report = self.flush().await;
                debug!(?report, "Periodic queue flush finished");
            }
        })
    }
}

/// Network failures and 5xx answers are worth retrying later
fn is_transient(error: &ApiError) -> bool {
    matches!(error, ApiError::NetworkError(_) | ApiError::ServerError(_) | ApiError::RateLimited)
}

async fn deliver(
    client: &AuthenticatedClient,
    op_type: OperationType,
    data_type: Option<&str>,
    data: &Value,
) -> Result<Value, ApiError> {
    match op_type {
        OperationType::Settings => {
            client
                .request(Method::PUT, SETTINGS_PATH, Some(data.clone()), &[])
                .await
        }
        OperationType::Data => {
            let data_type = data_type.ok_or_else(|| {
                ApiError::InvalidRequest("data operation without a data type".to_string())
            })?;
            let path = format!("{}/{}", DATA_PATH, data_type);
            client
                .request(Method::POST, &path, Some(data.clone()), &[])
                .await
        }
    }
}
