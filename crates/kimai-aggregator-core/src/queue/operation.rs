use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// User settings update
    Settings,
    /// Write of a named data set (see `data_type`)
    Data,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Settings => write!(f, "settings"),
            OperationType::Data => write!(f, "data"),
        }
    }
}

/// A mutation waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub data: Value,
    /// Enqueue time, epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub retries: u32,
}

impl QueuedOperation {
    pub fn new(op_type: OperationType, data: Value, data_type: Option<String>, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            op_type,
            data_type,
            data,
            timestamp,
            retries: 0,
        }
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
