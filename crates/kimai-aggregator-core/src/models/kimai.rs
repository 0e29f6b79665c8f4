use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Kimai's datetime format: ISO 8601 with a `+0200` style offset
const KIMAI_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

fn parse_kimai_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(value, KIMAI_DATETIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub customer: Option<i64>,
    #[serde(default)]
    pub visible: Option<bool>,
    /// Money budget in the customer's currency
    #[serde(default)]
    pub budget: Option<f64>,
    /// Time budget in seconds
    #[serde(default)]
    pub time_budget: Option<i64>,
    #[serde(default)]
    pub color: Option<String>,
}

impl Project {
    pub fn time_budget_hours(&self) -> Option<f64> {
        self.time_budget
            .filter(|secs| *secs > 0)
            .map(|secs| secs as f64 / 3600.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub project: Option<i64>,
    #[serde(default)]
    pub visible: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timesheet {
    pub id: i64,
    pub begin: String,
    #[serde(default)]
    pub end: Option<String>,
    /// Tracked seconds; absent or zero while the timer is running
    #[serde(default)]
    pub duration: Option<i64>,
    pub project: i64,
    pub activity: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rate: Option<f64>,
}

impl Timesheet {
    pub fn is_running(&self) -> bool {
        self.end.is_none()
    }

    pub fn hours(&self) -> f64 {
        self.duration.unwrap_or(0).max(0) as f64 / 3600.0
    }

    pub fn begin_time(&self) -> Option<DateTime<FixedOffset>> {
        parse_kimai_datetime(&self.begin)
    }
}
