use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation name recorded when the caller does not supply one.
pub const DEFAULT_OPERATION: &str = "generateIRP";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Safe,
    Warning,
    Critical,
    Exhausted,
}

impl AlertLevel {
    pub fn as_str(&self) -> &str {
        match self {
            AlertLevel::Safe => "safe",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Exhausted => "exhausted",
        }
    }
}

fn default_success() -> bool {
    true
}

fn default_record_operation() -> String {
    "unknown".to_string()
}

/// One billable call, as kept in the in-memory history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    #[serde(default = "default_record_operation")]
    pub operation: String,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub response_time: Option<u64>,
}

/// Body of `POST /api/usage/record`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    pub model: String,
    pub operation: String,
    pub success: bool,
    #[serde(default)]
    pub response_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<i64>,
}

/// Where a recorded call came from, stored alongside the log row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}
