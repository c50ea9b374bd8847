use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackState {
    Pending,
    Delivered,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub request_id: String,
    pub session_id: String,
    pub file_path: String,
    pub deadline: DateTime<Utc>,
    pub state: CallbackState,
    pub sent_at: DateTime<Utc>,
}
