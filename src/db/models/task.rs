use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::wallet::PatientId;

/// Catalog entry for a rewarded, rate-limited patient action
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub task_code: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub reward: i64,
    pub max_per_day: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recorded completion; same-day rows are counted against
/// `Task::max_per_day`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskCompletion {
    pub id: i64,
    pub patient_id: PatientId,
    pub task_code: String,
    pub meta: Option<sqlx::types::Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}
