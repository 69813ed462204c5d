use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::wallet::PatientId;

/// Wheel entry. `token` is nullable so non-token prizes (physical vouchers
/// handed out at the front desk) ride the same wheel; `inventory` of NULL
/// means unlimited stock.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Prize {
    pub id: i64,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<i64>,
    pub weight: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<i64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prize {
    /// Unlimited stock, or at least one unit remaining
    pub fn in_stock(&self) -> bool {
        match self.inventory {
            None => true,
            Some(remaining) => remaining > 0,
        }
    }
}

/// One wheel spin. The prize label and token amount are snapshotted so the
/// history stays meaningful after the prize row is edited or retired.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Spin {
    pub id: i64,
    pub patient_id: PatientId,
    pub prize_id: i64,
    pub prize_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<i64>,
    pub created_at: DateTime<Utc>,
}
