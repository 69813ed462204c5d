use core::fmt;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Result as SqlxResult};
use thiserror::Error;
use tracing::instrument;

use crate::util::env;

pub mod prize;
pub mod task;
pub mod wallet;

#[cfg(test)]
mod tests;

pub type RewardsResult<T> = core::result::Result<T, RewardsErr>;

/// Domain failure taxonomy for the rewards core. Every variant is scoped to
/// the single request that triggered it; callers surface these as rejected
/// operations and never retry internally.
#[derive(Debug, Error)]
pub enum RewardsErr {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("unknown or inactive task '{0}'")]
    TaskNotFound(String),

    #[error("daily cap of {cap} reached for task '{task_code}'")]
    DailyCapReached { task_code: String, cap: i64 },

    #[error("no prizes available to draw")]
    NoPrizesAvailable,

    #[error("storage conflict: {0}")]
    StorageConflict(&'static str),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("{0}")]
    Env(#[from] env::EnvErr),
}

pub mod sql_fragment {
    pub const WALLET_FIELDS: &str = r#"
        patient_id,
        balance,
        created_at,
        updated_at
    "#;

    pub const LEDGER_FIELDS: &str = r#"
        id,
        patient_id,
        entry_type,
        amount,
        source,
        memo,
        external_ref,
        created_at
    "#;

    pub const TASK_FIELDS: &str = r#"
        task_code,
        title,
        description,
        reward,
        max_per_day,
        active,
        created_at,
        updated_at
    "#;

    pub const PRIZE_FIELDS: &str = r#"
        id,
        label,
        token,
        weight,
        inventory,
        active,
        created_at,
        updated_at
    "#;

    pub const SPIN_FIELDS: &str = r#"
        id,
        patient_id,
        prize_id,
        prize_label,
        token,
        created_at
    "#;
}

#[async_trait]
pub trait Repository {
    type Ident: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send + Sync + fmt::Debug;
    type Output: for<'r> sqlx::FromRow<'r, <Postgres as sqlx::Database>::Row>
        + Sized
        + Unpin
        + Send
        + fmt::Debug;

    const BASE_FIELDS: &'static str;
    const TABLE_NAME: &'static str;
    const ID_COLUMN: &'static str = "id";

    fn new(pool: &'static Pool<Postgres>) -> Self
    where
        Self: Sized;

    fn pool(&self) -> &'static Pool<Postgres>;

    async fn exists(&self, id: &Self::Ident) -> SqlxResult<bool> {
        Ok(
            match sqlx::query_scalar::<_, bool>(&format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = $1)",
                Self::TABLE_NAME,
                Self::ID_COLUMN
            ))
            .bind(id)
            .fetch_one(self.pool())
            .await
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = ?e, table = ?Self::TABLE_NAME, "failed to check row existence");
                    false
                }
            },
        )
    }

    #[instrument(skip(self, id))]
    async fn get_by_id(&self, id: &Self::Ident) -> SqlxResult<Option<Self::Output>> {
        sqlx::query_as::<_, Self::Output>(&format!(
            "SELECT {} FROM {} WHERE {} = $1",
            Self::BASE_FIELDS,
            Self::TABLE_NAME,
            Self::ID_COLUMN
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
    }
}
