use chrono::Utc;
use sqlx::{Pool, Postgres};
use tracing::instrument;

use super::sql_fragment;
use crate::db::models::task::{Task, TaskCompletion};
use crate::db::models::wallet::{LedgerEntry, PatientId, Source};
use crate::db::repositories::wallet::WalletRepository;
use crate::db::repositories::{Repository, RewardsErr, RewardsResult};
use crate::util::clock;

#[derive(Debug)]
pub struct TaskRepository {
    pool: &'static Pool<Postgres>,
}

#[async_trait::async_trait]
impl Repository for TaskRepository {
    type Ident = String;
    type Output = Task;

    const BASE_FIELDS: &'static str = sql_fragment::TASK_FIELDS;
    const TABLE_NAME: &'static str = "reward_tasks";
    const ID_COLUMN: &'static str = "task_code";

    fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &'static Pool<Postgres> {
        self.pool
    }
}

impl TaskRepository {
    #[instrument(skip(self))]
    pub async fn active_tasks(&self) -> RewardsResult<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            "SELECT {} FROM reward_tasks WHERE active ORDER BY task_code ASC",
            sql_fragment::TASK_FIELDS
        ))
        .fetch_all(self.pool)
        .await?;

        Ok(tasks)
    }

    /// Records a completion and pays out `task.reward`, both in one
    /// transaction: a cap slot is never consumed without its payout.
    ///
    /// The per-day cap counts completions inside the current clinic-local
    /// calendar day. The wallet row lock is taken before the count so two
    /// racing completions for the same patient serialize rather than both
    /// slipping under the cap.
    #[instrument(skip(self, meta))]
    pub async fn complete_task(
        &self,
        patient_id: PatientId,
        task_code: &str,
        meta: Option<serde_json::Value>,
    ) -> RewardsResult<LedgerEntry> {
        let offset = clock::clinic_offset().await?;

        let mut tx = self.pool.begin().await?;
        WalletRepository::lock_wallet(&mut tx, patient_id).await?;

        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {} FROM reward_tasks WHERE task_code = $1 AND active",
            sql_fragment::TASK_FIELDS
        ))
        .bind(task_code)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RewardsErr::TaskNotFound(task_code.to_string()))?;

        let (day_start, day_end) = clock::day_bounds(Utc::now(), offset);
        let completed_today = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM reward_task_completions
            WHERE patient_id = $1
            AND task_code = $2
            AND created_at >= $3
            AND created_at < $4
            "#,
        )
        .bind(patient_id)
        .bind(task_code)
        .bind(day_start)
        .bind(day_end)
        .fetch_one(&mut *tx)
        .await?;

        if completed_today >= task.max_per_day {
            tracing::debug!(completed_today, cap = task.max_per_day, "daily cap hit");
            return Err(RewardsErr::DailyCapReached {
                task_code: task.task_code,
                cap: task.max_per_day,
            });
        }

        let completion = sqlx::query_as::<_, TaskCompletion>(
            r#"
            INSERT INTO reward_task_completions (patient_id, task_code, meta)
            VALUES ($1, $2, $3)
            RETURNING id, patient_id, task_code, meta, created_at
            "#,
        )
        .bind(patient_id)
        .bind(task_code)
        .bind(meta)
        .fetch_one(&mut *tx)
        .await?;
        tracing::debug!(completion_id = completion.id, "completion recorded");

        let entry = WalletRepository::credit_in_tx(
            &mut tx,
            patient_id,
            task.reward,
            Source::Task,
            Some(format!("task '{}'", task.task_code)),
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(entry)
    }
}
