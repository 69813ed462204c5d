use sqlx::{Pool, Postgres, Result as SqlxResult, Transaction};
use tracing::instrument;

use super::sql_fragment;
use crate::db::models::PaginatedResponse;
use crate::db::models::wallet::{EntryKind, LedgerEntry, PatientId, Source, Wallet};
use crate::db::repositories::{Repository, RewardsErr, RewardsResult};

/// Per-patient token wallet plus its append-only ledger.
///
/// Every balance mutation happens inside one transaction that first takes the
/// wallet row lock, so concurrent operations on the same patient serialize
/// while different patients proceed in parallel. The wallet balance is, at
/// every commit point, the sum of credits minus debits in `reward_ledger`.
#[derive(Debug)]
pub struct WalletRepository {
    pool: &'static Pool<Postgres>,
}

#[async_trait::async_trait]
impl Repository for WalletRepository {
    type Ident = PatientId;
    type Output = Wallet;

    const BASE_FIELDS: &'static str = sql_fragment::WALLET_FIELDS;
    const TABLE_NAME: &'static str = "reward_wallets";
    const ID_COLUMN: &'static str = "patient_id";

    fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &'static Pool<Postgres> {
        self.pool
    }
}

impl WalletRepository {
    /// Idempotent get-or-create at balance zero
    #[instrument(skip(self))]
    pub async fn ensure_wallet(&self, patient_id: PatientId) -> RewardsResult<Wallet> {
        let mut tx = self.pool.begin().await?;
        let wallet = Self::lock_wallet(&mut tx, patient_id).await?;
        tx.commit().await?;

        Ok(wallet)
    }

    /// Credits `amount` tokens to the patient's wallet.
    ///
    /// When `external_ref` is supplied and a ledger entry already carries that
    /// ref, the existing entry is returned untouched; duplicate deliveries of
    /// the same upstream event therefore credit at most once. A replay racing
    /// past the pre-check trips the unique index instead and resolves to the
    /// original entry.
    #[instrument(skip(self, memo, external_ref))]
    pub async fn credit(
        &self,
        patient_id: PatientId,
        amount: i64,
        source: Source,
        memo: Option<String>,
        external_ref: Option<String>,
    ) -> RewardsResult<LedgerEntry> {
        let replay_ref = external_ref.clone();

        let mut tx = self.pool.begin().await?;
        match Self::credit_in_tx(&mut tx, patient_id, amount, source, memo, external_ref).await {
            Ok(entry) => {
                tx.commit().await?;
                Ok(entry)
            }
            Err(RewardsErr::Sqlx(sqlx::Error::Database(db)))
                if db.is_unique_violation() && replay_ref.is_some() =>
            {
                tx.rollback().await?;

                // a concurrent replay won the insert; hand back its entry
                let replay_ref = replay_ref.unwrap_or_default();
                Self::find_by_external_ref(self.pool, &replay_ref)
                    .await?
                    .ok_or(RewardsErr::StorageConflict(
                        "duplicate external_ref insert raced and the winning entry vanished",
                    ))
            }
            Err(e) => {
                tracing::trace!(error = ?e, "credit transaction failure");
                Err(e)
            }
        }
    }

    /// Debits `amount` tokens, rejecting any debit that would drive the
    /// balance negative. Nothing persists on rejection.
    #[instrument(skip(self, memo))]
    pub async fn debit(
        &self,
        patient_id: PatientId,
        amount: i64,
        source: Source,
        memo: Option<String>,
    ) -> RewardsResult<LedgerEntry> {
        if amount <= 0 {
            return Err(RewardsErr::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;
        let wallet = Self::lock_wallet(&mut tx, patient_id).await?;
        if wallet.balance < amount {
            return Err(RewardsErr::InsufficientBalance {
                requested: amount,
                available: wallet.balance,
            });
        }

        // conditional even though the row is locked above; a zero-row update
        // here means the overdraft guard was violated and the transaction
        // must not commit
        let updated = sqlx::query(
            r#"
            UPDATE reward_wallets
            SET balance = balance - $2,
                updated_at = NOW()
            WHERE patient_id = $1
            AND balance >= $2
            "#,
        )
        .bind(patient_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RewardsErr::StorageConflict(
                "wallet balance changed underneath a locked debit",
            ));
        }

        let entry =
            Self::insert_entry(&mut tx, patient_id, EntryKind::Debit, amount, source, memo, None)
                .await?;
        tx.commit().await?;

        Ok(entry)
    }

    /// Paginated ledger history, newest first
    #[instrument(skip(self, limit, offset))]
    pub async fn ledger(
        &self,
        patient_id: PatientId,
        limit: i64,
        offset: i64,
    ) -> RewardsResult<PaginatedResponse<LedgerEntry>> {
        let total_items = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM reward_ledger WHERE patient_id = $1",
        )
        .bind(patient_id)
        .fetch_one(self.pool)
        .await?;

        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            SELECT {}
            FROM reward_ledger
            WHERE patient_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
            sql_fragment::LEDGER_FIELDS
        ))
        .bind(patient_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool)
        .await?;

        Ok(PaginatedResponse::new(
            entries,
            total_items,
            limit,
            offset / limit + 1,
        ))
    }

    /// Sum of credits minus debits in the ledger; equals the wallet balance
    /// at every commit point
    #[instrument(skip(self))]
    pub async fn ledger_sum(&self, patient_id: PatientId) -> RewardsResult<i64> {
        let sum = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(
                SUM(CASE WHEN entry_type = 'credit' THEN amount ELSE -amount END),
                0
            )::BIGINT
            FROM reward_ledger
            WHERE patient_id = $1
            "#,
        )
        .bind(patient_id)
        .fetch_one(self.pool)
        .await?;

        Ok(sum)
    }

    /// Creates the wallet row if absent and takes its row lock, serializing
    /// all balance-affecting work for this patient within the transaction
    pub(crate) async fn lock_wallet(
        tx: &mut Transaction<'_, Postgres>,
        patient_id: PatientId,
    ) -> SqlxResult<Wallet> {
        sqlx::query(
            r#"
            INSERT INTO reward_wallets (patient_id)
            VALUES ($1)
            ON CONFLICT (patient_id)
            DO NOTHING
            "#,
        )
        .bind(patient_id)
        .execute(&mut **tx)
        .await?;

        sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM reward_wallets WHERE patient_id = $1 FOR UPDATE",
            sql_fragment::WALLET_FIELDS
        ))
        .bind(patient_id)
        .fetch_one(&mut **tx)
        .await
    }

    /// Credit applied inside a caller-owned transaction, so task completions
    /// and wheel spins commit their own records together with the payout
    pub(crate) async fn credit_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        patient_id: PatientId,
        amount: i64,
        source: Source,
        memo: Option<String>,
        external_ref: Option<String>,
    ) -> RewardsResult<LedgerEntry> {
        if amount <= 0 {
            return Err(RewardsErr::InvalidAmount(amount));
        }

        if let Some(r) = external_ref.as_deref() {
            if let Some(existing) = Self::find_by_external_ref(&mut **tx, r).await? {
                return Ok(existing);
            }
        }

        Self::lock_wallet(tx, patient_id).await?;

        sqlx::query(
            r#"
            UPDATE reward_wallets
            SET balance = balance + $2,
                updated_at = NOW()
            WHERE patient_id = $1
            "#,
        )
        .bind(patient_id)
        .bind(amount)
        .execute(&mut **tx)
        .await?;

        let entry = Self::insert_entry(
            tx,
            patient_id,
            EntryKind::Credit,
            amount,
            source,
            memo,
            external_ref,
        )
        .await?;

        Ok(entry)
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Postgres>,
        patient_id: PatientId,
        entry_type: EntryKind,
        amount: i64,
        source: Source,
        memo: Option<String>,
        external_ref: Option<String>,
    ) -> RewardsResult<LedgerEntry> {
        let entry = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            INSERT INTO reward_ledger (
                patient_id,
                entry_type,
                amount,
                source,
                memo,
                external_ref
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            sql_fragment::LEDGER_FIELDS
        ))
        .bind(patient_id)
        .bind(entry_type)
        .bind(amount)
        .bind(source)
        .bind(memo)
        .bind(external_ref)
        .fetch_one(&mut **tx)
        .await?;

        Ok(entry)
    }

    async fn find_by_external_ref<'e, E>(
        executor: E,
        external_ref: &str,
    ) -> SqlxResult<Option<LedgerEntry>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {} FROM reward_ledger WHERE external_ref = $1",
            sql_fragment::LEDGER_FIELDS
        ))
        .bind(external_ref)
        .fetch_optional(executor)
        .await
    }
}
