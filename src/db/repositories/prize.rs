use sqlx::{Pool, Postgres};
use tinyrand::{Rand, RandRange, Seeded, StdRand};
use tinyrand_std::ClockSeed;
use tracing::instrument;

use super::sql_fragment;
use crate::db::models::prize::{Prize, Spin};
use crate::db::models::wallet::{PatientId, Source};
use crate::db::repositories::wallet::WalletRepository;
use crate::db::repositories::{Repository, RewardsErr, RewardsResult};

#[derive(Debug)]
pub struct PrizeRepository {
    pool: &'static Pool<Postgres>,
}

#[async_trait::async_trait]
impl Repository for PrizeRepository {
    type Ident = i64;
    type Output = Prize;

    const BASE_FIELDS: &'static str = sql_fragment::PRIZE_FIELDS;
    const TABLE_NAME: &'static str = "reward_prizes";

    fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &'static Pool<Postgres> {
        self.pool
    }
}

impl PrizeRepository {
    #[instrument(skip(self))]
    pub async fn active_prizes(&self) -> RewardsResult<Vec<Prize>> {
        let prizes = sqlx::query_as::<_, Prize>(&format!(
            r#"
            SELECT {}
            FROM reward_prizes
            WHERE active
            AND (inventory IS NULL OR inventory > 0)
            ORDER BY id ASC
            "#,
            sql_fragment::PRIZE_FIELDS
        ))
        .fetch_all(self.pool)
        .await?;

        Ok(prizes)
    }

    /// Draws one prize from the active pool, weighted by `Prize::weight`, and
    /// records the spin.
    ///
    /// Finite inventory is consumed with a conditional decrement rather than
    /// a lock over the whole pool: two spins racing for the last unit cannot
    /// both succeed, the loser surfaces `StorageConflict` and nothing it did
    /// persists. Token prizes pay out in the same transaction as the spin
    /// record.
    #[instrument(skip(self))]
    pub async fn spin(&self, patient_id: PatientId) -> RewardsResult<Spin> {
        let mut tx = self.pool.begin().await?;

        let prizes = sqlx::query_as::<_, Prize>(&format!(
            r#"
            SELECT {}
            FROM reward_prizes
            WHERE active
            AND (inventory IS NULL OR inventory > 0)
            ORDER BY id ASC
            "#,
            sql_fragment::PRIZE_FIELDS
        ))
        .fetch_all(&mut *tx)
        .await?;

        if prizes.is_empty() {
            return Err(RewardsErr::NoPrizesAvailable);
        }

        let total_weight: i64 = prizes.iter().map(|p| p.weight).sum();
        let mut rand = StdRand::seed(ClockSeed::default().next_u64());
        let roll = rand.next_range(0..total_weight as u64) as i64;
        let prize = &prizes[pick_weighted(&prizes, roll)];

        if prize.inventory.is_some() {
            let updated = sqlx::query(
                r#"
                UPDATE reward_prizes
                SET inventory = inventory - 1,
                    updated_at = NOW()
                WHERE id = $1
                AND inventory > 0
                "#,
            )
            .bind(prize.id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tracing::debug!(prize_id = prize.id, "lost inventory race on drawn prize");
                return Err(RewardsErr::StorageConflict(
                    "prize inventory exhausted during draw",
                ));
            }
        }

        let spin = sqlx::query_as::<_, Spin>(&format!(
            r#"
            INSERT INTO reward_spins (patient_id, prize_id, prize_label, token)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            sql_fragment::SPIN_FIELDS
        ))
        .bind(patient_id)
        .bind(prize.id)
        .bind(&prize.label)
        .bind(prize.token)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(token) = prize.token {
            WalletRepository::credit_in_tx(
                &mut tx,
                patient_id,
                token,
                Source::Spin,
                Some(format!("prize wheel: {}", prize.label)),
                None,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(spin)
    }
}

/// Index of the prize selected by `roll`, where `roll` is uniform over
/// `0..Σweight`. Selection probability for prize `i` is `weight_i / Σweight`.
pub(crate) fn pick_weighted(prizes: &[Prize], roll: i64) -> usize {
    let mut acc = 0;
    for (idx, prize) in prizes.iter().enumerate() {
        acc += prize.weight;
        if roll < acc {
            return idx;
        }
    }

    // roll is always < Σweight; reachable only on an empty slice misuse
    prizes.len().saturating_sub(1)
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;

    fn prize(id: i64, weight: i64) -> Prize {
        Prize {
            id,
            label: format!("prize-{id}"),
            token: None,
            weight,
            inventory: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_pick_weighted_respects_boundaries() {
        let pool = vec![prize(1, 5), prize(2, 1)];

        // rolls 0..=4 land in the first bucket, roll 5 in the second
        for roll in 0..5 {
            assert_eq!(pick_weighted(&pool, roll), 0);
        }
        assert_eq!(pick_weighted(&pool, 5), 1);
    }

    #[test]
    fn test_pick_weighted_single_prize() {
        let pool = vec![prize(1, 3)];
        for roll in 0..3 {
            assert_eq!(pick_weighted(&pool, roll), 0);
        }
    }

    #[test]
    fn test_pick_weighted_equal_weights_cover_all() {
        let pool = vec![prize(1, 2), prize(2, 2), prize(3, 2)];

        assert_eq!(pick_weighted(&pool, 0), 0);
        assert_eq!(pick_weighted(&pool, 1), 0);
        assert_eq!(pick_weighted(&pool, 2), 1);
        assert_eq!(pick_weighted(&pool, 3), 1);
        assert_eq!(pick_weighted(&pool, 4), 2);
        assert_eq!(pick_weighted(&pool, 5), 2);
    }

    #[test]
    fn test_in_stock() {
        let mut p = prize(1, 1);
        assert!(p.in_stock());

        p.inventory = Some(1);
        assert!(p.in_stock());

        p.inventory = Some(0);
        assert!(!p.in_stock());
    }
}
