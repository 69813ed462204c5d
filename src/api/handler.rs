use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::api::middleware::access::{Caller, Role, RoleSet};
use crate::api::server::{AppState, JsonResult};
use crate::constants::MAX_PAGE_LIMIT;
use crate::db::models::{PaginatedResponse, Pagination};
use crate::db::prelude::*;

const PATIENT_ONLY: RoleSet = RoleSet::of(&[Role::Patient]);
const STAFF: RoleSet = RoleSet::of(&[Role::Clinician, Role::Admin]);
const ANY_CALLER: RoleSet = RoleSet::of(&[Role::Patient, Role::Clinician, Role::Admin]);

/// Token grants staff can issue by hand; webhook and activity credits have
/// their own entry points and sources
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantSource {
    Manual,
    Airdrop,
}

impl From<GrantSource> for Source {
    fn from(value: GrantSource) -> Self {
        match value {
            GrantSource::Manual => Source::Manual,
            GrantSource::Airdrop => Source::Airdrop,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub patient_id: i64,
    pub amount: i64,
    pub source: GrantSource,
    pub memo: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub amount: i64,
    pub memo: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RedeemReceipt {
    pub receipt: Uuid,
    pub entry: LedgerEntry,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteTaskRequest {
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookCreditRequest {
    pub patient_id: i64,
    pub amount: i64,
    pub external_ref: String,
    pub memo: Option<String>,
}

fn page_window(pagination: &Pagination) -> (i64, i64) {
    let limit = pagination.limit.clamp(1, MAX_PAGE_LIMIT);
    let offset = pagination.page.max(0) * limit;

    (limit, offset)
}

/// Wallet balance for a patient, creating the wallet on first sight
#[instrument(skip(state))]
pub async fn wallet_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(patient_id): Path<i64>,
) -> JsonResult<Wallet> {
    let patient_id = PatientId(patient_id);
    caller.require_self_or(patient_id, STAFF)?;

    let wallet = WalletRepository::new(state.db_pool)
        .ensure_wallet(patient_id)
        .await?;

    Ok(Json(wallet))
}

/// Ledger history for a patient, newest entries first
#[instrument(skip(state, pagination))]
pub async fn ledger_history(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(patient_id): Path<i64>,
    Query(pagination): Query<Pagination>,
) -> JsonResult<PaginatedResponse<LedgerEntry>> {
    let patient_id = PatientId(patient_id);
    caller.require_self_or(patient_id, STAFF)?;

    let (limit, offset) = page_window(&pagination);
    let page = WalletRepository::new(state.db_pool)
        .ledger(patient_id, limit, offset)
        .await?;

    Ok(Json(page))
}

/// Staff-issued token grant
#[instrument(skip(state, req))]
pub async fn grant_credit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreditRequest>,
) -> JsonResult<LedgerEntry> {
    caller.require(STAFF)?;

    let entry = WalletRepository::new(state.db_pool)
        .credit(
            PatientId(req.patient_id),
            req.amount,
            req.source.into(),
            req.memo,
            None,
        )
        .await?;

    Ok(Json(entry))
}

/// Spends tokens from the caller's own wallet against clinic stock
#[instrument(skip(state, req))]
pub async fn redeem(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<RedeemRequest>,
) -> JsonResult<RedeemReceipt> {
    caller.require(PATIENT_ONLY)?;
    let patient_id = caller.own_patient_id()?;

    let receipt = Uuid::new_v4();
    let memo = req.memo.unwrap_or_else(|| format!("redemption {receipt}"));

    let entry = WalletRepository::new(state.db_pool)
        .debit(patient_id, req.amount, Source::Redemption, Some(memo))
        .await?;

    Ok(Json(RedeemReceipt { receipt, entry }))
}

#[instrument(skip(state))]
pub async fn task_catalog(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> JsonResult<Vec<Task>> {
    caller.require(ANY_CALLER)?;

    let tasks = TaskRepository::new(state.db_pool).active_tasks().await?;
    Ok(Json(tasks))
}

/// Records a task completion for the caller and pays out its reward,
/// subject to the task's per-day cap
#[instrument(skip(state, req))]
pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(task_code): Path<String>,
    req: Option<Json<CompleteTaskRequest>>,
) -> JsonResult<LedgerEntry> {
    caller.require(PATIENT_ONLY)?;
    let patient_id = caller.own_patient_id()?;

    let meta = req.and_then(|Json(body)| body.meta);
    let entry = TaskRepository::new(state.db_pool)
        .complete_task(patient_id, &task_code, meta)
        .await?;

    Ok(Json(entry))
}

#[instrument(skip(state))]
pub async fn prize_pool(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> JsonResult<Vec<Prize>> {
    caller.require(ANY_CALLER)?;

    let prizes = PrizeRepository::new(state.db_pool).active_prizes().await?;
    Ok(Json(prizes))
}

/// One weighted draw on the prize wheel for the caller
#[instrument(skip(state))]
pub async fn spin(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> JsonResult<Spin> {
    caller.require(PATIENT_ONLY)?;
    let patient_id = caller.own_patient_id()?;

    let spin = PrizeRepository::new(state.db_pool).spin(patient_id).await?;
    Ok(Json(spin))
}

/// Partner-system credit delivery; `external_ref` makes redelivery of the
/// same upstream event credit at most once
#[instrument(skip(state, req))]
pub async fn webhook_credit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WebhookCreditRequest>,
) -> JsonResult<LedgerEntry> {
    let entry = WalletRepository::new(state.db_pool)
        .credit(
            PatientId(req.patient_id),
            req.amount,
            Source::Webhook,
            req.memo,
            Some(req.external_ref),
        )
        .await?;

    Ok(Json(entry))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_page_window_clamps_limit_and_page() {
        let (limit, offset) = page_window(&Pagination { limit: 10, page: 3 });
        assert_eq!((limit, offset), (10, 30));

        let (limit, _) = page_window(&Pagination {
            limit: 10_000,
            page: 0,
        });
        assert_eq!(limit, MAX_PAGE_LIMIT);

        let (limit, offset) = page_window(&Pagination { limit: 0, page: -2 });
        assert_eq!((limit, offset), (1, 0));
    }

    #[test]
    fn test_grant_source_wire_format() {
        let source: GrantSource = serde_json::from_str(r#""MANUAL""#).unwrap();
        assert!(matches!(Source::from(source), Source::Manual));

        let source: GrantSource = serde_json::from_str(r#""AIRDROP""#).unwrap();
        assert!(matches!(Source::from(source), Source::Airdrop));

        assert!(serde_json::from_str::<GrantSource>(r#""WEBHOOK""#).is_err());
    }
}
