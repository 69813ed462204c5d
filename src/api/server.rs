use std::net::SocketAddr;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware as midware;
use crate::api::middleware::access::{AccessErr, attach_caller};
use crate::api::middleware::verify_webhook::verify_webhook_ident;
use crate::db::prelude::*;
use crate::util::env::{EnvErr, Var};
use crate::var;

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

#[derive(Clone, Debug)]
pub struct AppState {
    pub db_pool: &'static PgPool,
}

#[instrument(skip(tx))]
pub async fn router(tx: UnboundedSender<SocketAddr>) {
    let state = Arc::new(AppState {
        db_pool: db_pool().await.unwrap(),
    });

    let cors = midware::cors().await.unwrap();

    //
    // partner webhook callback
    let webhook_post_routes = Router::new()
        .route("/callback", post(webhook_credit))
        .route_layer(middleware::from_fn(verify_webhook_ident));

    //
    // gateway-authenticated caller routes
    let caller_routes = Router::new()
        .route("/rewards/wallet/{patient_id}", get(wallet_snapshot))
        .route("/rewards/ledger/{patient_id}", get(ledger_history))
        .route("/rewards/credit", post(grant_credit))
        .route("/rewards/redeem", post(redeem))
        .route("/rewards/tasks", get(task_catalog))
        .route("/rewards/tasks/{task_code}/complete", post(complete_task))
        .route("/rewards/prizes", get(prize_pool))
        .route("/rewards/spin", post(spin))
        .route_layer(middleware::from_fn(attach_caller));

    let app = Router::new()
        .merge(webhook_post_routes)
        .merge(caller_routes)
        //
        // general
        .route("/", get(|| async { Response::new(Body::empty()) }))
        .route("/checkhealth", get(|| async { "SERVER_OK" }))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .layer(cors)
        .with_state(state);

    let port = var!(Var::ServerApiPort)
        .await
        .unwrap()
        .parse::<u16>()
        .unwrap();

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await.unwrap();

    tx.send(socket_addr).unwrap();
    axum::serve(listener, app).await.unwrap()
}

/// Custom error trace handler for `RouteError`-type responses
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

#[instrument]
pub async fn start_server(
    tx: UnboundedSender<SocketAddr>,
    mut rx: UnboundedReceiver<SocketAddr>,
) -> Result<Vec<JoinHandle<()>>, RouteError> {
    tracing::info!("starting server");
    let server_handle = tokio::task::spawn(async move {
        router(tx).await;
    });

    let logging_handle = tokio::task::spawn(async move {
        while !rx.is_closed() {
            if let Some(msg) = rx.recv().await {
                tracing::info!(
                    server_url = &format!("http://127.0.0.1:{}", msg.port()),
                    "server ready"
                );
                break;
            }
        }
    });

    let handles = vec![server_handle, logging_handle];
    Ok(handles)
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Rewards(#[from] RewardsErr),

    #[error(transparent)]
    Access(#[from] AccessErr),

    #[error(transparent)]
    QueryError(#[from] PgError),

    #[error(transparent)]
    EnvError(#[from] EnvErr),

    #[error(transparent)]
    SqlxError(#[from] sqlx::error::Error),
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let (status, message, err) = match &self {
            RouteError::Rewards(rewards_err) => {
                let status = match rewards_err {
                    RewardsErr::InvalidAmount(_) => StatusCode::BAD_REQUEST,
                    RewardsErr::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
                    RewardsErr::TaskNotFound(_) => StatusCode::NOT_FOUND,
                    RewardsErr::DailyCapReached { .. } => StatusCode::TOO_MANY_REQUESTS,
                    RewardsErr::NoPrizesAvailable => StatusCode::NOT_FOUND,
                    RewardsErr::StorageConflict(_) => StatusCode::CONFLICT,
                    RewardsErr::Sqlx(_) | RewardsErr::Env(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };

                (status, rewards_err.to_string(), Some(self))
            }

            RouteError::Access(access_err) => {
                (StatusCode::FORBIDDEN, access_err.to_string(), None)
            }

            RouteError::QueryError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                Some(self),
            ),

            RouteError::EnvError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                Some(self),
            ),

            RouteError::SqlxError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                Some(self),
            ),
        };

        let mut response = (status, Json(ErrorResponse { message })).into_response();
        if let Some(err) = err {
            response.extensions_mut().insert(Arc::new(err));
        }

        response
    }
}
