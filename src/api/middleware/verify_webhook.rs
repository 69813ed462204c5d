use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::StatusCode;
use http::header::AUTHORIZATION;

use crate::util::constant_time_cmp;
use crate::util::env::Var;
use crate::var;

/// Shared-secret check for the partner webhook callback. The token is an
/// optional capability: if `WEBHOOK_POST_TOKEN` is unset the route is
/// effectively disabled rather than open.
pub async fn verify_webhook_ident(req: Request, next: Next) -> Result<Response, StatusCode> {
    let headers = req.headers().clone();
    let authorized_header = headers
        .get(AUTHORIZATION)
        .ok_or(StatusCode::BAD_REQUEST)?
        .to_str()
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let webhook_token = var!(Var::WebhookPostToken)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    if !constant_time_cmp(authorized_header, webhook_token) {
        Err(StatusCode::UNAUTHORIZED)
    } else {
        Ok(next.run(req).await)
    }
}
