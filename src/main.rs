use std::net::SocketAddr;

use futures::future::join_all;
use thiserror::Error;

use crate::util::telemetry::Telemetry;

mod api;
mod constants;
mod db;
mod util;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),

    #[error(transparent)]
    Pg(#[from] db::PgError),

    #[error(transparent)]
    Route(#[from] api::server::RouteError),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::new().await?.register();
    tracing::info!("starting rewards service");

    let pool = db::db_pool().await?;
    db::run_migrations(pool).await?;

    let (tx_server_ready, rx_server_ready) = tokio::sync::mpsc::unbounded_channel::<SocketAddr>();
    let handles = api::server::start_server(tx_server_ready, rx_server_ready).await?;
    _ = join_all(handles).await;

    telemetry.shutdown();
    Ok(())
}
