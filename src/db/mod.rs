use std::sync::LazyLock;

use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::util::env;
use crate::util::env::Var;
use crate::var;

pub mod models;
pub mod repositories;

pub mod prelude {
    pub use crate::db::db_pool;
    pub use crate::db::PgError;

    pub use crate::db::models::wallet::{EntryKind, LedgerEntry, PatientId, Source, Wallet};
    pub use crate::db::models::task::{Task, TaskCompletion};
    pub use crate::db::models::prize::{Prize, Spin};

    pub use crate::db::repositories::prize::PrizeRepository;
    pub use crate::db::repositories::task::TaskRepository;
    pub use crate::db::repositories::wallet::WalletRepository;
    pub use crate::db::repositories::Repository; // + trait to provide base methods
    pub use crate::db::repositories::{RewardsErr, RewardsResult};
}

static DB_POOL: LazyLock<OnceCell<Db>> = LazyLock::new(OnceCell::new);
pub async fn db_pool() -> PgResult<&'static PgPool> {
    Ok(&DB_POOL
        .get_or_try_init(|| async { Db::new_pool().await })
        .await?
        .pool)
}

/// Applies the embedded migrations; run once at startup
pub async fn run_migrations(pool: &PgPool) -> PgResult<()> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn new_pool() -> PgResult<Self> {
        let db_url = var!(Var::DatabaseUrl).await?;
        let pool = sqlx::PgPool::connect(db_url).await?;

        Ok(Self { pool })
    }
}

pub type PgResult<T> = core::result::Result<T, PgError>;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum PgError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    EnvError(#[from] env::EnvErr),
}
