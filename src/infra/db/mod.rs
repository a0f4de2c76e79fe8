//! Postgres-backed cache index.

mod cache_index;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;
use std::time::Duration;

use sqlx::{
    Postgres, Transaction,
    migrate::MigrateError,
    postgres::{PgPool, PgPoolOptions},
};
use tracing::info;

use crate::config::DatabaseSettings;
use crate::infra::error::InfraError;

/// Bounds how long a request-path lookup waits for a connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// Cache index stored in `page_cache_entries` and `page_cache_dependencies`.
///
/// Every process pointing at the same database shares one index, so entries
/// written by a server are visible to the `flush`/`invalidate` commands.
#[derive(Clone)]
pub struct PostgresCacheIndex {
    pool: Arc<PgPool>,
}

impl PostgresCacheIndex {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect, apply pending migrations and wrap the pool.
    pub async fn open(settings: &DatabaseSettings) -> Result<Self, InfraError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.get())
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        Self::run_migrations(&pool).await?;
        info!(
            max_connections = settings.max_connections.get(),
            "Cache index database ready"
        );

        Ok(Self::new(pool))
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
    }
}
