//! Database connection pool management.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

/// Type alias for the database pool.
pub type Pool = PgPool;

/// Upper bound on any statement, record writes included. A write stamps
/// `changed_at` while its statement runs, so it commits within this long of
/// its stamp or not at all.
pub const STATEMENT_TIMEOUT_MS: i64 = 5_000;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                let timeout = format!("SET statement_timeout = {STATEMENT_TIMEOUT_MS}");
                conn.execute(timeout.as_str()).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Server clock in milliseconds since the epoch.
pub async fn server_time(pool: &Pool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT (EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT")
        .fetch_one(pool)
        .await
}
