//! Postgres pool setup and schema migrations

use std::{str::FromStr, time::Duration};

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

/// Connection options shared by every pool. Statement caching is off so the
/// pools work behind a transaction-mode connection pooler.
fn connect_options(database_url: &str) -> Result<PgConnectOptions, sqlx::Error> {
    Ok(PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0))
}

/// Request-serving pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(connect_options(database_url)?)
        .await
}

/// Single-connection pool with a generous acquire timeout, used only while
/// migrations run at startup
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(120))
        .max_lifetime(Duration::from_secs(180))
        .connect_with(connect_options(database_url)?)
        .await
}

/// Apply the embedded migrations from the workspace `migrations/` directory
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_rejects_garbage() {
        assert!(connect_options("not a url").is_err());
        assert!(connect_options("postgres://finplan@localhost:5432/finplan").is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_pool_serves_queries() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, 2).await.expect("pool");
        let (one,): (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query");
        assert_eq!(one, 1);
    }
}
