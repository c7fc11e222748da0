// backend/src/db/mod.rs

use std::env;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

/// Connects to Postgres and applies pending migrations. The
/// (staff_id, date) upsert key the merge engine relies on lives in the
/// schema, so the service refuses to start against an unmigrated database.
pub async fn connect_and_migrate() -> anyhow::Result<Pool<Postgres>> {
    let database_url =
        env::var("DATABASE_URL").context("DATABASE_URL must be set (see .env)")?;
    let max_connections = env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("could not connect to Postgres")?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("database migrations failed")?;

    tracing::info!("✅ Postgres ready, migrations applied");
    Ok(pool)
}
