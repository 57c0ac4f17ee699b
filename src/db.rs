use anyhow::{Context, Result, anyhow};
use diesel::{Connection, PgConnection};
use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{AsyncDieselConnectionManager, bb8::Pool},
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};

pub type DieselError = diesel::result::Error;
pub type DbPool = Pool<AsyncPgConnection>;

pub async fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder()
        .build(manager)
        .await
        .context("Failed to build the DB connection pool")
}

/// Builds a pool without opening any connection. Connections are established on first use.
pub fn create_lazy_pool(database_url: &str) -> DbPool {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder().build_unchecked(manager)
}

/// Runs pending migrations on a blocking thread, returning how many were applied.
pub async fn run_migrations_blocking(
    migrations: EmbeddedMigrations,
    database_url: &str,
) -> Result<usize> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = PgConnection::establish(&database_url)
            .context("Failed to connect to the database for migrations")?;
        let applied = conn
            .run_pending_migrations(migrations)
            .map_err(|e| anyhow!("Failed to run migrations: {e}"))?;
        Ok(applied.len())
    })
    .await
    .context("Migration task panicked")?
}
