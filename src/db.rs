//! SQLite pool setup and schema migration.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;

/// Initial schema, compiled into the binary.
pub const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open a pool against `url`, creating the database file when missing.
/// Foreign keys are enforced on every connection.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Apply the embedded schema statement by statement. Every statement is
/// `IF NOT EXISTS`, so running twice is harmless.
pub async fn run_migrations(db: &SqlitePool) -> Result<usize, sqlx::Error> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in &statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(statements.len())
}
