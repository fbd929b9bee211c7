//! Backend services.

pub mod storage_service;

use sqlx::SqlitePool;

/// Schema applied by `serve --migrate` and by tests.
const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Run the SQLite schema migration, one statement at a time.
pub async fn run_migrations(db: &SqlitePool) -> anyhow::Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
