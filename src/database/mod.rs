//! Async persistence, built on `sqlx` + SQLite: a `DatabaseManager`
//! wrapping a `SqlitePool`, migrations
//! run via `sqlx::migrate!`, and one `impl DatabaseManager` block per entity
//! in its own submodule. Row structs (`Db*`) never leak a raw `sqlx::Row`
//! upward — each repository method returns or accepts the domain types
//! defined in their owning modules (`routing::Task`, `consent::Consent`,
//! `audit::AuditEntry`, ...).
//!
//! `anyhow::Result` is used at this boundary to keep sqlx plumbing out of
//! the crate-wide error enum; call sites outside `database` only ever
//! see [`crate::error::Result`] via the `?`-propagating `From<sqlx::Error>`
//! and `From<DatabaseError>` conversions in `error.rs`.

pub mod audit;
pub mod campaigns;
pub mod delivery;
pub mod rules;
pub mod tasks;
pub mod tenants;
pub mod workers;

use anyhow::{anyhow, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

/// Owns the connection pool; cheap to `Clone` (an `Arc` internally via
/// `SqlitePool`) so every component that needs persistence can hold its own
/// handle, the same way `CallCenterEngine` shares its `DatabaseManager`.
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Connects and runs pending migrations from `./migrations`.
    pub async fn new(database_url: &str) -> Result<Self> {
        info!(database_url, "initializing database manager");
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| anyhow!("failed to connect to database: {e}"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| anyhow!("failed to run migrations: {e}"))?;
        Ok(Self { pool })
    }

    /// In-memory database for tests and ephemeral deployments.
    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| anyhow!("failed to start transaction: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_database_runs_migrations() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let tenants = db.list_tenants().await.unwrap();
        assert!(tenants.is_empty());
    }

    #[tokio::test]
    async fn database_manager_is_send_safe() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let handle = tokio::spawn(async move {
            let _ = db.list_tenants().await.unwrap();
        });
        handle.await.unwrap();
    }
}
