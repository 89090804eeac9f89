mod error;
pub mod memory;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

#[cfg(test)]
pub mod tests;

use std::sync::Arc;

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::{
    config::DatabaseConfig,
    ledger::{MemoryLedger, QuotaLedger},
};

/// Cached repository trait objects, created once at startup.
struct CachedRepos {
    chat_logs: Arc<dyn ChatLogRepo>,
    consume_logs: Arc<dyn ConsumeLogRepo>,
    ledger: Arc<dyn QuotaLedger>,
}

enum PoolStorage {
    Memory,
    #[cfg(feature = "database-sqlite")]
    Sqlite(sqlx::SqlitePool),
}

/// Storage for balances and logs: in-process, or SQLite when configured.
///
/// Repositories are cached at construction time to avoid allocation on each access.
pub struct DbPool {
    inner: PoolStorage,
    repos: CachedRepos,
}

impl DbPool {
    /// Everything in process memory. Balances and logs are lost on restart.
    pub fn in_memory() -> Self {
        DbPool {
            inner: PoolStorage::Memory,
            repos: CachedRepos {
                chat_logs: Arc::new(memory::MemoryChatLogRepo::new()),
                consume_logs: Arc::new(memory::MemoryConsumeLogRepo::new()),
                ledger: Arc::new(MemoryLedger::new()),
            },
        }
    }

    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    #[cfg(feature = "database-sqlite")]
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let repos = CachedRepos {
            chat_logs: Arc::new(sqlite::SqliteChatLogRepo::new(pool.clone())),
            consume_logs: Arc::new(sqlite::SqliteConsumeLogRepo::new(pool.clone())),
            ledger: Arc::new(crate::ledger::SqliteLedger::new(pool.clone())),
        };
        DbPool {
            inner: PoolStorage::Sqlite(pool),
            repos,
        }
    }

    /// Create a database pool from configuration
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            DatabaseConfig::None => Ok(Self::in_memory()),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(cfg) => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(
                        sqlx::sqlite::SqliteConnectOptions::new()
                            .filename(&cfg.path)
                            .create_if_missing(cfg.create_if_missing)
                            .journal_mode(if cfg.wal_mode {
                                sqlx::sqlite::SqliteJournalMode::Wal
                            } else {
                                sqlx::sqlite::SqliteJournalMode::Delete
                            })
                            .busy_timeout(std::time::Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                let db = Self::from_sqlite(pool);
                if cfg.run_migrations {
                    db.run_migrations().await?;
                }
                Ok(db)
            }
        }
    }

    /// Run database migrations using sqlx's migration runner.
    /// A no-op for the in-memory store.
    pub async fn run_migrations(&self) -> DbResult<()> {
        match &self.inner {
            PoolStorage::Memory => Ok(()),
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                tracing::info!("Running SQLite migrations");
                sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
                tracing::info!("SQLite migrations completed successfully");
                Ok(())
            }
        }
    }

    pub fn backend(&self) -> &'static str {
        match &self.inner {
            PoolStorage::Memory => "memory",
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(_) => "sqlite",
        }
    }

    /// Round-trip to the backing store.
    pub async fn health_check(&self) -> DbResult<()> {
        match &self.inner {
            PoolStorage::Memory => Ok(()),
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
        }
    }

    pub fn chat_logs(&self) -> Arc<dyn ChatLogRepo> {
        Arc::clone(&self.repos.chat_logs)
    }

    pub fn consume_logs(&self) -> Arc<dyn ConsumeLogRepo> {
        Arc::clone(&self.repos.consume_logs)
    }

    pub fn ledger(&self) -> Arc<dyn QuotaLedger> {
        Arc::clone(&self.repos.ledger)
    }
}
