use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{AccountId, LedgerError, LedgerResult, QuotaLedger};

/// Ledger backed by the `accounts` table. The conditional decrement is a
/// single `UPDATE ... WHERE quota >= ?`, so SQLite serializes competing holds.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaLedger for SqliteLedger {
    async fn read(&self, account: AccountId) -> LedgerResult<i64> {
        let quota: Option<i64> =
            sqlx::query_scalar("SELECT quota FROM accounts WHERE kind = ? AND id = ?")
                .bind(account.kind())
                .bind(account.id())
                .fetch_optional(&self.pool)
                .await?;

        quota.ok_or(LedgerError::UnknownAccount(account))
    }

    async fn try_decrement(&self, account: AccountId, amount: i64) -> LedgerResult<bool> {
        if amount <= 0 {
            self.read(account).await?;
            return Ok(true);
        }

        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET quota = quota - ?, updated_at = datetime('now')
            WHERE kind = ? AND id = ? AND quota >= ?
            "#,
        )
        .bind(amount)
        .bind(account.kind())
        .bind(account.id())
        .bind(amount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "not enough" from "no such account".
        self.read(account).await?;
        Ok(false)
    }

    async fn increment(&self, account: AccountId, delta: i64) -> LedgerResult<i64> {
        let quota: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET quota = quota + ?, updated_at = datetime('now')
            WHERE kind = ? AND id = ?
            RETURNING quota
            "#,
        )
        .bind(delta)
        .bind(account.kind())
        .bind(account.id())
        .fetch_optional(&self.pool)
        .await?;

        quota.ok_or(LedgerError::UnknownAccount(account))
    }

    async fn seed(&self, account: AccountId, quota: i64) -> LedgerResult<()> {
        sqlx::query("INSERT OR IGNORE INTO accounts (kind, id, quota) VALUES (?, ?, ?)")
            .bind(account.kind())
            .bind(account.id())
            .bind(quota)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
