//! Quota balances for users and tokens.
//!
//! Every operation on a single account is linearizable. Holds use
//! [`QuotaLedger::try_decrement`], which refuses to take a balance below
//! zero. Settlement uses [`QuotaLedger::increment`] with a signed delta and
//! may push a balance negative when a call cost more than it held.

mod memory;
#[cfg(feature = "database-sqlite")]
mod sqlite;

use std::fmt;

use async_trait::async_trait;
pub use memory::MemoryLedger;
#[cfg(feature = "database-sqlite")]
pub use sqlite::SqliteLedger;

/// A balance-carrying account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountId {
    User(i64),
    Token(i64),
}

impl AccountId {
    pub fn kind(&self) -> &'static str {
        match self {
            AccountId::User(_) => "user",
            AccountId::Token(_) => "token",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            AccountId::User(id) | AccountId::Token(id) => *id,
        }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("contention on account {0}")]
    Contention(AccountId),

    #[error("ledger storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "database-sqlite")]
impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Current balance.
    async fn read(&self, account: AccountId) -> LedgerResult<i64>;

    /// Subtract `amount` only if the balance stays non-negative. Returns
    /// whether the decrement happened. Non-positive amounts always succeed
    /// without touching the balance.
    async fn try_decrement(&self, account: AccountId, amount: i64) -> LedgerResult<bool>;

    /// Add a signed delta unconditionally and return the new balance.
    async fn increment(&self, account: AccountId, delta: i64) -> LedgerResult<i64>;

    /// Create the account with `quota` if it does not exist yet.
    async fn seed(&self, account: AccountId, quota: i64) -> LedgerResult<()>;
}
