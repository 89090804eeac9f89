//! Pre-authorization holds and settlement against the quota ledger.
//!
//! A call either takes a hold for its estimated cost before dispatch, or, when
//! both the user and token balances comfortably exceed the estimate, skips the
//! hold entirely (the trusted path). The trusted path reads balances without
//! reserving anything, so concurrent trusted calls can together overdraw an
//! account by at most one round of costs.

use std::{sync::Arc, time::Duration};

use super::{Caller, RelayError};
use crate::ledger::{AccountId, LedgerError, QuotaLedger};

const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_BACKOFF: Duration = Duration::from_millis(10);

/// Quota reserved for one call. Reconciled exactly once by either
/// [`QuotaService::settle`] or [`QuotaService::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Hold {
    pub user_id: i64,
    pub token_id: i64,
    /// Quota taken from each charged account. Zero on the trusted path.
    pub amount: i64,
    /// Unlimited tokens are never debited.
    pub charge_token: bool,
    pub trusted: bool,
}

#[derive(Clone)]
pub struct QuotaService {
    ledger: Arc<dyn QuotaLedger>,
    trust_multiplier: i64,
}

impl QuotaService {
    pub fn new(ledger: Arc<dyn QuotaLedger>, trust_multiplier: i64) -> Self {
        Self {
            ledger,
            trust_multiplier,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn QuotaLedger> {
        &self.ledger
    }

    /// Reserve `estimate` for a call, or decide it is trusted.
    #[tracing::instrument(skip(self, caller), fields(user_id = caller.user_id, token_id = caller.token_id))]
    pub async fn pre_authorize(&self, caller: &Caller, estimate: i64) -> Result<Hold, RelayError> {
        let user = AccountId::User(caller.user_id);
        let token = AccountId::Token(caller.token_id);
        let charge_token = !caller.token_unlimited;

        let user_balance = self.ledger.read(user).await?;
        if user_balance <= 0 || user_balance - estimate < 0 {
            return Err(RelayError::InsufficientQuota { account: "user" });
        }

        let threshold = estimate.saturating_mul(self.trust_multiplier);
        let token_trusted = if charge_token {
            self.ledger.read(token).await? > threshold
        } else {
            true
        };
        if user_balance > threshold && token_trusted {
            tracing::debug!(user_balance, estimate, "Trusted call, skipping hold");
            return Ok(Hold {
                user_id: caller.user_id,
                token_id: caller.token_id,
                amount: 0,
                charge_token,
                trusted: true,
            });
        }

        if charge_token && !self.ledger.try_decrement(token, estimate).await? {
            return Err(RelayError::InsufficientQuota { account: "token" });
        }
        match self.ledger.try_decrement(user, estimate).await {
            Ok(true) => {}
            Ok(false) => {
                self.refund_token(charge_token, token, estimate).await;
                return Err(RelayError::InsufficientQuota { account: "user" });
            }
            Err(e) => {
                self.refund_token(charge_token, token, estimate).await;
                return Err(e.into());
            }
        }

        tracing::debug!(estimate, "Placed pre-authorization hold");
        Ok(Hold {
            user_id: caller.user_id,
            token_id: caller.token_id,
            amount: estimate,
            charge_token,
            trusted: false,
        })
    }

    async fn refund_token(&self, charge_token: bool, token: AccountId, amount: i64) {
        if !charge_token {
            return;
        }
        if let Err(e) = self.ledger.increment(token, amount).await {
            tracing::error!(
                error = %e,
                account = %token,
                amount,
                "Failed to refund token hold after user hold was refused"
            );
        }
    }

    /// Return a hold untouched. Used when the call fails after the hold.
    pub async fn release(&self, hold: &Hold) -> Result<(), LedgerError> {
        if hold.amount == 0 {
            return Ok(());
        }
        self.apply(hold, hold.amount).await
    }

    /// Charge the final cost: applies `cost - hold` to each charged account.
    /// Returns the delta.
    pub async fn settle(&self, hold: &Hold, cost: i64) -> Result<i64, LedgerError> {
        let delta = cost - hold.amount;
        if delta != 0 {
            self.apply(hold, -delta).await?;
        }
        Ok(delta)
    }

    /// Add `amount` to the user and, when charged, the token.
    async fn apply(&self, hold: &Hold, amount: i64) -> Result<(), LedgerError> {
        if hold.charge_token {
            self.increment_with_retry(AccountId::Token(hold.token_id), amount)
                .await?;
        }
        self.increment_with_retry(AccountId::User(hold.user_id), amount)
            .await
    }

    async fn increment_with_retry(&self, account: AccountId, amount: i64) -> Result<(), LedgerError> {
        let mut attempt = 0;
        loop {
            match self.ledger.increment(account, amount).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt + 1 < SETTLE_ATTEMPTS => {
                    let backoff = SETTLE_BACKOFF * 2u32.pow(attempt);
                    tracing::warn!(
                        error = %e,
                        %account,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Ledger update failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
