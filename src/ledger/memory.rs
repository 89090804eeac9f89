use std::{
    hint,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{AccountId, LedgerError, LedgerResult, QuotaLedger};

/// Maximum number of CAS retries before reporting contention.
const MAX_CAS_RETRIES: usize = 100;

/// In-process ledger. Balances live in atomics so holds and settlements on
/// one account never take a lock.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    balances: DashMap<AccountId, Arc<AtomicI64>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn balance(&self, account: AccountId) -> LedgerResult<Arc<AtomicI64>> {
        self.balances
            .get(&account)
            .map(|b| Arc::clone(b.value()))
            .ok_or(LedgerError::UnknownAccount(account))
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn read(&self, account: AccountId) -> LedgerResult<i64> {
        Ok(self.balance(account)?.load(Ordering::SeqCst))
    }

    async fn try_decrement(&self, account: AccountId, amount: i64) -> LedgerResult<bool> {
        let balance = self.balance(account)?;
        if amount <= 0 {
            return Ok(true);
        }

        for _ in 0..MAX_CAS_RETRIES {
            let current = balance.load(Ordering::SeqCst);
            if current < amount {
                return Ok(false);
            }
            match balance.compare_exchange(
                current,
                current - amount,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(true),
                Err(_) => hint::spin_loop(),
            }
        }

        Err(LedgerError::Contention(account))
    }

    async fn increment(&self, account: AccountId, delta: i64) -> LedgerResult<i64> {
        let balance = self.balance(account)?;
        Ok(balance.fetch_add(delta, Ordering::SeqCst) + delta)
    }

    async fn seed(&self, account: AccountId, quota: i64) -> LedgerResult<()> {
        self.balances
            .entry(account)
            .or_insert_with(|| Arc::new(AtomicI64::new(quota)));
        Ok(())
    }
}
