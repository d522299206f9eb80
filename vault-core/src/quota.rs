use crate::error::{Result, VaultError};
use crate::storage::MetadataStore;
use std::sync::Arc;

/// Single choke point for quota mutation. Every debit and credit that
/// affects a principal's remaining budget goes through here; callers never
/// touch the quota column directly.
///
/// Both operations map to single conditional statements in the metadata
/// store, so they are linearizable per principal and independent across
/// principals.
#[derive(Clone)]
pub struct QuotaLedger {
    meta: Arc<MetadataStore>,
}

impl QuotaLedger {
    pub fn new(meta: Arc<MetadataStore>) -> Self {
        Self { meta }
    }

    /// Atomically subtract `amount` if the remaining budget covers it.
    /// Returns false (leaving the counter untouched) when it does not.
    pub fn try_debit(&self, principal_id: &str, amount: i64) -> Result<bool> {
        if amount < 0 {
            return Err(VaultError::InvalidRequest(format!(
                "debit amount cannot be negative: {}",
                amount
            )));
        }
        let debited = self.meta.try_debit_quota(principal_id, amount)?;
        if !debited {
            tracing::debug!(
                "quota debit rejected: principal={} amount={}",
                principal_id,
                amount
            );
        }
        Ok(debited)
    }

    /// Atomically add `amount` back. No ceiling is enforced beyond the
    /// running counter; crediting more than was debited is a caller bug,
    /// not a ledger concern.
    pub fn credit(&self, principal_id: &str, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(VaultError::InvalidRequest(format!(
                "credit amount cannot be negative: {}",
                amount
            )));
        }
        self.meta.credit_quota(principal_id, amount)
    }

    pub fn remaining(&self, principal_id: &str) -> Result<i64> {
        self.meta.quota_remaining(principal_id)
    }
}
