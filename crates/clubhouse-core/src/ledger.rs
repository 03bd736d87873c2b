use crate::error::ClubhouseError;
use crate::storage::BalanceStore;
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Result of a successful balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub user: UserId,
    /// Signed change applied to the balance.
    pub delta: i64,
    pub balance: i64,
}

/// Credit ledger over a durable [`BalanceStore`].
///
/// Invariant handling:
/// - Amounts must be strictly positive.
/// - Read-modify-write sequences run under one exclusion region, so a debit
///   never observes a balance another mutation is about to change.
/// - The store is write-through; a receipt is only returned after the backend
///   reported the update durable.
pub struct CreditLedger {
    store: Arc<dyn BalanceStore>,
    write_guard: Mutex<()>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        Self {
            store,
            write_guard: Mutex::new(()),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    pub async fn balance(&self, user: UserId) -> Result<i64, ClubhouseError> {
        self.store.get_balance(user).await
    }

    pub async fn credit(&self, user: UserId, amount: i64) -> Result<LedgerReceipt, ClubhouseError> {
        ensure_positive(amount)?;

        let _guard = self.write_guard.lock().await;
        let balance = self.store.credit(user, amount).await?;
        info!(user_id = %user, amount, balance, "credits added");

        Ok(LedgerReceipt {
            user,
            delta: amount,
            balance,
        })
    }

    pub async fn debit(&self, user: UserId, amount: i64) -> Result<LedgerReceipt, ClubhouseError> {
        ensure_positive(amount)?;

        let _guard = self.write_guard.lock().await;
        let current = self.store.get_balance(user).await?;
        if current < amount {
            return Err(ClubhouseError::InsufficientBalance {
                balance: current,
                requested: amount,
            });
        }

        let balance = self.store.debit(user, amount).await?;
        info!(user_id = %user, amount, balance, "credits deducted");

        Ok(LedgerReceipt {
            user,
            delta: -amount,
            balance,
        })
    }
}

fn ensure_positive(amount: i64) -> Result<(), ClubhouseError> {
    if amount <= 0 {
        return Err(ClubhouseError::InvalidAmount(amount));
    }
    Ok(())
}
