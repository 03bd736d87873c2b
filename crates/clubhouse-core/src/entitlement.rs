//! Time-bounded VIP entitlements.
//!
//! The registry's in-memory map is the single writable copy. Every mutation
//! builds the next snapshot, persists it through the injected repository, and
//! only then swaps it in, so a reader never observes state that is not durable.

use crate::clock::Clock;
use crate::error::ClubhouseError;
use crate::repository::{EntitlementRepository, EntitlementSnapshot};
use crate::types::UserId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

pub struct EntitlementRegistry {
    repository: Arc<dyn EntitlementRepository>,
    clock: Arc<dyn Clock>,
    entries: Mutex<EntitlementSnapshot>,
    user_locks: std::sync::Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl EntitlementRegistry {
    /// Hydrate the registry from its repository.
    pub async fn load(
        repository: Arc<dyn EntitlementRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClubhouseError> {
        let entries = repository.load().await?;
        info!(
            backend = repository.label(),
            tracked = entries.len(),
            "entitlement registry loaded"
        );

        Ok(Self {
            repository,
            clock,
            entries: Mutex::new(entries),
            user_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Serialize platform role changes for one user.
    ///
    /// Callers hold the guard across the authority call and the matching
    /// registry update (apply + grant, strip + revoke), so a strip issued by
    /// the reconciler can never land after a fresh grant for the same user.
    pub async fn lock_user(&self, user: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .user_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Idle locks are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(user).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record an entitlement expiring `duration` from now, replacing any prior record.
    pub async fn grant(
        &self,
        user: UserId,
        duration: Duration,
    ) -> Result<DateTime<Utc>, ClubhouseError> {
        if duration <= Duration::zero() {
            return Err(ClubhouseError::InvalidDuration(duration.to_string()));
        }
        let expiry = self
            .clock
            .now()
            .checked_add_signed(duration)
            .ok_or_else(|| ClubhouseError::InvalidDuration(duration.to_string()))?;

        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        next.insert(user, expiry);
        self.repository.save(&next).await?;
        *entries = next;

        info!(user_id = %user, expires_at = %expiry, "entitlement granted");
        Ok(expiry)
    }

    /// Drop the record for `user`, returning the expiry it carried.
    ///
    /// An untracked user yields `EntitlementNotFound` and nothing is persisted.
    pub async fn revoke(&self, user: UserId) -> Result<DateTime<Utc>, ClubhouseError> {
        let mut entries = self.entries.lock().await;
        let Some(expiry) = entries.get(&user).copied() else {
            debug!(user_id = %user, "revoke on untracked user");
            return Err(ClubhouseError::EntitlementNotFound(user));
        };

        let mut next = entries.clone();
        next.remove(&user);
        self.repository.save(&next).await?;
        *entries = next;

        info!(user_id = %user, "entitlement revoked");
        Ok(expiry)
    }

    pub async fn query(&self, user: UserId) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(&user).copied()
    }

    /// Time left on the entitlement, clamped at zero once expired.
    pub async fn remaining(&self, user: UserId) -> Option<Duration> {
        let expiry = self.query(user).await?;
        let left = expiry - self.clock.now();
        Some(left.max(Duration::zero()))
    }

    /// Every tracked user whose expiry is at or before `as_of`.
    pub async fn list_expired(&self, as_of: DateTime<Utc>) -> Vec<UserId> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, expiry)| **expiry <= as_of)
            .map(|(user, _)| *user)
            .collect()
    }

    /// Remove a batch of reconciled users with a single persist.
    ///
    /// A user is only removed if their record is still expired as of `as_of`;
    /// a grant that landed while the batch was in flight is kept.
    pub async fn remove_expired(
        &self,
        users: &[UserId],
        as_of: DateTime<Utc>,
    ) -> Result<Vec<UserId>, ClubhouseError> {
        let mut entries = self.entries.lock().await;
        let removable: Vec<UserId> = users
            .iter()
            .copied()
            .filter(|user| entries.get(user).is_some_and(|expiry| *expiry <= as_of))
            .collect();
        if removable.is_empty() {
            return Ok(removable);
        }

        let mut next = entries.clone();
        for user in &removable {
            next.remove(user);
        }
        self.repository.save(&next).await?;
        *entries = next;

        Ok(removable)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> EntitlementSnapshot {
        self.entries.lock().await.clone()
    }
}
