//! Collaborator adapters for the clubhouse core.
//!
//! The Discord REST types talk to the live platform; the in-memory types are
//! deterministic doubles for local runs and tests.

#![deny(unsafe_code)]

pub mod discord;

pub use discord::{
    jump_url, DiscordClient, DiscordHistoryProvider, DiscordRestAuthority, DEFAULT_API_BASE,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubhouse_core::authority::{EntitlementAuthority, StripOutcome};
use clubhouse_core::draw::CandidateProvider;
use clubhouse_core::error::ClubhouseError;
use clubhouse_core::types::{Candidate, ChannelId, GuildId, UserId};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Role authority that keeps role holders in memory.
#[derive(Debug, Default)]
pub struct MemoryRoleAuthority {
    scopes: Vec<GuildId>,
    holders: Mutex<BTreeSet<(GuildId, UserId)>>,
    failing: Mutex<HashSet<UserId>>,
}

impl MemoryRoleAuthority {
    pub fn new(scopes: impl IntoIterator<Item = GuildId>) -> Self {
        Self {
            scopes: scopes.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Make every subsequent call for `user` fail.
    pub fn fail_for(&self, user: UserId) {
        lock(&self.failing).insert(user);
    }

    pub fn recover(&self, user: UserId) {
        lock(&self.failing).remove(&user);
    }

    pub fn holds(&self, scope: GuildId, user: UserId) -> bool {
        lock(&self.holders).contains(&(scope, user))
    }

    pub fn holder_count(&self) -> usize {
        lock(&self.holders).len()
    }

    fn check(&self, operation: &'static str, user: UserId) -> Result<(), ClubhouseError> {
        if lock(&self.failing).contains(&user) {
            return Err(ClubhouseError::authority_failed(
                operation,
                user,
                "simulated platform failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementAuthority for MemoryRoleAuthority {
    fn authority_id(&self) -> &'static str {
        "memory"
    }

    async fn scopes(&self) -> Result<Vec<GuildId>, ClubhouseError> {
        Ok(self.scopes.clone())
    }

    async fn apply(&self, scope: GuildId, user: UserId) -> Result<(), ClubhouseError> {
        self.check("apply", user)?;
        lock(&self.holders).insert((scope, user));
        Ok(())
    }

    async fn strip(&self, scope: GuildId, user: UserId) -> Result<StripOutcome, ClubhouseError> {
        self.check("strip", user)?;
        if lock(&self.holders).remove(&(scope, user)) {
            Ok(StripOutcome::Stripped)
        } else {
            Ok(StripOutcome::NotPresent)
        }
    }
}

/// Deterministic failing authority useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailAuthority {
    scopes: Vec<GuildId>,
    reason: String,
}

impl AlwaysFailAuthority {
    pub fn new(scopes: impl IntoIterator<Item = GuildId>, reason: impl Into<String>) -> Self {
        Self {
            scopes: scopes.into_iter().collect(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl EntitlementAuthority for AlwaysFailAuthority {
    fn authority_id(&self) -> &'static str {
        "always-fail"
    }

    async fn scopes(&self) -> Result<Vec<GuildId>, ClubhouseError> {
        Ok(self.scopes.clone())
    }

    async fn apply(&self, _scope: GuildId, user: UserId) -> Result<(), ClubhouseError> {
        Err(ClubhouseError::authority_failed("apply", user, self.reason.clone()))
    }

    async fn strip(&self, _scope: GuildId, user: UserId) -> Result<StripOutcome, ClubhouseError> {
        Err(ClubhouseError::authority_failed("strip", user, self.reason.clone()))
    }
}

/// Fixed channel history, served newest first.
#[derive(Debug, Default)]
pub struct StaticHistoryProvider {
    messages: Mutex<Vec<Candidate>>,
}

impl StaticHistoryProvider {
    pub fn new(messages: Vec<Candidate>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }

    pub fn push(&self, message: Candidate) {
        lock(&self.messages).push(message);
    }
}

#[async_trait]
impl CandidateProvider for StaticHistoryProvider {
    async fn fetch_candidates(
        &self,
        _channel: ChannelId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candidate>, ClubhouseError> {
        let mut page: Vec<Candidate> = lock(&self.messages)
            .iter()
            .filter(|message| after.map_or(true, |mark| message.created_at > mark))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit);
        Ok(page)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clubhouse_core::types::MessageId;

    fn candidate(id: u64, second: u32) -> Candidate {
        Candidate {
            message_id: MessageId(id),
            author: UserId(id * 10),
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, second).unwrap(),
            jump_url: format!("https://discord.com/channels/1/2/{id}"),
            content_ref: None,
            eligible: true,
        }
    }

    #[tokio::test]
    async fn memory_authority_tracks_holders() {
        let authority = MemoryRoleAuthority::new([GuildId(1)]);
        authority.apply(GuildId(1), UserId(5)).await.unwrap();
        assert!(authority.holds(GuildId(1), UserId(5)));

        assert_eq!(
            authority.strip(GuildId(1), UserId(5)).await.unwrap(),
            StripOutcome::Stripped
        );
        assert_eq!(
            authority.strip(GuildId(1), UserId(5)).await.unwrap(),
            StripOutcome::NotPresent
        );
    }

    #[tokio::test]
    async fn memory_authority_simulates_failures() {
        let authority = MemoryRoleAuthority::new([GuildId(1)]);
        authority.fail_for(UserId(5));
        assert!(authority.apply(GuildId(1), UserId(5)).await.is_err());

        authority.recover(UserId(5));
        assert!(authority.apply(GuildId(1), UserId(5)).await.is_ok());
    }

    #[tokio::test]
    async fn always_fail_authority_fails() {
        let authority = AlwaysFailAuthority::new([GuildId(1)], "offline");
        let err = authority.strip(GuildId(1), UserId(2)).await.unwrap_err();
        assert!(err.to_string().contains("offline"));
        assert_eq!(authority.scopes().await.unwrap(), vec![GuildId(1)]);
    }

    #[tokio::test]
    async fn static_history_filters_after_watermark() {
        let provider = StaticHistoryProvider::new(vec![candidate(1, 1), candidate(2, 2)]);
        provider.push(candidate(3, 3));

        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 1).unwrap();
        let page = provider
            .fetch_candidates(ChannelId(2), Some(after), 10)
            .await
            .unwrap();
        let ids: Vec<u64> = page.iter().map(|c| c.message_id.get()).collect();
        assert_eq!(ids, vec![3, 2]);

        let capped = provider.fetch_candidates(ChannelId(2), None, 1).await.unwrap();
        assert_eq!(capped[0].message_id, MessageId(3));
    }
}
