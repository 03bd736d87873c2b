use crate::error::ClubhouseError;
use crate::types::{GuildId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a strip call found on the platform side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripOutcome {
    /// The role was held and has been removed.
    Stripped,
    /// The member (or their role) was already gone; nothing to strip.
    NotPresent,
}

/// External authority that actually holds the VIP role.
///
/// Implementations talk to the chat platform; every call may fail and callers
/// treat failures as non-fatal to batch processing.
#[async_trait]
pub trait EntitlementAuthority: Send + Sync {
    fn authority_id(&self) -> &'static str;

    /// Scopes (guilds) the process is attached to.
    async fn scopes(&self) -> Result<Vec<GuildId>, ClubhouseError>;

    async fn apply(&self, scope: GuildId, user: UserId) -> Result<(), ClubhouseError>;

    async fn strip(&self, scope: GuildId, user: UserId) -> Result<StripOutcome, ClubhouseError>;
}
