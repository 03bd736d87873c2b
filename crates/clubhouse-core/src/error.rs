use crate::types::UserId;
use thiserror::Error;

/// Clubhouse runtime errors.
#[derive(Debug, Error)]
pub enum ClubhouseError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("insufficient balance: has {balance}, requested {requested}")]
    InsufficientBalance { balance: i64, requested: i64 },

    #[error("duration must be positive, got {0}")]
    InvalidDuration(String),

    #[error("no entitlement tracked for user {0}")]
    EntitlementNotFound(UserId),

    #[error("no eligible entries found since the last draw")]
    NoEligibleEntries,

    #[error("draw session '{0}' not found")]
    UnknownDrawSession(String),

    #[error("authority operation '{operation}' failed for user {user}: {message}")]
    AuthorityOperationFailed {
        operation: &'static str,
        user: UserId,
        message: String,
    },

    #[error("authority operation '{operation}' timed out for user {user}")]
    AuthorityTimeout {
        operation: &'static str,
        user: UserId,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("candidate provider failed: {0}")]
    Provider(String),
}

impl ClubhouseError {
    pub fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{context}: {err}"))
    }

    pub fn authority_failed(
        operation: &'static str,
        user: UserId,
        message: impl Into<String>,
    ) -> Self {
        Self::AuthorityOperationFailed {
            operation,
            user,
            message: message.into(),
        }
    }

    /// Errors the invoking user caused and can correct themselves.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount(_)
                | Self::InsufficientBalance { .. }
                | Self::InvalidDuration(_)
                | Self::EntitlementNotFound(_)
                | Self::NoEligibleEntries
                | Self::UnknownDrawSession(_)
                | Self::PermissionDenied(_)
        )
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
