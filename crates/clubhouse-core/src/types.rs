use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

snowflake_id!(
    /// Stable platform identity of a member.
    UserId
);
snowflake_id!(
    /// Authority scope (a guild) the process is attached to.
    GuildId
);
snowflake_id!(ChannelId);
snowflake_id!(RoleId);
snowflake_id!(MessageId);

impl UserId {
    pub fn mention(self) -> String {
        format!("<@{}>", self.0)
    }
}

/// A message considered for a draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub message_id: MessageId,
    pub author: UserId,
    pub created_at: DateTime<Utc>,
    /// Link to the message itself.
    pub jump_url: String,
    /// First attachment URL, shown alongside the winner.
    pub content_ref: Option<String>,
    /// Whether the message carries qualifying image content.
    pub eligible: bool,
}

/// Attachment metadata as delivered by the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.starts_with("image/"))
            .unwrap_or(false)
    }
}

/// Whether any attachment qualifies as image content.
pub fn has_image(attachments: &[Attachment]) -> bool {
    attachments.iter().any(Attachment::is_image)
}
