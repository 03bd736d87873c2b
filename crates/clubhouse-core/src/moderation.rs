use crate::types::{has_image, Attachment, ChannelId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const APPROVE_REACTION: &str = "✅";
const WARNING_TTL_SECS: u64 = 5;

/// A message as seen by the content policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub author: UserId,
    /// Set when the service itself authored the message.
    #[serde(default)]
    pub from_self: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ModerationVerdict {
    Ignore,
    Approve {
        reaction: String,
    },
    /// Delete the message and post a short-lived warning.
    Reject {
        warning: String,
        delete_after_secs: u64,
    },
}

/// Only image posts are allowed in the configured channels.
#[derive(Debug, Clone, Default)]
pub struct ImageOnlyPolicy {
    channels: HashSet<ChannelId>,
}

impl ImageOnlyPolicy {
    pub fn new(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            channels: channels.into_iter().collect(),
        }
    }

    pub fn covers(&self, channel: ChannelId) -> bool {
        self.channels.contains(&channel)
    }

    pub fn evaluate(&self, message: &InboundMessage) -> ModerationVerdict {
        if message.from_self || !self.covers(message.channel_id) {
            return ModerationVerdict::Ignore;
        }

        if has_image(&message.attachments) {
            ModerationVerdict::Approve {
                reaction: APPROVE_REACTION.to_string(),
            }
        } else {
            ModerationVerdict::Reject {
                warning: format!(
                    "{} Only image messages are allowed in this channel!",
                    message.author.mention()
                ),
                delete_after_secs: WARNING_TTL_SECS,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: u64, content_type: Option<&str>) -> InboundMessage {
        InboundMessage {
            message_id: MessageId(1),
            channel_id: ChannelId(channel),
            author: UserId(77),
            from_self: false,
            attachments: content_type
                .map(|ct| {
                    vec![Attachment {
                        url: "https://cdn/x".into(),
                        content_type: Some(ct.into()),
                    }]
                })
                .unwrap_or_default(),
        }
    }

    #[test]
    fn image_posts_are_approved_and_text_is_rejected() {
        let policy = ImageOnlyPolicy::new([ChannelId(10)]);

        assert_eq!(
            policy.evaluate(&message(10, Some("image/jpeg"))),
            ModerationVerdict::Approve {
                reaction: "✅".into()
            }
        );

        match policy.evaluate(&message(10, None)) {
            ModerationVerdict::Reject {
                warning,
                delete_after_secs,
            } => {
                assert!(warning.starts_with("<@77>"));
                assert_eq!(delete_after_secs, 5);
            }
            other => panic!("expected reject, got {other:?}"),
        }

        assert!(matches!(
            policy.evaluate(&message(10, Some("video/mp4"))),
            ModerationVerdict::Reject { .. }
        ));
    }

    #[test]
    fn other_channels_and_own_messages_are_ignored() {
        let policy = ImageOnlyPolicy::new([ChannelId(10)]);
        assert_eq!(policy.evaluate(&message(11, None)), ModerationVerdict::Ignore);

        let mut own = message(10, None);
        own.from_self = true;
        assert_eq!(policy.evaluate(&own), ModerationVerdict::Ignore);
    }
}
