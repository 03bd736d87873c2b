use crate::types::{ChannelId, UserId};
use serde::{Deserialize, Serialize};

/// Orders voice channel labelling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub orders_channel_id: ChannelId,

    #[serde(default = "default_open_label")]
    pub open_label: String,

    #[serde(default = "default_closed_label")]
    pub closed_label: String,
}

fn default_open_label() -> String {
    "🟢TAKING ORDERS🟢".to_string()
}

fn default_closed_label() -> String {
    "🔴TAKING ORDERS🔴".to_string()
}

impl PresenceConfig {
    pub fn new(orders_channel_id: ChannelId) -> Self {
        Self {
            orders_channel_id,
            open_label: default_open_label(),
            closed_label: default_closed_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMember {
    pub user_id: UserId,
    #[serde(default)]
    pub bot: bool,
}

/// Voice channel state delivered with a presence event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub channel_id: ChannelId,
    /// Whether the member whose presence changed is a bot.
    #[serde(default)]
    pub trigger_is_bot: bool,
    pub current_label: String,
    #[serde(default)]
    pub members: Vec<ChannelMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDecision {
    pub label: String,
    pub occupants: usize,
    /// False when the channel already carries `label`.
    pub rename: bool,
}

/// Maps live occupancy of the orders channel to its visible label.
#[derive(Debug, Clone)]
pub struct OccupancyBoard {
    config: PresenceConfig,
}

impl OccupancyBoard {
    pub fn new(config: PresenceConfig) -> Self {
        Self { config }
    }

    pub fn label_for(&self, occupants: usize) -> &str {
        if occupants > 0 {
            &self.config.open_label
        } else {
            &self.config.closed_label
        }
    }

    /// `None` when the event should be ignored.
    pub fn decide(&self, snapshot: &OccupancySnapshot) -> Option<LabelDecision> {
        if snapshot.trigger_is_bot || snapshot.channel_id != self.config.orders_channel_id {
            return None;
        }

        let occupants = snapshot.members.iter().filter(|m| !m.bot).count();
        let label = self.label_for(occupants).to_string();
        Some(LabelDecision {
            rename: snapshot.current_label != label,
            label,
            occupants,
        })
    }
}
