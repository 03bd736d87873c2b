//! Configuration for clubhoused

use clubhouse_adapters::DEFAULT_API_BASE;
use clubhouse_core::{
    ChannelId, DrawConfig, GuildId, MealPlan, PresenceConfig, ReconcilerConfig, RoleId,
    StorageConfig,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub discord: DiscordConfig,

    /// Credit balance storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// VIP registry storage
    #[serde(default)]
    pub entitlements: EntitlementStoreConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default = "default_draw")]
    pub draw: DrawConfig,

    #[serde(default)]
    pub guild: GuildConfig,

    #[serde(default)]
    pub moderation: ModerationConfig,

    #[serde(default = "default_presence")]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub meals: MealPlan,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            discord: DiscordConfig::default(),
            storage: StorageConfig::default(),
            entitlements: EntitlementStoreConfig::default(),
            reconciler: ReconcilerConfig::default(),
            draw: default_draw(),
            guild: GuildConfig::default(),
            moderation: ModerationConfig::default(),
            presence: default_presence(),
            meals: MealPlan::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Discord API access. Without a token the service runs against in-memory doubles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_api_base(),
        }
    }
}

/// Entitlement registry persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntitlementStoreConfig {
    Memory,
    Json {
        #[serde(default = "default_entitlements_path")]
        path: PathBuf,
    },
}

impl Default for EntitlementStoreConfig {
    fn default() -> Self {
        Self::Json {
            path: default_entitlements_path(),
        }
    }
}

/// The guild the bot administers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuildConfig {
    #[serde(default)]
    pub guild_id: GuildId,

    #[serde(default)]
    pub vip_role_id: RoleId,

    /// Role required for admin commands
    #[serde(default)]
    pub admin_role_id: RoleId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Channels where only image posts are allowed
    #[serde(default)]
    pub image_only_channels: Vec<ChannelId>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8095))
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_entitlements_path() -> PathBuf {
    PathBuf::from("data/vip_users.json")
}

fn default_draw() -> DrawConfig {
    DrawConfig::new(ChannelId::default())
}

fn default_presence() -> PresenceConfig {
    PresenceConfig::new(ChannelId::default())
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BotConfig {
    /// Layer defaults, an optional file, and `CLUBHOUSE_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `CLUBHOUSE_GUILD__ADMIN_ROLE_ID`.
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();

        builder = builder.add_source(::config::Config::try_from(&BotConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("CLUBHOUSE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
