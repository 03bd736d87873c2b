//! Clubhouse core: credits, VIP entitlements, and draws for a chat community.
//!
//! This crate holds the state-bearing pieces of the bot: a durable credit
//! ledger, a time-bounded entitlement registry with a periodic expiry
//! reconciler, and a fair draw engine over channel history. Platform I/O is
//! reached only through the collaborator traits defined here.

#![deny(unsafe_code)]

pub mod authority;
pub mod clock;
pub mod commands;
pub mod draw;
pub mod entitlement;
pub mod error;
pub mod ledger;
pub mod moderation;
pub mod presence;
pub mod reconciler;
pub mod repository;
pub mod storage;
pub mod types;

pub use authority::{EntitlementAuthority, StripOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commands::{
    Colour, Command, CommandDispatcher, CommandResponse, DispatchSettings, Invoker, MealPlan,
    ResponseField,
};
pub use draw::{
    select_winner, CandidateProvider, DrawConfig, DrawEngine, DrawOutcome, DrawSession,
    DrawWatermark,
};
pub use entitlement::EntitlementRegistry;
pub use error::ClubhouseError;
pub use ledger::{CreditLedger, LedgerReceipt};
pub use moderation::{ImageOnlyPolicy, InboundMessage, ModerationVerdict};
pub use presence::{
    ChannelMember, LabelDecision, OccupancyBoard, OccupancySnapshot, PresenceConfig,
};
pub use reconciler::{
    ExpiryReconciler, ReconcileReport, ReconcilerConfig, ReconcilerHandle, ReconcilerState,
    RemovalPolicy,
};
pub use repository::{
    EntitlementRepository, EntitlementSnapshot, JsonFileRepository, MemoryRepository,
};
pub use storage::{
    open_balance_store, BalanceStore, MemoryBalanceStore, SqliteBalanceStore, StorageConfig,
};
pub use types::{
    has_image, Attachment, Candidate, ChannelId, GuildId, MessageId, RoleId, UserId,
};
