//! Admin and member commands.
//!
//! The dispatcher owns the command boundary: it checks permissions, drives the
//! ledger, registry, authority and draw engine, and turns every outcome into a
//! [`CommandResponse`]. Errors never escape as panics or raw error values.

use crate::authority::EntitlementAuthority;
use crate::draw::{DrawEngine, DrawOutcome};
use crate::entitlement::EntitlementRegistry;
use crate::error::ClubhouseError;
use crate::ledger::CreditLedger;
use crate::types::{GuildId, RoleId, UserId};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Who issued a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoker {
    pub user: UserId,
    pub display_name: String,
    #[serde(default)]
    pub roles: Vec<RoleId>,
}

impl Invoker {
    pub fn has_role(&self, role: RoleId) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Credits {
        #[serde(default)]
        user: Option<UserId>,
    },
    Topup {
        user: UserId,
        amount: i64,
    },
    Deduct {
        user: UserId,
        amount: i64,
    },
    GiveVip {
        user: UserId,
        days: i64,
    },
    RevokeVip {
        user: UserId,
    },
    VipStatus,
    Draw {
        prize: String,
    },
    Reroll {
        session_id: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Credits { .. } => "credits",
            Self::Topup { .. } => "topup",
            Self::Deduct { .. } => "deduct",
            Self::GiveVip { .. } => "give_vip",
            Self::RevokeVip { .. } => "revoke_vip",
            Self::VipStatus => "vip_status",
            Self::Draw { .. } => "draw",
            Self::Reroll { .. } => "reroll",
        }
    }

    pub fn requires_admin(&self) -> bool {
        !matches!(self, Self::Credits { .. } | Self::VipStatus)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Colour {
    Blue,
    Green,
    Orange,
    Red,
    Gold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Transport-neutral rendering of a command result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub title: Option<String>,
    pub colour: Option<Colour>,
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<ResponseField>,
    pub footer: Option<String>,
    pub image_url: Option<String>,
    /// Only visible to the invoker.
    #[serde(default)]
    pub ephemeral: bool,
    /// Draw session a reroll action should target.
    pub reroll_session: Option<String>,
}

impl CommandResponse {
    pub fn embed(title: impl Into<String>, colour: Colour) -> Self {
        Self {
            title: Some(title.into()),
            colour: Some(colour),
            ..Self::default()
        }
    }

    pub fn text(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self::embed("❌ Error", Colour::Red)
            .description(description)
            .ephemeral()
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(ResponseField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn image(mut self, url: Option<String>) -> Self {
        self.image_url = url;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.colour == Some(Colour::Red)
    }

    /// Look up a field value by name.
    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.value.as_str())
    }
}

/// Meal pricing shown alongside balances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MealPlan {
    #[serde(default = "default_credits_per_meal")]
    pub credits_per_meal: i64,

    #[serde(default = "default_price_label")]
    pub price_label: String,
}

fn default_credits_per_meal() -> i64 {
    15
}

fn default_price_label() -> String {
    "$42".to_string()
}

impl Default for MealPlan {
    fn default() -> Self {
        Self {
            credits_per_meal: default_credits_per_meal(),
            price_label: default_price_label(),
        }
    }
}

impl MealPlan {
    pub fn meals_for(&self, balance: i64) -> i64 {
        if self.credits_per_meal <= 0 {
            return 0;
        }
        balance.max(0) / self.credits_per_meal
    }
}

/// Guild-level settings the dispatcher needs.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub guild_id: GuildId,
    pub admin_role: RoleId,
    pub meals: MealPlan,
}

pub struct CommandDispatcher {
    ledger: Arc<CreditLedger>,
    registry: Arc<EntitlementRegistry>,
    authority: Arc<dyn EntitlementAuthority>,
    draws: Arc<DrawEngine>,
    settings: DispatchSettings,
}

impl CommandDispatcher {
    pub fn new(
        ledger: Arc<CreditLedger>,
        registry: Arc<EntitlementRegistry>,
        authority: Arc<dyn EntitlementAuthority>,
        draws: Arc<DrawEngine>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            ledger,
            registry,
            authority,
            draws,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run `command` on behalf of `invoker` and render the result.
    pub async fn dispatch(&self, invoker: &Invoker, command: Command) -> CommandResponse {
        let name = command.name();
        match self.execute(invoker, command).await {
            Ok(response) => response,
            Err(err) if err.is_user_facing() => {
                warn!(command = name, user_id = %invoker.user, error = %err, "command rejected");
                CommandResponse::failure(user_message(&err))
            }
            Err(err) => {
                error!(command = name, user_id = %invoker.user, error = %err, "command failed");
                CommandResponse::failure("Something went wrong while processing this command.")
            }
        }
    }

    async fn execute(
        &self,
        invoker: &Invoker,
        command: Command,
    ) -> Result<CommandResponse, ClubhouseError> {
        if command.requires_admin() && !invoker.has_role(self.settings.admin_role) {
            return Err(ClubhouseError::PermissionDenied(format!(
                "{} requires the admin role",
                command.name()
            )));
        }

        match command {
            Command::Credits { user } => self.credits(invoker, user.unwrap_or(invoker.user)).await,
            Command::Topup { user, amount } => {
                let receipt = self.ledger.credit(user, amount).await?;
                Ok(CommandResponse::embed("💰 Credits Added", Colour::Green)
                    .field("User", user.mention(), true)
                    .field("Amount Added", format!("+{amount} credits"), true)
                    .field("New Balance", format!("{} credits", receipt.balance), false)
                    .footer(format!("Added by {}", invoker.display_name)))
            }
            Command::Deduct { user, amount } => {
                let receipt = self.ledger.debit(user, amount).await?;
                Ok(CommandResponse::embed("💸 Credits Deducted", Colour::Orange)
                    .field("User", user.mention(), true)
                    .field("Amount Deducted", format!("-{amount} credits"), true)
                    .field("New Balance", format!("{} credits", receipt.balance), false)
                    .footer(format!("Deducted by {}", invoker.display_name)))
            }
            Command::GiveVip { user, days } => self.give_vip(user, days).await,
            Command::RevokeVip { user } => self.revoke_vip(user).await,
            Command::VipStatus => self.vip_status(invoker.user).await,
            Command::Draw { prize } => {
                let outcome = self.draws.draw(prize).await?;
                Ok(render_draw(&outcome, invoker))
            }
            Command::Reroll { session_id } => {
                let outcome = self.draws.reroll(&session_id)?;
                Ok(render_draw(&outcome, invoker))
            }
        }
    }

    async fn credits(&self, invoker: &Invoker, user: UserId) -> Result<CommandResponse, ClubhouseError> {
        let balance = self.ledger.balance(user).await?;
        let meals = &self.settings.meals;
        Ok(CommandResponse::embed("💳 Credit Balance", Colour::Blue)
            .field("User", user.mention(), false)
            .field("Balance", format!("{balance} credits"), false)
            .field(
                "Meal Orders",
                format!(
                    "Can order {} meals at {} each ({} credits per meal)",
                    meals.meals_for(balance),
                    meals.price_label,
                    meals.credits_per_meal
                ),
                false,
            )
            .footer(format!("Requested by {}", invoker.display_name)))
    }

    /// Apply the role first so a failed platform call leaves no registry record.
    async fn give_vip(&self, user: UserId, days: i64) -> Result<CommandResponse, ClubhouseError> {
        if days <= 0 {
            return Err(ClubhouseError::InvalidDuration(format!("{days} days")));
        }
        let duration = Duration::try_days(days)
            .ok_or_else(|| ClubhouseError::InvalidDuration(format!("{days} days")))?;

        let _guard = self.registry.lock_user(user).await;
        self.authority.apply(self.settings.guild_id, user).await?;
        let expiry = self.registry.grant(user, duration).await?;
        info!(user_id = %user, days, expires_at = %expiry, "vip granted");

        Ok(CommandResponse::text(format!(
            "Gave {} VIP role for {days} days!",
            user.mention()
        )))
    }

    async fn revoke_vip(&self, user: UserId) -> Result<CommandResponse, ClubhouseError> {
        let _guard = self.registry.lock_user(user).await;
        self.authority.strip(self.settings.guild_id, user).await?;
        let response = CommandResponse::text(format!("Removed VIP role from {}!", user.mention()));

        match self.registry.revoke(user).await {
            Ok(expiry) => {
                info!(user_id = %user, expired_at = %expiry, "vip revoked");
                Ok(response)
            }
            // The role is gone either way; there was just no timer to cancel.
            Err(ClubhouseError::EntitlementNotFound(_)) => {
                info!(user_id = %user, "vip revoked for untracked user");
                Ok(response.footer("No VIP timer was being tracked for this user."))
            }
            Err(err) => Err(err),
        }
    }

    async fn vip_status(&self, user: UserId) -> Result<CommandResponse, ClubhouseError> {
        match self.registry.remaining(user).await {
            Some(left) => Ok(CommandResponse::text(format!(
                "You have {} days of VIP remaining!",
                left.num_days()
            ))),
            None => Ok(CommandResponse::text("You don't have VIP status!").ephemeral()),
        }
    }
}

fn render_draw(outcome: &DrawOutcome, invoker: &Invoker) -> CommandResponse {
    let (title, footer) = if outcome.reroll {
        ("🎲 Reroll Winner!", format!("Rerolled by {}", invoker.display_name))
    } else {
        ("🎉 Draw Winner!", format!("Draw conducted by {}", invoker.display_name))
    };

    let mut response = CommandResponse::embed(title, Colour::Gold)
        .field("Winner", outcome.winner.author.mention(), false)
        .field("Prize", outcome.prize.clone(), false)
        .field(
            "Winning Entry",
            format!("[Jump to message]({})", outcome.winner.jump_url),
            false,
        )
        .image(outcome.winner.content_ref.clone())
        .footer(footer);
    response.reroll_session = Some(outcome.session_id.clone());
    response
}

fn user_message(err: &ClubhouseError) -> String {
    match err {
        ClubhouseError::PermissionDenied(_) => {
            "You don't have permission to use this command!".to_string()
        }
        ClubhouseError::InsufficientBalance { balance, .. } => {
            format!("User only has {balance} credits!")
        }
        ClubhouseError::InvalidDuration(_) => "Days must be positive!".to_string(),
        ClubhouseError::NoEligibleEntries => {
            "No eligible entries found since the last draw!".to_string()
        }
        ClubhouseError::UnknownDrawSession(_) => {
            "That draw is no longer available for rerolls.".to_string()
        }
        other => other.to_string(),
    }
}
