#![deny(unsafe_code)]

pub mod config;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clubhouse_adapters::{
    DiscordClient, DiscordHistoryProvider, DiscordRestAuthority, MemoryRoleAuthority,
    StaticHistoryProvider,
};
use clubhouse_core::{
    open_balance_store, CandidateProvider, ClubhouseError, Command, CommandDispatcher,
    CommandResponse, CreditLedger, DispatchSettings, DrawEngine, EntitlementAuthority,
    EntitlementRegistry, EntitlementRepository, ExpiryReconciler, GuildId, ImageOnlyPolicy,
    InboundMessage, Invoker, JsonFileRepository, LabelDecision, MemoryRepository,
    ModerationVerdict, OccupancyBoard, OccupancySnapshot, ReconcileReport, ReconcilerState,
    RoleId, SystemClock,
};
use crate::config::{BotConfig, EntitlementStoreConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Platform collaborators the core is wired against.
#[derive(Clone)]
pub struct Collaborators {
    pub authority: Arc<dyn EntitlementAuthority>,
    pub history: Arc<dyn CandidateProvider>,
}

impl Collaborators {
    /// Discord REST when a token is configured, in-memory doubles otherwise.
    pub fn from_config(config: &BotConfig) -> Result<Self, ServiceError> {
        match config.discord.token.as_deref() {
            Some(token) if !token.trim().is_empty() => {
                if config.guild.guild_id == GuildId::default() {
                    return Err(ServiceError::Config(
                        "guild.guild_id must be set when a discord token is configured".into(),
                    ));
                }
                if config.guild.vip_role_id == RoleId::default() {
                    return Err(ServiceError::Config(
                        "guild.vip_role_id must be set when a discord token is configured".into(),
                    ));
                }

                let client = DiscordClient::new(token, &config.discord.api_base)?;
                Ok(Self {
                    authority: Arc::new(DiscordRestAuthority::new(
                        client.clone(),
                        vec![config.guild.guild_id],
                        config.guild.vip_role_id,
                    )),
                    history: Arc::new(DiscordHistoryProvider::new(
                        client,
                        config.guild.guild_id,
                    )),
                })
            }
            _ => {
                warn!("no discord token configured; using in-memory collaborators");
                Ok(Self::local(config))
            }
        }
    }

    pub fn local(config: &BotConfig) -> Self {
        Self {
            authority: Arc::new(MemoryRoleAuthority::new([config.guild.guild_id])),
            history: Arc::new(StaticHistoryProvider::default()),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub ledger: Arc<CreditLedger>,
    pub registry: Arc<EntitlementRegistry>,
    pub reconciler: Arc<ExpiryReconciler>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub moderation: Arc<ImageOnlyPolicy>,
    pub presence: Arc<OccupancyBoard>,
}

impl ServiceState {
    pub async fn bootstrap(
        config: &BotConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ServiceError> {
        let store = open_balance_store(&config.storage).await?;
        let ledger = Arc::new(CreditLedger::new(store));

        let repository: Arc<dyn EntitlementRepository> = match &config.entitlements {
            EntitlementStoreConfig::Memory => Arc::new(MemoryRepository::new()),
            EntitlementStoreConfig::Json { path } => {
                Arc::new(JsonFileRepository::new(path.clone()))
            }
        };
        let registry =
            Arc::new(EntitlementRegistry::load(repository, Arc::new(SystemClock)).await?);

        let reconciler = Arc::new(ExpiryReconciler::new(
            registry.clone(),
            collaborators.authority.clone(),
            config.reconciler.clone(),
        ));
        let draws = Arc::new(DrawEngine::new(
            collaborators.history.clone(),
            config.draw.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            ledger.clone(),
            registry.clone(),
            collaborators.authority,
            draws,
            DispatchSettings {
                guild_id: config.guild.guild_id,
                admin_role: config.guild.admin_role_id,
                meals: config.meals.clone(),
            },
        ));

        info!(
            storage = ledger.backend_label(),
            tracked_vips = registry.len().await,
            "clubhouse state ready"
        );

        Ok(Self {
            ledger,
            registry,
            reconciler,
            dispatcher,
            moderation: Arc::new(ImageOnlyPolicy::new(
                config.moderation.image_only_channels.iter().copied(),
            )),
            presence: Arc::new(OccupancyBoard::new(config.presence.clone())),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/v1/health", get(health))
        .route("/v1/commands", post(run_command))
        .route("/v1/moderation/evaluate", post(evaluate_message))
        .route("/v1/presence/orders", post(orders_presence))
        .route("/v1/reconciler/run", post(run_reconciler))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("core error: {0}")]
    Core(#[from] ClubhouseError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] ClubhouseError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let status = if err.is_user_facing() {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
            }
        }
    }
}

async fn status_page(State(state): State<ServiceState>) -> Html<String> {
    Html(format!(
        "<html><body><h1>Clubhouse bot is running</h1><p>Tracking {} VIP members</p></body></html>",
        state.registry.len().await
    ))
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    tracked_vips: usize,
    reconciler: ReconcilerState,
    last_reconcile: Option<ReconcileReport>,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "clubhouse-service",
        storage_backend: state.ledger.backend_label(),
        tracked_vips: state.registry.len().await,
        reconciler: state.reconciler.state().await,
        last_reconcile: state.reconciler.last_report().await,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct CommandRequest {
    invoker: Invoker,
    #[serde(flatten)]
    command: Command,
}

async fn run_command(
    State(state): State<ServiceState>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandResponse> {
    Json(
        state
            .dispatcher
            .dispatch(&request.invoker, request.command)
            .await,
    )
}

async fn evaluate_message(
    State(state): State<ServiceState>,
    Json(message): Json<InboundMessage>,
) -> Json<ModerationVerdict> {
    Json(state.moderation.evaluate(&message))
}

#[derive(Debug, Clone, Serialize)]
struct PresenceResponse {
    ignored: bool,
    decision: Option<LabelDecision>,
}

async fn orders_presence(
    State(state): State<ServiceState>,
    Json(snapshot): Json<OccupancySnapshot>,
) -> Json<PresenceResponse> {
    let decision = state.presence.decide(&snapshot);
    Json(PresenceResponse {
        ignored: decision.is_none(),
        decision,
    })
}

async fn run_reconciler(
    State(state): State<ServiceState>,
) -> Result<Json<ReconcileReport>, ApiError> {
    match state.reconciler.try_reconcile_once().await? {
        Some(report) => Ok(Json(report)),
        None => Err(ApiError::Http {
            status: StatusCode::CONFLICT,
            message: "reconciliation already in progress".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use clubhouse_core::{ChannelId, UserId};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_config() -> BotConfig {
        let mut config = BotConfig::default();
        config.guild.guild_id = GuildId(1);
        config.guild.vip_role_id = RoleId(50);
        config.guild.admin_role_id = RoleId(900);
        config.entitlements = EntitlementStoreConfig::Memory;
        config.moderation.image_only_channels = vec![ChannelId(10)];
        config.presence.orders_channel_id = ChannelId(20);
        config
    }

    async fn app_for(config: &BotConfig) -> (Router, ServiceState) {
        let state = ServiceState::bootstrap(config, Collaborators::local(config))
            .await
            .unwrap();
        (build_router(state.clone()), state)
    }

    async fn post_json(
        app: Router,
        uri: &str,
        payload: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn admin() -> serde_json::Value {
        serde_json::json!({ "user": 1, "display_name": "boss", "roles": [900] })
    }

    #[tokio::test]
    async fn topup_and_balance_via_command_endpoint() {
        let (app, state) = app_for(&test_config()).await;

        let (status, body) = post_json(
            app.clone(),
            "/v1/commands",
            serde_json::json!({ "invoker": admin(), "command": "topup", "user": 5, "amount": 30 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "💰 Credits Added");
        assert_eq!(state.ledger.balance(UserId(5)).await.unwrap(), 30);

        let (_, body) = post_json(
            app,
            "/v1/commands",
            serde_json::json!({
                "invoker": { "user": 5, "display_name": "member" },
                "command": "deduct",
                "user": 5,
                "amount": 10
            }),
        )
        .await;
        assert_eq!(body["ephemeral"], true);
        assert_eq!(body["colour"], "red");
        assert_eq!(state.ledger.balance(UserId(5)).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn give_vip_persists_registry_file() {
        let path = std::env::temp_dir()
            .join(format!("clubhouse-service-{}", Uuid::new_v4()))
            .join("vip_users.json");
        let mut config = test_config();
        config.entitlements = EntitlementStoreConfig::Json { path: path.clone() };
        let (app, _) = app_for(&config).await;

        let (status, body) = post_json(
            app.clone(),
            "/v1/commands",
            serde_json::json!({ "invoker": admin(), "command": "give_vip", "user": 8, "days": 30 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["description"], "Gave <@8> VIP role for 30 days!");

        let stored: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(stored.get("8").is_some());

        let (_, restarted) = app_for(&config).await;
        assert!(restarted.registry.query(UserId(8)).await.is_some());

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("Tracking 1 VIP members"));
    }

    #[tokio::test]
    async fn health_reports_backend_and_reconciler() {
        let (app, _) = app_for(&test_config()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage_backend"], "memory");
        assert_eq!(body["tracked_vips"], 0);
        assert_eq!(body["reconciler"], "idle");
    }

    #[tokio::test]
    async fn moderation_and_presence_endpoints() {
        let (app, _) = app_for(&test_config()).await;

        let (_, verdict) = post_json(
            app.clone(),
            "/v1/moderation/evaluate",
            serde_json::json!({ "message_id": 3, "channel_id": 10, "author": 77, "attachments": [] }),
        )
        .await;
        assert_eq!(verdict["action"], "reject");
        assert_eq!(verdict["delete_after_secs"], 5);

        let (_, presence) = post_json(
            app,
            "/v1/presence/orders",
            serde_json::json!({
                "channel_id": 20,
                "current_label": "🔴TAKING ORDERS🔴",
                "members": [{ "user_id": 4 }]
            }),
        )
        .await;
        assert_eq!(presence["ignored"], false);
        assert_eq!(presence["decision"]["label"], "🟢TAKING ORDERS🟢");
        assert_eq!(presence["decision"]["rename"], true);
    }

    #[test]
    fn discord_token_requires_guild_and_vip_role() {
        let mut config = BotConfig::default();
        config.discord.token = Some("token".into());

        let err = Collaborators::from_config(&config).err().unwrap();
        assert!(matches!(err, ServiceError::Config(_)));
        assert!(err.to_string().contains("guild.guild_id"));

        config.guild.guild_id = GuildId(1);
        let err = Collaborators::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("guild.vip_role_id"));

        config.guild.vip_role_id = RoleId(50);
        assert!(Collaborators::from_config(&config).is_ok());
    }

    #[test]
    fn missing_token_falls_back_to_local_collaborators() {
        let config = BotConfig::default();
        assert!(Collaborators::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn manual_reconcile_pass_returns_report() {
        let (app, _) = app_for(&test_config()).await;
        let (status, report) =
            post_json(app, "/v1/reconciler/run", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["expired"], serde_json::json!([]));
    }
}
