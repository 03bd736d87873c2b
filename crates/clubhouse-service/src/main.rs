use clap::Parser;
use clubhouse_service::config::BotConfig;
use clubhouse_service::{build_router, Collaborators, ServiceState};
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "clubhoused", version, about = "Clubhouse bot: credits, VIP roles, and draws")]
struct Cli {
    /// Configuration file (TOML), layered over defaults.
    #[arg(short, long, env = "CLUBHOUSE_CONFIG")]
    config: Option<String>,

    /// HTTP socket address to bind, e.g. 127.0.0.1:8095
    #[arg(short, long, env = "CLUBHOUSE_LISTEN_ADDR")]
    listen: Option<SocketAddr>,

    #[arg(long, env = "CLUBHOUSE_LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, env = "CLUBHOUSE_LOG_JSON")]
    json: bool,

    /// Discord bot token. Without one the service runs on in-memory collaborators.
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    discord_token: Option<String>,
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("clubhouse_service={level},clubhouse_core={level},{level}").into()
    });

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BotConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if cli.discord_token.is_some() {
        config.discord.token = cli.discord_token;
    }

    init_tracing(&config.logging.level, config.logging.json);

    let collaborators = Collaborators::from_config(&config)?;
    let state = ServiceState::bootstrap(&config, collaborators).await?;
    let reconciler = state.reconciler.clone().spawn();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!("clubhouse-service listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("clubhouse-service shutting down");
    if let Err(e) = reconciler.shutdown().await {
        error!(error = %e, "expiry reconciler task ended abnormally");
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
