#![forbid(unsafe_code)]

//! **mycel** – Mycel service entrypoint.
//!
//! Boots the agent runtime and the integration fabric from one configuration
//! document and serves the HTTP edge until a shutdown signal arrives, then
//! drains every agent under the configured deadline.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mycel_service::{build, ServiceConfig};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "mycel")]
#[command(about = "Mycel - supervised multi-agent runtime and integration fabric")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "config/mycel.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the HTTP bind address from the configuration
    #[arg(long)]
    bind: Option<String>,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("Starting Mycel v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    if let Some(bind) = cli.bind {
        config.http.bind = bind;
    }
    info!(
        agents = config.agents.len(),
        registry = %config.registry_path.display(),
        "configuration loaded"
    );

    let bind = config.http.bind.clone();
    let service = build(config).await?;

    // Start every registered agent in dependency order before accepting
    // traffic; a failed required agent aborts boot.
    service.orchestrator.start_all().await.map_err(|err| anyhow::anyhow!(err.to_string()))?;
    info!("all agents running");

    let app = mycel_service::build_app(service.state.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("HTTP edge listening on {bind}");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        error!(error = %err, "HTTP server error");
    }

    info!("shutting down agents");
    let outcome = service.orchestrator.stop_all(service.stop_deadline).await;
    for (agent, status) in &outcome {
        info!(agent = %agent, status = ?status, "agent terminal state");
    }
    info!("Mycel stopped");
    Ok(())
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_logging(log_level: &str) -> Result<()> {
    let filter = format!("mycel={log_level},mycel_service={log_level},mycel_fabric={log_level},mycel_agent={log_level},mycel_orchestration={log_level},mycel_agents={log_level},tower_http=warn");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(filter)?)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
