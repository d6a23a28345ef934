use std::net::SocketAddr;

use labtrace_core::PipelineConfig;
use labtrace_web::{app, config::ServerConfig, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labtrace_web=debug,labtrace_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    let port = config.port;
    let state = AppState::from_config(config, PipelineConfig::from_env()).await?;
    state.spawn_progress_purge();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting labtrace on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
