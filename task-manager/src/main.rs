use std::net::SocketAddr;

use anyhow::Context;
use common_observability::init_tracing;
use tokio::net::TcpListener;
use tracing::info;

use task_manager::config::TaskManagerConfig;
use task_manager::router::{build_router, build_state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let config = TaskManagerConfig::from_env()?;
    let host = config.host.clone();
    let port = config.port;

    let state = build_state(config).await?;
    state.verifier.jwks().warmup().await;

    let app = build_router(state);

    let ip: std::net::IpAddr = host.parse().context("invalid HOST")?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, "starting task-manager");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
