//! Lockstep Server Binary
//!
//! Every rank runs this binary. Rank 0 serves clients; the others follow.
//!
//! Run a two-rank group on one host with:
//!   RANK=0 WORLD_SIZE=2 cargo run -p lockstep-server
//!   RANK=1 WORLD_SIZE=2 cargo run -p lockstep-server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use lockstep_dispatch::{
    group::{local, tcp::TcpFollower, tcp::TcpLeader},
    Dispatcher, EchoEngine, FollowerLoop, GenerationEngine, LeaderLink,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lockstep_server::{routes, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_server=info,lockstep_dispatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_args();
    tracing::info!("Starting lockstep server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Rank {} of {}", config.rank, config.world_size);
    tracing::info!("Rendezvous address: {}", config.master_addr);
    tracing::info!("Checkpoint directory: {:?}", config.engine.ckpt_dir);

    if config.rank as usize >= config.world_size.max(1) {
        anyhow::bail!("rank {} is outside a world of {}", config.rank, config.world_size);
    }
    config.validate().context("invalid generation defaults")?;

    let engine: Arc<dyn GenerationEngine> = Arc::new(EchoEngine::new(config.engine.clone()));

    if config.is_leader() {
        run_leader(config, engine).await
    } else {
        run_follower(config, engine).await
    }
}

async fn run_leader(config: ServerConfig, engine: Arc<dyn GenerationEngine>) -> anyhow::Result<()> {
    let link: Arc<dyn LeaderLink> = if config.world_size > 1 {
        tracing::info!("Waiting for {} followers to join...", config.world_size - 1);
        let leader = TcpLeader::establish(config.master_addr.as_str(), config.world_size, config.join_timeout)
            .await
            .context("process group did not assemble")?;
        tracing::info!("Process group ready");
        Arc::new(leader)
    } else {
        let (leader, _) = local::group(1);
        Arc::new(leader)
    };

    let dispatcher = Dispatcher::new(link, engine, config.dispatch.clone());
    let state = AppState::new(config.clone(), dispatcher.clone());

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Parse bind address
    let addr: SocketAddr = config.bind_address().parse()?;

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping followers");
    if let Err(e) = dispatcher.shutdown().await {
        tracing::warn!("Followers were not shut down cleanly: {}", e);
    }

    Ok(())
}

async fn run_follower(config: ServerConfig, engine: Arc<dyn GenerationEngine>) -> anyhow::Result<()> {
    tracing::info!("Joining leader at {}", config.master_addr);
    let link = TcpFollower::connect(&config.master_addr, config.rank, config.world_size, config.join_timeout)
        .await
        .context("could not join the process group")?;

    FollowerLoop::new(link, engine).run().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
