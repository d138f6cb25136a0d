//! # Real-time Fan-out Server
//!
//! Serves post comment streams and two-party chats over WebSocket, plus the
//! HTTP routes that page through history and edit, delete or react to items.
//! Every mutation is published to the topic's subscribers, on this instance
//! or, with Redis configured, on every instance sharing that Redis.
//!
//! Configuration comes from defaults, then `server_realtime.conf`, then
//! `RT_*` environment variables and CLI flags. Shutdown on Ctrl-C or SIGTERM
//! is graceful with a 10 second limit.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use lib_realtime::loggers::setup_logging;
use tokio::net::TcpListener;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info};

mod realtime_logic;

use realtime_logic::config::{Config, load_config};
use realtime_logic::routes::router;
use realtime_logic::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config();

    // Dropping the guard flushes the file writer, so it lives until main returns.
    let log_level = config.log_level();
    let _log_guard = setup_logging(config.log_dir(), &log_level, "server_realtime")
        .context("failed to initialize logging")?;
    info!(port = config.port(), redis = config.redis_url.is_some(), "starting server_realtime");

    let state = AppState::build(&config).await?;

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| async move {
        if let Err(e) = serve(config, state, guard).await {
            error!(error = %e, "server stopped with an error");
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}

async fn serve(config: Config, state: AppState, guard: ShutdownGuard) -> Result<()> {
    let address = format!("0.0.0.0:{}", config.port());
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            guard.cancelled().await;
            info!("Signal received: initiate graceful shutdown");
        })
        .await?;
    Ok(())
}
