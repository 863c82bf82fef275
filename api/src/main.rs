mod db;
mod error;
mod multipart;
mod registry;
mod routes;
mod state;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use roadwatch_common::config::Config;
use roadwatch_pipeline::detector::DetectorAdapter;
use roadwatch_pipeline::source::ffmpeg::check_ffmpeg_available;
use tracing::{error, info, warn};

use crate::db::ScanLog;
use crate::state::AppState;

/// Resolves on Ctrl-C after ending every open feed and metrics socket, so
/// graceful shutdown does not wait on long-lived responses.
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    state.registry.cancel_all();
    state.hub.shutdown();
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    if !check_ffmpeg_available(&config.stream.ffmpeg_path) {
        warn!(ffmpeg = %config.stream.ffmpeg_path, "ffmpeg not found; stream playback will fail");
    }

    let detector = tokio::task::spawn_blocking({
        let detector_config = config.detector.clone();
        move || DetectorAdapter::from_config(&detector_config)
    })
    .await
    .unwrap_or_else(|e| DetectorAdapter::unavailable(format!("detector load panicked: {e}")));
    if !detector.is_ready() {
        warn!(backend = %config.detector.backend, "detector unavailable; serving in degraded mode");
    }

    let scans = match ScanLog::open(&config.database.path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open scan log {}: {e}", config.database.path.display());
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let state = Arc::new(AppState::new(config, detector, scans));
    let app = routes::router(state.clone());

    info!(addr, "roadwatch API server starting");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
    {
        error!(error = %e, "server error");
    }

    info!("roadwatch API server stopped");
}
