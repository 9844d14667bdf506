//! Binary entry point. Boots the pipeline from environment configuration,
//! starts the Pub/Sub bridge and idle-buffer reaper, and serves the HTTP
//! ingest + WebSocket subscriber routes until a shutdown signal arrives.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use vibration_pipeline::config::Config;
use vibration_pipeline::ingest;
use vibration_pipeline::pipeline::Pipeline;
use vibration_pipeline::supervisor;
use vibration_pipeline::ws;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::from_env();
    let bind_addr = config.ingest_bind_addr.clone();

    let pipeline = match Pipeline::connect(config).await {
        Ok(p) => p,
        Err(e) => {
            log::error!("failed to connect pipeline: {e}");
            std::process::exit(1);
        }
    };

    supervisor::startup(&pipeline);

    let housekeeping_cancel = CancellationToken::new();
    let housekeeping = tokio::spawn(supervisor::run_housekeeping(
        pipeline.clone(),
        housekeeping_cancel.clone(),
    ));

    let app = Router::new()
        .route("/api/sensor/data", post(ingest::ingest_batch))
        .route("/api/sensor/data/stream", post(ingest::ingest_stream))
        .route("/ws/sensor/{sensor_id}", get(ws::subscribe))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline.clone());

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("listening on {bind_addr}");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("server error: {e}");
    }

    log::info!("shutting down pipeline");
    supervisor::shutdown(&pipeline, &housekeeping_cancel, std::time::Duration::from_secs(30)).await;
    let _ = housekeeping.await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
