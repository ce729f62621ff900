//! # ASR Gateway - Main Application Entry Point
//!
//! A WebSocket gateway that streams telephony audio into a speech-recognition
//! engine and relays partial and final transcripts back to the caller.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **logging**: Console and file `tracing` sinks
//! - **audio**: PCM format description and the diagnostic WAV capture sink
//! - **recognition**: Engine seam; the shared model and per-session recognizers
//! - **session**: Audio sessions, their ordering tickets and the session registry
//! - **pool**: Fixed worker pool that runs recognition off the I/O threads
//! - **protocol**: JSON control messages in both directions
//! - **relay**: The gateway that ties sessions, workers and transport together
//! - **websocket**: The actix WebSocket actor and connection hub
//! - **state / health / middleware**: Operational HTTP endpoints and request metrics
//!
//! ## Startup Order:
//! Configuration, directories and the model are all resolved before the listener
//! binds. Any failure there aborts the process with a non-zero exit code.

mod audio;
mod config;
mod error;
mod health;
mod logging;
mod middleware;
mod pool;
mod protocol;
mod recognition;
mod relay;
mod session;
mod state;
mod websocket;

#[cfg(test)]
mod testing;

use crate::audio::AudioFormat;
use crate::config::AppConfig;
use crate::relay::{Gateway, GatewayOptions};
use crate::state::AppState;
use crate::websocket::ConnectionHub;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::load()?;
    config.validate()?;

    std::fs::create_dir_all(&config.logging.dir).with_context(|| {
        format!(
            "Failed to create log directory {}",
            config.logging.dir.display()
        )
    })?;
    logging::init(&config)?;
    for notice in &config.startup_warnings {
        warn!("{}", notice);
    }

    info!("Starting asr-gateway v{}", env!("CARGO_PKG_VERSION"));

    let capture_dir = if config.capture.enabled {
        std::fs::create_dir_all(&config.capture.dir).with_context(|| {
            format!(
                "Failed to create capture directory {}",
                config.capture.dir.display()
            )
        })?;
        Some(config.capture.dir.clone())
    } else {
        None
    };

    let model = recognition::load_model(&config.recognition.model_path).with_context(|| {
        format!(
            "Failed to load recognition model from {}",
            config.recognition.model_path.display()
        )
    })?;

    let hub = Arc::new(ConnectionHub::new());
    let gateway = Arc::new(
        Gateway::new(
            model,
            hub.clone(),
            GatewayOptions {
                format: AudioFormat::new(config.recognition.sample_rate),
                capture_dir,
                workers: config.worker_threads(),
            },
        )
        .context("Failed to start recognition workers")?,
    );

    info!(
        engine = %gateway.engine(),
        sample_rate = config.recognition.sample_rate,
        workers = gateway.pool_stats().workers,
        capture = gateway.options().capture_dir.is_some(),
        log_file = %config.log_file().display(),
        "Gateway initialized"
    );

    let bind_addr = config.bind_addr();
    let app_state = AppState::new(config, Arc::clone(&gateway), hub);

    info!("Starting WebSocket server on ws://{}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .route("/", web::get().to(websocket::audio_websocket))
            .route("/ws", web::get().to(websocket::audio_websocket))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {bind_addr}"))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let draining = Arc::clone(&gateway);
    if let Err(e) = tokio::task::spawn_blocking(move || draining.shutdown()).await {
        error!("Gateway shutdown failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Resolve once SIGINT or SIGTERM arrives.
///
/// If a handler cannot be installed the gateway keeps serving and only the
/// remaining signal (or the server stopping on its own) ends it.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate())
        .map_err(|e| warn!("Failed to install SIGTERM handler: {}", e))
        .ok();
    let sigint = signal(SignalKind::interrupt())
        .map_err(|e| warn!("Failed to install SIGINT handler: {}", e))
        .ok();

    let terminate = async {
        match sigterm {
            Some(mut s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let interrupt = async {
        match sigint {
            Some(mut s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = terminate => info!("Received SIGTERM"),
        _ = interrupt => info!("Received SIGINT"),
    }
}
