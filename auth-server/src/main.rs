use auth_server::config::AppConfig;
use auth_server::create_app;
use auth_server::interceptor;
use auth_server::state::AppState;
use auth_server::store::KeyValueStore;
use log::{error, info};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    // Load configuration
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    info!("Starting in '{}' environment", config.server.env);
    let port = config.server.port;
    let refresh_interval = config.interceptor.refresh_interval;

    // Initialize application state
    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Startup error: {}", e);
            std::process::exit(1);
        }
    };

    // Background tasks stop when the server does
    let shutdown = CancellationToken::new();
    interceptor::spawn_refresher(state.interceptor.keys(), refresh_interval, shutdown.clone());

    let app = create_app(state.clone()).await;

    // Build server address
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    // Start server
    let server = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    // Start the server and wait for it to finish
    info!("Server running on {}, press Ctrl+C to stop", addr);
    let serve = axum::serve(server, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    if let Err(e) = state.store.close().await {
        error!("Failed to close store: {}", e);
    }

    if let Err(e) = serve {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
    info!("Server shutdown complete");
}

// Simple signal handler that works on all platforms
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
