//! kvstream - streaming inference server for local GGUF models

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kvstream::inference::{Generator, LlamaCppBackend, LlamaSettings, ModelBackend, SessionManager};
use kvstream::server::Server;
use kvstream::storage::settings::{load_settings, AppConfig};
use kvstream::storage::{init_storage, StorageError};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    let mut filter = EnvFilter::from_default_env();
    match "kvstream=info".parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("Invalid default log directive: {e}"),
    }
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting kvstream v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_settings();
    for arg in std::env::args().skip(1) {
        if let Err(e) = apply_override(&mut config, &arg) {
            error!("Invalid override '{}': {}", arg, e);
            return ExitCode::FAILURE;
        }
    }
    if let Err(e) = init_storage(&config) {
        warn!("Failed to initialize storage: {}", e);
    }

    let backend = Arc::new(LlamaCppBackend::start(LlamaSettings::from_config(&config.models)));
    if !backend.is_available() {
        error!("llama.cpp backend failed to initialize; all operations will fail");
    }

    let sessions = Arc::new(SessionManager::new(
        backend,
        config.models.cache_directory.clone(),
    ));

    if let Some(identifier) = config.models.default_model_identifier.as_deref() {
        info!("Loading default model '{}'", identifier);
        if let Err(e) = sessions.load(identifier, None).await {
            error!("Failed to load default model '{}': {}", identifier, e);
        }
    }

    let generator = Generator::new(sessions, config.generation.clone());
    let server = Arc::new(Server::new(generator, config.models.scan_directories.clone()));

    let address = format!("{}:{}", config.app.host, config.app.port);
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", address, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.serve(listener, shutdown_signal()).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Apply a `section.key=value` argument; values are JSON, or a bare string
fn apply_override(config: &mut AppConfig, arg: &str) -> Result<(), StorageError> {
    let Some((key, raw)) = arg.split_once('=') else {
        return Err(StorageError::UnknownKey(arg.to_string()));
    };
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw));
    config.set_path(key.trim(), value)
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to listen for SIGTERM: {e}"),
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            () = ctrl_c => info!("Received SIGINT, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received Ctrl+C, shutting down");
    }
}
