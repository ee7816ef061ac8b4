//! Account generator HTTP server

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use accountgen::{
    CaviumConfig, CaviumProvider, FileBasedConfig, FileBasedProvider, GeneratorError,
    KeyGenerator,
};

use crate::handlers::{self, AppState};
use crate::rpc::{GenerateAccountHandler, RequestMapper};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handlers::json_rpc))
        .route("/upcheck", get(handlers::upcheck))
        .with_state(state)
}

/// Load the optional TOML configuration file named by `ACCOUNTGEN_CONFIG`.
/// An unreadable or unparsable file is a startup failure, not something to
/// limp past.
fn load_config_table() -> Result<Option<toml::Table>, GeneratorError> {
    let Ok(path) = std::env::var("ACCOUNTGEN_CONFIG") else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(&path).map_err(|e| {
        GeneratorError::Configuration(format!("cannot read config file {}: {}", path, e))
    })?;
    let table = text.parse::<toml::Table>().map_err(|e| {
        GeneratorError::Configuration(format!("cannot parse config file {}: {}", path, e))
    })?;
    Ok(Some(table))
}

fn sub_table<'a>(table: Option<&'a toml::Table>, key: &str) -> Option<&'a toml::Table> {
    table.and_then(|t| t.get(key)).and_then(|v| v.as_table())
}

fn build_generator(
    table: Option<&toml::Table>,
) -> Result<Arc<dyn KeyGenerator>, GeneratorError> {
    let mode = table
        .and_then(|t| t.get("mode"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| std::env::var("GENERATOR_MODE").ok())
        .unwrap_or_else(|| "file-based".to_string());

    let directory: PathBuf = table
        .and_then(|t| t.get("directory"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| std::env::var("ACCOUNTGEN_DIRECTORY").ok())
        .unwrap_or_else(|| ".".to_string())
        .into();

    match mode.as_str() {
        "file-based" => {
            let config = FileBasedConfig::resolve(sub_table(table, "file-generator"))?;
            let provider = FileBasedProvider::new(config);
            provider.initialize()?;
            Ok(Arc::new(provider.generator()))
        }
        "cavium" => {
            let config = CaviumConfig::resolve(sub_table(table, "cavium-generator"))?;
            let provider = CaviumProvider::new(config);
            provider.initialize()?;
            Ok(Arc::new(provider.generator(directory)))
        }
        other => Err(GeneratorError::Configuration(format!(
            "unknown generator mode: {}",
            other
        ))),
    }
}

pub async fn run(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_config_table()?;

    let mut mapper = RequestMapper::new();
    match build_generator(table.as_ref()) {
        Ok(generator) => {
            mapper.add_handler(
                "eth_generateAccount",
                Arc::new(GenerateAccountHandler::new(generator)),
            );
            tracing::info!("Registered method: eth_generateAccount");
        }
        // Bad configuration aborts startup. A backend that fails to come up
        // leaves the method unregistered so every call gets the default
        // error, while the liveness probe stays up.
        Err(e @ GeneratorError::Configuration(_)) => return Err(e.into()),
        Err(e) => {
            tracing::error!("Key generator unavailable, serving without it: {}", e);
        }
    }

    let state = Arc::new(AppState { mapper });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Account generator service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("Received SIGTERM signal");
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                // Wait forever since we can't receive SIGTERM
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Starting graceful shutdown...");
}
