//! Sauti server - HTTP API for batched speech inference

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod remote_engine;
mod state;

use remote_engine::RemoteInferenceBackend;
use sauti_core::{
    spawn_housekeeping, BlobStore, JobStore, QueueConfig, ResidencyCoordinator, SchedulerLoop,
};
use state::AppState;

const DEFAULT_INFERENCE_URL: &str = "http://127.0.0.1:8090";
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Parser)]
#[command(
    name = "sauti-server",
    about = "HTTP API server for the sauti batch inference queue",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Queue configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindConfig {
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sauti_server=info,sauti_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sauti server");

    let config = QueueConfig::load(args.config.as_deref())?;
    info!("Queue database: {:?}", config.db_path);
    info!("Blob directory: {:?}", config.blob_dir);

    let store = JobStore::initialize(config.db_path.clone())?;
    let blobs = Arc::new(BlobStore::initialize(
        config.blob_dir.clone(),
        config.blob_ttl(),
    )?);
    let residency = Arc::new(ResidencyCoordinator::new());

    let inference_url = inference_url_from_env_or_default();
    info!("Inference worker: {inference_url}");
    let backend = Arc::new(RemoteInferenceBackend::new(
        inference_url,
        inference_timeout_from_env_or_default(),
        residency.clone(),
    )?);
    backend.register_engines().await;

    let scheduler = SchedulerLoop::new(
        store.clone(),
        blobs.clone(),
        residency,
        backend,
        &config,
    )
    .spawn();
    let housekeeping = spawn_housekeeping(
        blobs.clone(),
        store.clone(),
        config.sweep_interval(),
        config.record_retention(),
    );

    let api_key = std::env::var("SAUTI_API_KEY").ok();
    if api_key.as_deref().map(str::trim).unwrap_or_default().is_empty() {
        warn!("SAUTI_API_KEY is not set; the API accepts unauthenticated requests");
    }
    let state = AppState::new(store, blobs, api_key);

    let app = api::create_router(state);

    let bind = resolve_bind_config(args);
    let addr = format!("{}:{}", bind.host, bind.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    let timeout = config.shutdown_timeout();
    scheduler.shutdown(timeout).await;
    housekeeping.shutdown(timeout).await;
    info!("Shutdown complete");

    Ok(())
}

fn resolve_bind_config(args: ServerArgs) -> BindConfig {
    BindConfig {
        host: args.host.unwrap_or_else(host_from_env_or_default),
        port: args.port.unwrap_or_else(port_from_env_or_default),
    }
}

fn host_from_env_or_default() -> String {
    match std::env::var("SAUTI_HOST") {
        Ok(raw) => {
            let host = raw.trim();
            if host.is_empty() {
                warn!("Empty SAUTI_HOST, falling back to 0.0.0.0");
                "0.0.0.0".to_string()
            } else {
                host.to_string()
            }
        }
        Err(_) => "0.0.0.0".to_string(),
    }
}

fn port_from_env_or_default() -> u16 {
    match std::env::var("SAUTI_PORT") {
        Ok(raw) => match raw.trim().parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid SAUTI_PORT='{}', falling back to 8080", raw);
                8080
            }
        },
        Err(_) => 8080,
    }
}

fn inference_url_from_env_or_default() -> String {
    std::env::var("SAUTI_INFERENCE_URL")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_INFERENCE_URL.to_string())
}

fn inference_timeout_from_env_or_default() -> Duration {
    let secs = match std::env::var("SAUTI_INFERENCE_TIMEOUT_SECS") {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(parsed) if parsed > 0 => parsed,
            _ => {
                warn!(
                    "Invalid SAUTI_INFERENCE_TIMEOUT_SECS='{}', falling back to {}",
                    raw, DEFAULT_INFERENCE_TIMEOUT_SECS
                );
                DEFAULT_INFERENCE_TIMEOUT_SECS
            }
        },
        Err(_) => DEFAULT_INFERENCE_TIMEOUT_SECS,
    };
    Duration::from_secs(secs)
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("environment lock poisoned")
    }

    fn clear_env() {
        std::env::remove_var("SAUTI_HOST");
        std::env::remove_var("SAUTI_PORT");
        std::env::remove_var("SAUTI_INFERENCE_URL");
        std::env::remove_var("SAUTI_INFERENCE_TIMEOUT_SECS");
    }

    fn parse(args: &[&str]) -> ServerArgs {
        ServerArgs::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn cli_values_override_environment() {
        let _guard = env_lock();
        clear_env();
        std::env::set_var("SAUTI_HOST", "0.0.0.0");
        std::env::set_var("SAUTI_PORT", "8080");

        let bind = resolve_bind_config(parse(&[
            "sauti-server",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
        ]));

        assert_eq!(bind.host, "127.0.0.1");
        assert_eq!(bind.port, 9000);
        clear_env();
    }

    #[test]
    fn uses_environment_when_cli_values_missing() {
        let _guard = env_lock();
        clear_env();
        std::env::set_var("SAUTI_HOST", "127.0.0.1");
        std::env::set_var("SAUTI_PORT", "8088");

        let bind = resolve_bind_config(parse(&["sauti-server"]));

        assert_eq!(bind.host, "127.0.0.1");
        assert_eq!(bind.port, 8088);
        clear_env();
    }

    #[test]
    fn falls_back_to_defaults_without_cli_or_environment() {
        let _guard = env_lock();
        clear_env();

        let bind = resolve_bind_config(parse(&["sauti-server"]));

        assert_eq!(bind.host, "0.0.0.0");
        assert_eq!(bind.port, 8080);
        assert_eq!(inference_url_from_env_or_default(), DEFAULT_INFERENCE_URL);
        assert_eq!(
            inference_timeout_from_env_or_default(),
            Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn falls_back_to_default_when_env_values_are_invalid() {
        let _guard = env_lock();
        clear_env();
        std::env::set_var("SAUTI_PORT", "not-a-port");
        std::env::set_var("SAUTI_INFERENCE_TIMEOUT_SECS", "0");

        let bind = resolve_bind_config(parse(&["sauti-server"]));

        assert_eq!(bind.port, 8080);
        assert_eq!(
            inference_timeout_from_env_or_default(),
            Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS)
        );
        clear_env();
    }

    #[test]
    fn config_path_is_accepted() {
        let args = parse(&["sauti-server", "--config", "/etc/sauti.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/sauti.toml")));
    }
}
