//! Socket relay server - Entry Point
//!
//! Reads the configuration, then runs as a standalone server, as a
//! cluster supervisor, or as a worker spawned by one.

use std::process::ExitCode;

use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use socket_relay::supervisor::{self, Role, WorkerSignal, ROLE_ENV, WORKER_INDEX_ENV};
use socket_relay::{bind, AppError, Config, RelayBackend, RelayServer, ServerBuilder};

/// Sent to every client once it is registered
const CONNECTION_ESTABLISHED: &str = "cs";

/// Relay `data` to `recipient`
const MESSAGE: &str = "m";

const PING: &str = "ping";
const PONG: &str = "pong";

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=socket_relay=trace
    // Logs go to stderr: a worker's stdout carries supervisor signals
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("socket_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let role = Role::detect(&config, std::env::var(ROLE_ENV).ok().as_deref());
    let result = match role {
        Role::Supervisor => supervisor::run(config, shutdown_requested(false)).await,
        Role::Worker => run_server(config, true).await,
        Role::Standalone => run_server(config, false).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Stopped with error");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config, supervised: bool) -> Result<(), AppError> {
    if supervised {
        let index = std::env::var(WORKER_INDEX_ENV).unwrap_or_default();
        info!(worker = %index, pid = std::process::id(), "Worker starting");
    }

    let backend = RelayBackend::from_config(&config)?;
    if matches!(backend, RelayBackend::Local(_)) {
        warn!("No relay service configured, messages stay within this process");
    }

    let listener = bind(&config).await?;
    info!("Socket server started on {}", config.bind_addr());

    let server = register_protocol(RelayServer::builder(config)).build();

    if supervised {
        WorkerSignal::Ready.emit();
    }

    server
        .serve(listener, backend, shutdown_requested(supervised))
        .await?;

    // Only a clean stop counts as intentional; errors get the worker replaced
    if supervised {
        WorkerSignal::Stopping.emit();
    }
    info!("Socket server stopped");
    Ok(())
}

/// Minimal protocol: greet on connect, relay addressed messages, answer pings
fn register_protocol(builder: ServerBuilder) -> ServerBuilder {
    builder
        .on_connect(|server, conn| {
            let hello = server.codec().tagged(CONNECTION_ESTABLISHED);
            server.send_json(conn, &hello);
        })
        .on(MESSAGE, |server, conn, envelope| match envelope.relay() {
            Some(relay) => {
                if let Err(e) = server.deliver(relay) {
                    error!(user = %conn.user(), error = %e, "Failed to relay message");
                }
            }
            None => warn!(user = %conn.user(), "Message without recipient or data"),
        })
        .on(PING, |server, conn, _| {
            let pong: Value = server.codec().tagged(PONG);
            server.send_json(conn, &pong);
        })
}

/// Resolves on SIGINT, SIGTERM, or (for workers) the supervisor closing stdin
async fn shutdown_requested(supervised: bool) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let supervisor_gone = async {
        if supervised {
            supervisor::supervisor_closed().await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = supervisor_gone => info!("Supervisor requested shutdown"),
    }
}
