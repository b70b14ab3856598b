//! Tandem collaboration server.
//!
//! Thin binary around [`tandem_collab::Coordinator`]: flag/env parsing,
//! logger setup, graceful shutdown. Exits 0 on clean shutdown, non-zero on
//! a fatal startup or serve error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tandem_collab::{Coordinator, CoordinatorConfig};

#[derive(Parser, Debug)]
#[command(name = "tandem-server", version, about = "Real-time collaborative editing server")]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Interface to bind.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Require clients to authenticate before joining documents.
    #[arg(long, env = "AUTH_REQUIRED", default_value_t = false)]
    auth: bool,

    /// Shared secret tokens must match (implies --auth).
    #[arg(long, env = "AUTH_SECRET")]
    auth_secret: Option<String>,

    /// Allowed CORS origin for the HTTP surface ("*" for any).
    #[arg(long, env = "CORS_ORIGIN")]
    cors_origin: Option<String>,

    /// Log filter (error, warn, info, debug, trace).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Directory for durable document storage (omit for in-memory).
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Disconnect sessions idle longer than this many seconds.
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 300)]
    idle_timeout_secs: u64,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to register SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    error!("ctrl-c handler failed: {e}");
                }
                info!("interrupt received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler failed: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level.clone()),
    )
    .init();

    let config = CoordinatorConfig {
        host: args.host,
        port: args.port,
        auth_required: args.auth || args.auth_secret.is_some(),
        auth_secret: args.auth_secret,
        cors_origin: args.cors_origin,
        storage_path: args.data_dir,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        ..CoordinatorConfig::default()
    };

    info!(
        "starting tandem-server on {} (auth: {}, storage: {})",
        config.bind_addr(),
        if config.auth_required { "required" } else { "open" },
        config
            .storage_path
            .as_ref()
            .map_or("in-memory".to_string(), |p| p.display().to_string()),
    );

    let coordinator = match Coordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    match coordinator.serve(shutdown_signal()).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
