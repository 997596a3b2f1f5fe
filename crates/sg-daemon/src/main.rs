//! SSH gateway daemon
//!
//! Listens on a loopback port for SSH clients and bridges each login to
//! the workspace its username names.
//!
//! Usage: `sg-daemon <logLevel> <listenPort> [logFilePath]`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sg_core::config::{self, GatewayConfig};
use sg_core::{DaemonExit, DAEMON_VERSION};
use sg_daemon::broker::{run_liveness, TcpBrokerConnector};
use sg_daemon::ipc::DaemonIpcServer;
use sg_daemon::server::{load_or_generate_host_key, GatewayServer, ListenerError};
use sg_daemon::GatewayState;

#[derive(Parser)]
#[command(name = "sg-daemon")]
#[command(about = "Local SSH gateway to remote workspaces")]
#[command(version)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(value_parser = ["error", "warn", "info", "debug", "trace"])]
    log_level: String,

    /// Local port for SSH clients
    listen_port: u16,

    /// Log file, rotated daily. Logs go to stderr when omitted.
    log_file: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            let exit = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => DaemonExit::Ok,
                _ => DaemonExit::InvalidOptions,
            };
            std::process::exit(exit.code());
        }
    };

    let guard = init_logging(&args.log_level, args.log_file.as_deref());
    let exit = run(args);
    tracing::info!("Exiting with code {}", exit.code());

    // flush buffered log lines before exit
    drop(guard);
    std::process::exit(exit.code());
}

fn init_logging(log_level: &str, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
    );

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "sg-daemon.log".into());

            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}

fn run(args: Args) -> DaemonExit {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            return DaemonExit::UnexpectedError;
        }
    };

    match runtime.block_on(serve(args)) {
        Ok(()) => DaemonExit::Ok,
        Err(e) if e.downcast_ref::<ListenerError>().is_some() => {
            tracing::error!("{:#}", e);
            DaemonExit::ListenPortFailed
        }
        Err(e) => {
            tracing::error!("Gateway failed: {:#}", e);
            DaemonExit::UnexpectedError
        }
    }
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config: GatewayConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let default_path = config::default_config_path();
            config::load_config_or_default(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        }
    };
    config.listen_port = args.listen_port;
    Ok(config)
}

async fn serve(args: Args) -> Result<()> {
    tracing::info!("SSH gateway {} starting...", DAEMON_VERSION);

    let config = load_config(&args)?;
    tracing::info!(
        strategies = ?config.upstream.strategy_order,
        "Upstream strategy order"
    );

    let host_key = load_or_generate_host_key(&config.host_key_path)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let connector = Arc::new(TcpBrokerConnector::new(config.broker.request_timeout));
    let state = Arc::new(GatewayState::new(config, connector, cancel.clone()));

    // bind first: a second daemon must fail here with a distinct exit code
    let listen_address = state.config.listen_address();
    let server =
        GatewayServer::bind(&listen_address, host_key, Arc::clone(&state), cancel.clone()).await?;

    let ipc = DaemonIpcServer::bind(&state.config.ipc_address(), Arc::clone(&state)).await?;

    state.brokers.arm_idle_shutdown().await;

    tokio::spawn(run_liveness(
        Arc::clone(&state.brokers),
        state.config.broker.liveness_interval,
        cancel.clone(),
    ));

    tokio::spawn(async move {
        if let Err(e) = ipc.run().await {
            tracing::error!("IPC server failed: {:#}", e);
        }
    });

    let result = server.run().await;
    cancel.cancel();

    tracing::info!("SSH gateway shutdown complete");
    result
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}
