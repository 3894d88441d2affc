//! fdaemon, the FATMAN calculation runner daemon

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fatman_client::ApiClient;
use fatman_daemon::{Config, ConfigError, DaemonArgs, DaemonError, HttpTransport, LoopSettings, ProcessExecutor, WorkLoop};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = DaemonArgs::parse();

    // Initialize tracing, RUST_LOG takes precedence over -v
    let default_filter = match args.verbose {
        0 => "warn,fatman_daemon=info,fatman_client=info",
        1 => "info,fatman_daemon=debug,fatman_client=debug",
        _ => "debug,fatman_daemon=trace,fatman_client=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(true)
        .init();

    match run(args).await {
        Ok(()) => {
            info!("fdaemon stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fdaemon failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: DaemonArgs) -> Result<(), DaemonError> {
    let config = Config::from_args(args)?;

    info!(
        worker_id = %config.worker_id,
        url = %config.url,
        data_dir = %config.data_dir.display(),
        slots = config.pool_size,
        "Starting fdaemon"
    );
    if !config.client.verify_tls {
        warn!("SSL certificate verification is disabled");
    }

    let client = ApiClient::with_options(&config.url, config.client.clone())
        .map_err(|e| DaemonError::Config(ConfigError::Invalid(format!("--url: {}", e))))?;
    let transport = Arc::new(HttpTransport::new(client, config.worker_id.clone()));
    let executor = Arc::new(ProcessExecutor::new(&config.data_dir, config.task_timeout));
    let work_loop = WorkLoop::new(transport, executor, LoopSettings::from(&config));

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    work_loop.run(shutdown).await
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn forward_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Received shutdown signal");
    shutdown.cancel();
}
