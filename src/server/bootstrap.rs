use crate::config::FederatorConfig;
use crate::server::{self, FederatorState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = FederatorConfig::load(&args.config_path)?;
    let state = FederatorState::new(config)?;

    let shutdown = Arc::new(Notify::new());
    start_signal_handler(&shutdown);
    start_admin_server(&state, &args);

    tracing::info!("server: starting federator gateway, listen={}", args.listen);
    server::run_server(&args.listen, state, shutdown).await?;

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_signal_handler(shutdown: &Arc<Notify>) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("server: failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("server: shutdown signal received");
        shutdown.notify_waiters();
    });
}

fn start_admin_server(state: &FederatorState, args: &BootstrapArgs) {
    let state = state.clone();
    let listen = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, state).await {
            tracing::error!("server: admin server failed: {}", e);
        }
    });
}
