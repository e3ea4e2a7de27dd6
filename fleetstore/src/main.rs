use clap::Parser;
use fleetstore::db::Database;
use fleetstore::db::context::OpContext;
use fleetstore::{Config, telemetry};
use tokio_util::sync::CancellationToken;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, abandoning migration...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, abandoning migration...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = fleetstore::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let pool = fleetstore::connect_pool(&config).await?;
    let db = Database::new(pool, config.store_settings());

    // A signal abandons the migration in flight
    let token = CancellationToken::new();
    let ctx = OpContext::with_cancellation(token.clone());
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    if args.reset {
        tracing::warn!("--reset given: dropping all store tables before migrating");
    }
    let result = db.migrate(&ctx, args.reset).await;
    watcher.abort();

    if result.is_ok() {
        tracing::info!(state = ?db.state(), "Store schema is up to date");
    }
    telemetry::shutdown_telemetry();
    Ok(result?)
}
