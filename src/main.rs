use clap::Parser;
use clinsync::{create_router, default_registry, SyncEngine, SyncEngineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "clinsync")]
#[command(about = "Offline-first synchronization server for clinical field data", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6750)]
    port: u16,

    /// Days an offline cache entry stays servable before devices re-pull
    #[arg(long, default_value_t = 3)]
    retention_days: u64,

    /// Retry budget for failed applies
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Seconds before a stuck SYNCING entry is requeued
    #[arg(long, default_value_t = 60)]
    processing_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clinsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncEngineConfig {
        max_retries: args.max_retries,
        processing_timeout: std::time::Duration::from_secs(args.processing_timeout),
        ..SyncEngineConfig::with_retention_days(args.retention_days)
    };

    // The stand-alone binary applies changes to in-memory stores; embedders
    // register handlers backed by their own datastore instead
    let engine = SyncEngine::new(default_registry(), config);
    tracing::info!("Sync engine initialized");

    let app = create_router(engine);

    // Start server with graceful shutdown
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
