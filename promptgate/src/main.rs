use std::sync::Arc;

use clap::Parser;
use promptgate::{
    config::{Args, Config},
    AdmissionController, CliToolClient, Executor, JobQueue, MemoryCache, Pipeline, PromptClient,
    RetryPolicy, UsageLedger, WorkerConfig,
};

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
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "promptgate=info,tower_http=info".into()),
        )
        .init();

    tracing::debug!("{:?}", args);

    // The ledger must open cleanly; running with an unreliable budget count
    // would let callers blow through the upstream cap.
    let ledger = Arc::new(UsageLedger::open(&config.rate.ledger_path, config.rate.window).await?);
    tracing::info!(
        path = %config.rate.ledger_path.display(),
        max_per_hour = config.rate.max_per_hour,
        "opened usage ledger"
    );

    let cache = Arc::new(MemoryCache::new());
    let tool = CliToolClient::new(config.tool.program.clone(), config.tool.base_flags.clone());
    let executor = Executor::new(
        tool,
        RetryPolicy::from(&config.retry),
        config.tool.attempt_timeout,
    );
    let pipeline = Arc::new(Pipeline::new(
        AdmissionController::new(ledger.clone(), config.rate.max_per_hour),
        cache.clone(),
        config.cache.ttl,
        executor,
        ledger.clone(),
    ));

    let client = Arc::new(PromptClient::new(
        pipeline,
        Arc::new(JobQueue::new()),
        ledger,
        cache,
        WorkerConfig::from(&config.queue),
        config.rate.prune_interval,
    ));

    let background = client.start();

    let app = promptgate::http::router(client);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }

    Ok(())
}
