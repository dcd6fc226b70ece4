use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use veridex::cron::TickFn;
use veridex::{
    AttributeCodec, BlockSyncEngine, CronScheduler, MessageRegistry, PostgresClient,
    ResilienceManager, RpcClient, Settings, TxPipeline,
};

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();

    // Load configuration
    let settings = Settings::new()
        .context("Failed to load config.yaml. Please ensure it exists and is valid")?;

    let db = Arc::new(
        PostgresClient::new(settings.postgres.clone())
            .await
            .context("Failed to initialize database connection")?,
    );
    db.health_check()
        .await
        .context("Database connection is not usable")?;
    db.migrate()
        .await
        .context("Failed to run database migrations")?;

    let rpc = RpcClient::new(&settings.node)?;

    // Probe the node once before anything else: the network name goes to the
    // logs, the version picks the event attribute codec (pre-0.35 nodes
    // base64-encode attribute keys and values).
    let status = rpc.status().await.context("Failed to query node status")?;
    info!(
        "Connected to {} node running CometBFT {} (tip at {})",
        status.node_info.network, status.node_info.version, status.sync_info.latest_block_height
    );
    if status.sync_info.catching_up {
        warn!("Node is still catching up; indexing will trail its progress");
    }
    let codec = AttributeCodec::from_node_version(&status.node_info.version);

    let resilience = ResilienceManager::new(
        rpc.clone(),
        Duration::from_secs(settings.indexer.recovery_interval_secs),
    );

    run_indexer(settings, db, rpc, codec, resilience).await
}

async fn run_indexer(
    settings: Settings,
    db: Arc<PostgresClient>,
    rpc: RpcClient,
    codec: AttributeCodec,
    resilience: Arc<ResilienceManager>,
) -> anyhow::Result<()> {
    let cancellation_token = CancellationToken::new();

    let mut scheduler = CronScheduler::new()
        .await
        .context("Failed to create scheduler")?;

    let registry = Arc::new(MessageRegistry::new());

    // Block crawler owns its own poll job so it can retune the cadence as
    // it crosses the caught-up threshold.
    let engine = BlockSyncEngine::new(
        rpc.clone(),
        db.clone(),
        resilience.clone(),
        codec,
        settings.indexer.clone(),
        settings.node.push_enabled,
        scheduler.clone(),
        cancellation_token.child_token(),
    )
    .await
    .context("Failed to initialize block sync engine")?;

    let pipeline = TxPipeline::new(
        rpc,
        db,
        resilience.clone(),
        registry,
        codec,
        settings.indexer.clone(),
    )
    .await
    .context("Failed to initialize transaction pipeline")?;

    engine.start().await.context("Failed to start block sync")?;

    let tx_pipeline = pipeline.clone();
    let tick: TickFn = Box::new(move || {
        let pipeline = tx_pipeline.clone();
        Box::pin(async move { pipeline.tick().await })
    });
    scheduler
        .add_repeated(
            "tx-crawl",
            Duration::from_millis(settings.indexer.tx_interval_ms),
            tick,
        )
        .await?;

    scheduler.start().await.context("Failed to start scheduler")?;

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("Indexer running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    info!("Finishing all tasks...");

    // Drops the push channel and any recovery probe along with the jobs.
    cancellation_token.cancel();
    scheduler.shutdown().await?;

    info!("Indexer stopped at height {}", engine.current_height());
    Ok(())
}
