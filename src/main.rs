use anyhow::Context;
use clap::Parser;
use newsreel::headline::{HeadlineSynthesizer, MockHeadlineSynthesizer, ModelHeadlineSynthesizer};
use newsreel::{
    ChangeFeedWorker, ClusteringEngine, DocumentStore, IngestionScheduler, MemoryStore, PgStore,
    PipelineConfig,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "newsreel", about = "Continuous news aggregation pipeline")]
struct Args {
    /// Number of clustering workers consuming the change feed.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Poll one tick, drain the change feed once, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = PipelineConfig::from_env();
    let roster = newsreel::sources::feed_roster();
    info!(feeds = roster.len(), workers = args.workers, "Starting newsreel");

    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgStore::connect(url)
                .await
                .context("failed to connect to the document store")?,
        ),
        None => {
            warn!("DATABASE_URL not set, running on the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let synthesizer: Arc<dyn HeadlineSynthesizer> = match &config.headline_model_url {
        Some(url) => Arc::new(ModelHeadlineSynthesizer::new(
            url.clone(),
            config.headline_model_key.clone(),
        )?),
        None => {
            warn!("HEADLINE_MODEL_URL not set, headlines use the deterministic synthesizer");
            Arc::new(MockHeadlineSynthesizer::new())
        }
    };

    let engine = Arc::new(ClusteringEngine::new(
        Arc::clone(&store),
        config.clone(),
        synthesizer,
    ));
    let scheduler = Arc::new(IngestionScheduler::new(
        Arc::clone(&store),
        config.clone(),
        roster,
    )?);

    if args.once {
        return run_once(store, engine, scheduler).await;
    }

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(Arc::clone(&scheduler).run(shutdown.clone()));
    for _ in 0..args.workers.max(1) {
        let worker = ChangeFeedWorker::new(Arc::clone(&store), Arc::clone(&engine), config.clone());
        tasks.spawn(worker.run(shutdown.clone()));
    }
    tasks.spawn(newsreel::status::run_status_sweep(
        Arc::clone(&store),
        config.clone(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping pipeline");
    shutdown.cancel();

    while tasks.join_next().await.is_some() {}
    info!("Pipeline stopped cleanly");
    Ok(())
}

/// Single-shot mode: one ingestion tick, then drain every partition through
/// the clustering engine without taking leases. Handy for smoke-testing a
/// roster or a store.
async fn run_once(
    store: Arc<dyn DocumentStore>,
    engine: Arc<ClusteringEngine>,
    scheduler: Arc<IngestionScheduler>,
) -> anyhow::Result<()> {
    scheduler.run_tick().await;

    for partition in store.article_partitions().await? {
        let mut continuation = 0u64;
        loop {
            let batch = store.read_article_changes(&partition, continuation, 100).await?;
            if batch.articles.is_empty() {
                break;
            }
            engine.process_batch(&batch.articles).await?;
            continuation = batch.continuation;
        }
    }

    let stories = store.active_stories().await?;
    info!(stories = stories.len(), "Single pass complete");
    Ok(())
}
