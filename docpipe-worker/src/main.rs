use std::sync::Arc;

use anyhow::{Context, Result};
use docpipe::{executor::StageExecutor, Docpipe};
use docpipe_redis::RedisQueue;
use docpipe_worker::{
    config::Config, extractor::HttpExtractor, reporter::HttpReporter,
    summarizer::OpenAiSummarizer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,docpipe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let queue = RedisQueue::from_url(&config.redis_url, &config.redis_namespace)
        .await
        .context("Failed to connect to the queue")?;
    let recovered = queue
        .recover()
        .await
        .context("Failed to recover in-flight work items")?;
    if recovered > 0 {
        tracing::info!(recovered, "Returned unfinished work items to the queue");
    }

    let executor = StageExecutor::new(
        Arc::new(HttpReporter::new(&config.api_base_url, &config.worker_secret)),
        Arc::new(HttpExtractor::new(&config.ocr_url)),
        Arc::new(OpenAiSummarizer::new(
            &config.openai_base_url,
            &config.openai_api_key,
            &config.openai_model,
        )),
    )
    .with_stage_timeout(config.stage_timeout);

    let runtime = config.stages.iter().fold(
        Docpipe::new(Arc::new(queue), executor).with_max_concurrency(config.concurrency),
        |runtime, stage| runtime.with_stage(*stage),
    );
    tracing::info!(
        stages = ?config.stages,
        concurrency = config.concurrency,
        "Worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down, waiting for running stages");
    runtime
        .graceful_shutdown()
        .await
        .context("Worker did not shut down cleanly")?;
    Ok(())
}
