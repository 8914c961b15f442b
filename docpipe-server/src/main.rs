use std::sync::Arc;

use anyhow::{Context, Result};
use docpipe::{
    ingress::WorkerSecret,
    queue::Dispatcher,
    store::{memory::InMemoryStore, JobStore},
    sweeper::{Sweeper, SweeperConfig},
};
use docpipe_redis::RedisQueue;
use docpipe_server::{app, auth::JwtVerifier, config::Config, notifier::HttpNotifier, AppState};
use docpipe_sqlx::DocpipePgStore;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,docpipe=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to database")?;
            Arc::new(
                DocpipePgStore::from_pool(pool)
                    .await
                    .context("Failed to prepare the job store")?,
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory");
            Arc::new(InMemoryStore::new())
        }
    };

    let dispatcher = match &config.redis_url {
        Some(redis_url) => match RedisQueue::from_url(redis_url, &config.redis_namespace).await {
            Ok(queue) => Dispatcher::new(Arc::new(queue)),
            Err(error) => {
                tracing::warn!(?error, "Queue unreachable, jobs will be accepted but not queued");
                Dispatcher::disabled()
            }
        },
        None => {
            tracing::warn!("REDIS_URL not set, jobs will be accepted but not queued");
            Dispatcher::disabled()
        }
    };

    let mut state = AppState::new(
        store.clone(),
        dispatcher,
        JwtVerifier::new(&config.jwt_secret, config.jwt_issuer.as_deref()),
        WorkerSecret::new(config.worker_secret.clone()),
    )
    .with_stream_interval(config.stream_interval)
    .expose_internal_errors(config.expose_internal_errors);
    if let Some(notify_url) = &config.notify_url {
        state = state.with_notifier(Arc::new(HttpNotifier::new(notify_url.clone())));
    }

    let cancellation_token = CancellationToken::new();
    let sweeper = config.stale_job_schedule.clone().map(|schedule| {
        Sweeper::new(
            store.clone(),
            SweeperConfig::new(schedule).with_max_age(config.stale_job_max_age),
        )
        .spawn(cancellation_token.child_token())
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cancellation_token.cancel();
    if let Some(sweeper) = sweeper {
        sweeper.await.context("Job sweeper panicked")?;
    }
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
