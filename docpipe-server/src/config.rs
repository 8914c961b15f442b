use std::{env, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use chrono::TimeDelta;
use dotenvy::dotenv;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub worker_secret: String,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_namespace: String,
    pub stream_interval: Duration,
    pub expose_internal_errors: bool,
    pub notify_url: Option<String>,
    pub stale_job_schedule: Option<cron::Schedule>,
    pub stale_job_max_age: TimeDelta,
}

impl Config {
    const MIN_STREAM_INTERVAL_MS: u64 = 1000;
    const MAX_STREAM_INTERVAL_MS: u64 = 2000;

    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| var(key).filter(|value| !value.trim().is_empty());

        let stream_interval_ms: u64 = parse_or(&var, "STREAM_INTERVAL_MS", 1500)?;
        let stale_job_max_age_secs: i64 = parse_or(&var, "STALE_JOB_MAX_AGE_SECS", 1800)?;

        Ok(Self {
            port: parse_or(&var, "PORT", 8080)?,
            worker_secret: var("WORKER_SECRET").context("WORKER_SECRET must be set")?,
            jwt_secret: var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_issuer: var("JWT_ISSUER"),
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            redis_namespace: var("REDIS_NAMESPACE")
                .unwrap_or_else(|| docpipe_redis::RedisQueue::DEFAULT_NAMESPACE.to_owned()),
            stream_interval: Duration::from_millis(stream_interval_ms.clamp(
                Self::MIN_STREAM_INTERVAL_MS,
                Self::MAX_STREAM_INTERVAL_MS,
            )),
            expose_internal_errors: parse_or(&var, "EXPOSE_INTERNAL_ERRORS", false)?,
            notify_url: var("NOTIFY_URL"),
            stale_job_schedule: var("STALE_JOB_SCHEDULE")
                .map(|expression| cron::Schedule::from_str(&expression))
                .transpose()
                .context("STALE_JOB_SCHEDULE must be a valid cron expression")?,
            stale_job_max_age: TimeDelta::try_seconds(stale_job_max_age_secs)
                .filter(|age| *age > TimeDelta::zero())
                .context("STALE_JOB_MAX_AGE_SECS must be a positive number of seconds")?,
        })
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{key} is not valid: {value}")),
        None => Ok(default),
    }
}
