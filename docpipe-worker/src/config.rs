use std::{env, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use docpipe::queue::Stage;
use dotenvy::dotenv;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub worker_secret: String,
    pub redis_url: String,
    pub redis_namespace: String,
    pub ocr_url: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub stage_timeout: Duration,
    pub stages: Vec<Stage>,
    pub concurrency: usize,
}

impl Config {
    pub const DEFAULT_OPENAI_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_OPENAI_MODEL: &'static str = "gpt-4o-mini";

    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| var(key).filter(|value| !value.trim().is_empty());

        let stage_timeout_secs: u64 = parse_or(&var, "STAGE_TIMEOUT_SECS", 300)?;
        if stage_timeout_secs == 0 {
            bail!("STAGE_TIMEOUT_SECS must be positive");
        }
        let concurrency: usize = parse_or(&var, "WORKER_CONCURRENCY", 1)?;
        if concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be positive");
        }

        Ok(Self {
            api_base_url: var("API_BASE_URL")
                .context("API_BASE_URL must be set")?
                .trim_end_matches('/')
                .to_owned(),
            worker_secret: var("WORKER_SECRET").context("WORKER_SECRET must be set")?,
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned()),
            redis_namespace: var("REDIS_NAMESPACE")
                .unwrap_or_else(|| docpipe_redis::RedisQueue::DEFAULT_NAMESPACE.to_owned()),
            ocr_url: var("OCR_URL").context("OCR_URL must be set")?,
            openai_api_key: var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            openai_base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| Self::DEFAULT_OPENAI_BASE_URL.to_owned())
                .trim_end_matches('/')
                .to_owned(),
            openai_model: var("OPENAI_MODEL")
                .unwrap_or_else(|| Self::DEFAULT_OPENAI_MODEL.to_owned()),
            stage_timeout: Duration::from_secs(stage_timeout_secs),
            stages: parse_stages(var("WORKER_STAGES").as_deref())?,
            concurrency,
        })
    }
}

fn parse_stages(raw: Option<&str>) -> Result<Vec<Stage>> {
    let Some(raw) = raw else {
        return Ok(Stage::ALL.to_vec());
    };
    let mut stages = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let stage: Stage = name
            .parse()
            .with_context(|| format!("WORKER_STAGES contains an unknown stage: {name}"))?;
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    if stages.is_empty() {
        bail!("WORKER_STAGES must name at least one stage");
    }
    Ok(stages)
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
