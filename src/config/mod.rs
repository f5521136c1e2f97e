//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "hearth";
const ENV_PREFIX: &str = "HEARTH";
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_CACHE_SWR_SECS: u64 = 0;
const DEFAULT_TAG_INDEX_PREFIX: &str = "cache:tag:";
const DEFAULT_COALESCE_WINDOW_MS: u64 = 10;
const DEFAULT_COALESCE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_COALESCE_MAX_REF_COUNT: u32 = 100;
const DEFAULT_COALESCE_CLEANUP_DELAY_MS: u64 = 100;
const DEFAULT_LOCK_TTL_SECS: u64 = 30;
const DEFAULT_LOCK_WAIT_MS: u64 = 5000;
const DEFAULT_LOCK_RETRIES: u32 = 1;
const DEFAULT_LOCK_PREFIX: &str = "lock:";
const DEFAULT_BATCH_MAX_SIZE: usize = 100;
const DEFAULT_BATCH_MAX_WAIT_MS: u64 = 50;
const DEFAULT_BATCH_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_BATCH_RETRY_DELAY_MS: u64 = 100;

/// Command-line arguments for the Hearth binary.
#[derive(Debug, Parser)]
#[command(
    name = "hearth",
    version,
    about = "Request orchestration toolkit: tagged cache, coalescing and batching"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HEARTH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache → coalesce → batch scenario against the configured store.
    Demo(DemoArgs),
    /// Print the canonical cache key for a base and parameters.
    Key(KeyArgs),
    /// Invalidate every cache entry written with a tag.
    Invalidate(InvalidateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct DemoArgs {
    /// Concurrent callers asking for the same key.
    #[arg(long, default_value_t = 8)]
    pub callers: usize,

    /// Distinct keys requested by the callers.
    #[arg(long, default_value_t = 3)]
    pub keys: usize,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            callers: 8,
            keys: 3,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// Key base, e.g. `recipes`.
    #[arg(value_name = "BASE")]
    pub base: String,

    /// Parameters as `name=value`; order does not matter.
    #[arg(value_name = "PARAM", value_parser = parse_param)]
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[arg(value_name = "TAG")]
    pub tag: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the shared store backend (memory|redis).
    #[arg(long = "store-backend", value_name = "BACKEND", global = true)]
    pub store_backend: Option<String>,

    /// Override the shared store URL.
    #[arg(long = "store-url", value_name = "URL", global = true)]
    pub store_url: Option<String>,

    /// Override the default cache TTL.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS", global = true)]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the maximum batch size.
    #[arg(long = "batch-max-size", value_name = "COUNT", global = true)]
    pub batch_max_size: Option<usize>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected `name=value`, got `{raw}`")),
    }
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub coalesce: CoalesceSettings,
    pub batch: BatchSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend `{other}` (expected memory|redis)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub stale_while_revalidate: Duration,
    pub tag_index_prefix: String,
}

#[derive(Debug, Clone)]
pub struct CoalesceSettings {
    pub window_ms: u64,
    pub timeout_ms: u64,
    pub max_ref_count: NonZeroU32,
    pub cleanup_delay_ms: u64,
    pub lock_ttl_secs: NonZeroU64,
    pub lock_wait_ms: u64,
    pub lock_retries: u32,
    pub lock_prefix: String,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_batch_size: NonZeroUsize,
    pub max_wait_ms: u64,
    pub retry_attempts: NonZeroU32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    cache: RawCacheSettings,
    coalesce: RawCoalesceSettings,
    batch: RawBatchSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_secs = Some(ttl);
        }
        if let Some(size) = overrides.batch_max_size {
            self.batch.max_batch_size = Some(size);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            store,
            cache,
            coalesce,
            batch,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            cache: build_cache_settings(cache)?,
            coalesce: build_coalesce_settings(coalesce)?,
            batch: build_batch_settings(batch)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };
    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = match store.backend {
        Some(value) => StoreBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("store.backend", reason))?,
        None => StoreBackend::Memory,
    };
    let url = store.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if backend == StoreBackend::Redis && url.is_none() {
        return Err(LoadError::invalid(
            "store.url",
            "the redis backend requires a connection URL",
        ));
    }
    Ok(StoreSettings { backend, url })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl = cache.ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    let swr = cache
        .stale_while_revalidate_secs
        .unwrap_or(DEFAULT_CACHE_SWR_SECS);
    let tag_index_prefix = cache
        .tag_index_prefix
        .unwrap_or_else(|| DEFAULT_TAG_INDEX_PREFIX.to_string());
    if tag_index_prefix.is_empty() {
        return Err(LoadError::invalid(
            "cache.tag_index_prefix",
            "prefix must not be empty",
        ));
    }
    Ok(CacheSettings {
        ttl: Duration::from_secs(ttl),
        stale_while_revalidate: Duration::from_secs(swr),
        tag_index_prefix,
    })
}

fn build_coalesce_settings(coalesce: RawCoalesceSettings) -> Result<CoalesceSettings, LoadError> {
    let max_ref_count = coalesce
        .max_ref_count
        .unwrap_or(DEFAULT_COALESCE_MAX_REF_COUNT);
    let lock_ttl_secs = coalesce.lock_ttl_secs.unwrap_or(DEFAULT_LOCK_TTL_SECS);
    let lock_prefix = coalesce
        .lock_prefix
        .unwrap_or_else(|| DEFAULT_LOCK_PREFIX.to_string());
    if lock_prefix.is_empty() {
        return Err(LoadError::invalid(
            "coalesce.lock_prefix",
            "prefix must not be empty",
        ));
    }

    Ok(CoalesceSettings {
        window_ms: coalesce.window_ms.unwrap_or(DEFAULT_COALESCE_WINDOW_MS),
        timeout_ms: coalesce.timeout_ms.unwrap_or(DEFAULT_COALESCE_TIMEOUT_MS),
        max_ref_count: NonZeroU32::new(max_ref_count).ok_or_else(|| {
            LoadError::invalid("coalesce.max_ref_count", "must be greater than zero")
        })?,
        cleanup_delay_ms: coalesce
            .cleanup_delay_ms
            .unwrap_or(DEFAULT_COALESCE_CLEANUP_DELAY_MS),
        lock_ttl_secs: NonZeroU64::new(lock_ttl_secs).ok_or_else(|| {
            LoadError::invalid("coalesce.lock_ttl_secs", "must be greater than zero")
        })?,
        lock_wait_ms: coalesce.lock_wait_ms.unwrap_or(DEFAULT_LOCK_WAIT_MS),
        lock_retries: coalesce.lock_retries.unwrap_or(DEFAULT_LOCK_RETRIES),
        lock_prefix,
    })
}

fn build_batch_settings(batch: RawBatchSettings) -> Result<BatchSettings, LoadError> {
    let max_batch_size = batch.max_batch_size.unwrap_or(DEFAULT_BATCH_MAX_SIZE);
    let retry_attempts = batch.retry_attempts.unwrap_or(DEFAULT_BATCH_RETRY_ATTEMPTS);
    Ok(BatchSettings {
        max_batch_size: NonZeroUsize::new(max_batch_size).ok_or_else(|| {
            LoadError::invalid("batch.max_batch_size", "must be greater than zero")
        })?,
        max_wait_ms: batch.max_wait_ms.unwrap_or(DEFAULT_BATCH_MAX_WAIT_MS),
        retry_attempts: NonZeroU32::new(retry_attempts).ok_or_else(|| {
            LoadError::invalid("batch.retry_attempts", "must be greater than zero")
        })?,
        retry_delay_ms: batch.retry_delay_ms.unwrap_or(DEFAULT_BATCH_RETRY_DELAY_MS),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    ttl_secs: Option<u64>,
    stale_while_revalidate_secs: Option<u64>,
    tag_index_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCoalesceSettings {
    window_ms: Option<u64>,
    timeout_ms: Option<u64>,
    max_ref_count: Option<u32>,
    cleanup_delay_ms: Option<u64>,
    lock_ttl_secs: Option<u64>,
    lock_wait_ms: Option<u64>,
    lock_retries: Option<u32>,
    lock_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBatchSettings {
    max_batch_size: Option<usize>,
    max_wait_ms: Option<u64>,
    retry_attempts: Option<u32>,
    retry_delay_ms: Option<u64>,
}

/// Parse process arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
