//! Gateway configuration.
//!
//! Values come from the command line or the environment, falling back to an optional
//! TOML file (`--config-file` / `CONFIG_FILE`), falling back to the defaults below.

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::{
    client_events::session::SessionSettings,
    transport::CacheLimits,
};

/// Default port of the websocket API.
pub const DEFAULT_WS_API_PORT: u16 = 3000;

/// Default time a client gets to answer a `signDigest` request.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between sweeps of expired pooled channels.
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub const fn default_listening_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Controls how much error detail reaches clients.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Error replies carry the full cause chain.
    Development,
    /// Error replies carry a generic message only.
    #[default]
    Production,
}

impl Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Development => write!(f, "development"),
            OperationMode::Production => write!(f, "production"),
        }
    }
}

#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
#[command(name = "fabric-ws-gateway", version, about = "JSON-RPC over WebSocket gateway to a Fabric network")]
pub struct ConfigArgs {
    /// Error detail exposed to clients, default is production
    #[arg(long, value_enum, env = "MODE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<OperationMode>,

    #[command(flatten)]
    #[serde(flatten)]
    pub ws_api: WebsocketApiArgs,

    #[command(flatten)]
    #[serde(flatten)]
    pub cache: CacheArgs,

    /// Seconds a client gets to answer a signing request (default is 30)
    #[arg(long, env = "SIGN_TIMEOUT_SECONDS")]
    #[serde(rename = "sign-timeout-seconds", skip_serializing_if = "Option::is_none")]
    pub sign_timeout_seconds: Option<u64>,

    /// Default log level, `RUST_LOG` overrides it
    #[arg(long, env = "LOG_LEVEL")]
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// TOML file providing values not given on the command line or environment
    #[arg(long, env = "CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

#[derive(clap::Parser, Debug, Default, Copy, Clone, Serialize, Deserialize)]
pub struct WebsocketApiArgs {
    /// Address to bind to for the websocket API, default is 0.0.0.0
    #[arg(
        name = "ws_api_address",
        long = "ws-api-address",
        env = "WS_API_ADDRESS"
    )]
    #[serde(rename = "ws-api-address", skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,

    /// Port to expose the websocket on, default is 3000
    #[arg(long, env = "PORT")]
    #[serde(rename = "port", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(clap::Parser, Debug, Default, Copy, Clone, Serialize, Deserialize)]
pub struct CacheArgs {
    /// Maximum number of pooled channels to endorsing nodes (default is 32)
    #[arg(long, env = "CACHE_MAX_ENTRIES")]
    #[serde(rename = "cache-max-entries", skip_serializing_if = "Option::is_none")]
    pub cache_max_entries: Option<usize>,

    /// Maximum lifetime of a pooled channel in seconds (default is 600)
    #[arg(long, env = "CACHE_MAX_AGE_SECONDS")]
    #[serde(rename = "cache-max-age-seconds", skip_serializing_if = "Option::is_none")]
    pub cache_max_age_seconds: Option<u64>,

    /// Seconds between sweeps of expired channels (default is 60)
    #[arg(long, env = "CACHE_SWEEP_INTERVAL_SECONDS")]
    #[serde(
        rename = "cache-sweep-interval-seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_sweep_interval_seconds: Option<u64>,
}

impl ConfigArgs {
    fn read_config_file(path: &Path) -> anyhow::Result<ConfigArgs> {
        tracing::debug!(path = ?path, "Reading configuration file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }

    /// Fills every value not set here with the one from `other`.
    fn merge(self, other: ConfigArgs) -> ConfigArgs {
        ConfigArgs {
            mode: self.mode.or(other.mode),
            ws_api: WebsocketApiArgs {
                address: self.ws_api.address.or(other.ws_api.address),
                port: self.ws_api.port.or(other.ws_api.port),
            },
            cache: CacheArgs {
                cache_max_entries: self.cache.cache_max_entries.or(other.cache.cache_max_entries),
                cache_max_age_seconds: self
                    .cache
                    .cache_max_age_seconds
                    .or(other.cache.cache_max_age_seconds),
                cache_sweep_interval_seconds: self
                    .cache
                    .cache_sweep_interval_seconds
                    .or(other.cache.cache_sweep_interval_seconds),
            },
            sign_timeout_seconds: self.sign_timeout_seconds.or(other.sign_timeout_seconds),
            log_level: self.log_level.or(other.log_level),
            config_file: self.config_file,
        }
    }

    /// Resolves the final configuration.
    pub fn build(self) -> anyhow::Result<Config> {
        let args = match self.config_file.clone() {
            Some(path) => {
                let file = Self::read_config_file(&path)?;
                self.merge(file)
            }
            None => self,
        };

        let log_level = args
            .log_level
            .as_deref()
            .map(str::parse::<LevelFilter>)
            .transpose()
            .context("invalid log level")?;

        let cache_defaults = CacheLimits::default();
        let max_entries = args
            .cache
            .cache_max_entries
            .unwrap_or(cache_defaults.max_entries);
        anyhow::ensure!(max_entries > 0, "cache-max-entries must be at least 1");
        let max_age = positive_secs(args.cache.cache_max_age_seconds, "cache-max-age-seconds")?
            .unwrap_or(cache_defaults.max_age);
        let cache_sweep_interval = positive_secs(
            args.cache.cache_sweep_interval_seconds,
            "cache-sweep-interval-seconds",
        )?
        .unwrap_or(DEFAULT_CACHE_SWEEP_INTERVAL);
        let sign_timeout = positive_secs(args.sign_timeout_seconds, "sign-timeout-seconds")?
            .unwrap_or(DEFAULT_SIGN_TIMEOUT);

        Ok(Config {
            mode: args.mode.unwrap_or_default(),
            ws_api: WebsocketApiConfig {
                address: args.ws_api.address.unwrap_or(default_listening_address()),
                port: args.ws_api.port.unwrap_or(DEFAULT_WS_API_PORT),
            },
            cache: CacheLimits {
                max_entries,
                max_age,
            },
            cache_sweep_interval,
            sign_timeout,
            log_level,
        })
    }
}

fn positive_secs(value: Option<u64>, name: &str) -> anyhow::Result<Option<Duration>> {
    match value {
        Some(0) => anyhow::bail!("{name} must be greater than zero"),
        other => Ok(other.map(Duration::from_secs)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebsocketApiConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl From<&WebsocketApiConfig> for SocketAddr {
    fn from(config: &WebsocketApiConfig) -> Self {
        (config.address, config.port).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: OperationMode,
    pub ws_api: WebsocketApiConfig,
    pub cache: CacheLimits,
    pub cache_sweep_interval: Duration,
    pub sign_timeout: Duration,
    pub log_level: Option<LevelFilter>,
}

impl Config {
    pub(crate) fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            mode: self.mode,
            sign_timeout: self.sign_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: OperationMode::default(),
            ws_api: WebsocketApiConfig {
                address: default_listening_address(),
                port: DEFAULT_WS_API_PORT,
            },
            cache: CacheLimits::default(),
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            log_level: None,
        }
    }
}

/// Installs the global tracing subscriber once; later calls are no-ops.
pub fn set_logger(level: Option<LevelFilter>) -> anyhow::Result<()> {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::{AtomicBool, Ordering};

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(false, true, Ordering::Release, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        crate::tracing::tracer::init_tracer(level)?;
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
    Ok(())
}
