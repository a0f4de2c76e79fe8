//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{
    CacheOverrides, CliArgs, Command, DatabaseOverride, InvalidateArgs, MaintenanceArgs,
    MigrateArgs, ServeArgs, ServeOverrides,
};

use crate::cache::DEFAULT_CACHE_DURATION_SECS;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagecache";
const ENV_PREFIX: &str = "PAGECACHE";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CACHE_DIRECTORY: &str = "storage/runtime/pagecache";
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONSUME_BATCH_LIMIT: u64 = 100;
const DEFAULT_ADMIN_PREFIX: &str = "/admin";
const DEFAULT_ACTION_PREFIX: &str = "/actions/";
const DEFAULT_ACTION_PARAM: &str = "action";
const DEFAULT_PREVIEW_PARAM: &str = "preview";
const DEFAULT_PREVIEW_HEADER: &str = "x-preview";
const DEFAULT_SITE_HEADER: &str = "x-site-id";
const DEFAULT_SITE_ID: i32 = 1;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub routing: RoutingSettings,
    pub host: HostSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
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

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

/// Where entry metadata and dependency links live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    /// Durable, shared by every process pointing at the same database.
    Postgres,
    /// Process-local; lost on restart.
    Memory,
}

impl FromStr for IndexBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown index backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub force_on: bool,
    pub duration: NonZeroU64,
    pub directory: PathBuf,
    pub index: IndexBackend,
    pub auto_consume_interval_ms: u64,
    pub consume_batch_limit: usize,
    pub sweep_interval: Option<Duration>,
}

impl CacheSettings {
    /// A one-shot command only sees entries written by the server when the
    /// index is shared; a memory index starts empty in every process.
    pub fn require_shared_index(&self, command: &'static str) -> Result<(), LoadError> {
        match self.index {
            IndexBackend::Postgres => Ok(()),
            IndexBackend::Memory => Err(LoadError::invalid(
                "cache.index",
                format!("`{command}` needs the postgres index to reach the server's entries"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub admin_prefix: String,
    pub action_prefix: String,
    pub action_param: String,
    pub preview_param: String,
    pub preview_header: String,
    pub site_header: String,
    pub default_site_id: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct HostSettings {
    pub dev_mode: bool,
    pub system_on: bool,
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

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Flush(args)) | Some(Command::Sweep(args)) => {
            raw.apply_maintenance_overrides(args)
        }
        Some(Command::Invalidate(args)) => raw.apply_maintenance_overrides(&args.maintenance),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    routing: RawRoutingSettings,
    host: RawHostSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(force_on) = overrides.cache_force_on {
            self.cache.force_on = Some(force_on);
        }
        if let Some(seconds) = overrides.cache_sweep_interval_seconds {
            self.cache.sweep_interval_seconds = Some(seconds);
        }

        self.apply_database_override(&overrides.database);
        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_maintenance_overrides(&mut self, args: &MaintenanceArgs) {
        self.apply_database_override(&args.database);
        self.apply_cache_overrides(&args.cache);
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(directory) = overrides.directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(seconds) = overrides.duration_secs {
            self.cache.duration_secs = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            cache,
            routing,
            host,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
            routing: build_routing_settings(routing)?,
            host: build_host_settings(host),
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
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

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let duration_secs = cache.duration_secs.unwrap_or(DEFAULT_CACHE_DURATION_SECS);
    let duration = NonZeroU64::new(duration_secs)
        .ok_or_else(|| LoadError::invalid("cache.duration_secs", "must be greater than zero"))?;

    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIRECTORY));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.directory", "must not be empty"));
    }

    let index = match cache.index {
        Some(value) => IndexBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("cache.index", reason))?,
        None => IndexBackend::Postgres,
    };

    let auto_consume_interval_ms = cache
        .auto_consume_interval_ms
        .unwrap_or(DEFAULT_AUTO_CONSUME_INTERVAL_MS);
    if auto_consume_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.auto_consume_interval_ms",
            "must be greater than zero",
        ));
    }

    let batch_limit = cache
        .consume_batch_limit
        .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT);
    if batch_limit == 0 {
        return Err(LoadError::invalid(
            "cache.consume_batch_limit",
            "must be greater than zero",
        ));
    }
    let consume_batch_limit = usize::try_from(batch_limit).map_err(|_| {
        LoadError::invalid(
            "cache.consume_batch_limit",
            "value exceeds supported range for usize",
        )
    })?;

    let sweep_interval = cache
        .sweep_interval_seconds
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs);

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        force_on: cache.force_on.unwrap_or(false),
        duration,
        directory,
        index,
        auto_consume_interval_ms,
        consume_batch_limit,
        sweep_interval,
    })
}

fn build_routing_settings(routing: RawRoutingSettings) -> Result<RoutingSettings, LoadError> {
    let admin_prefix = routing
        .admin_prefix
        .unwrap_or_else(|| DEFAULT_ADMIN_PREFIX.to_string());
    if !admin_prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "routing.admin_prefix",
            "must start with `/`",
        ));
    }

    let action_prefix = routing
        .action_prefix
        .unwrap_or_else(|| DEFAULT_ACTION_PREFIX.to_string());
    if !action_prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "routing.action_prefix",
            "must start with `/`",
        ));
    }

    Ok(RoutingSettings {
        admin_prefix,
        action_prefix,
        action_param: routing
            .action_param
            .unwrap_or_else(|| DEFAULT_ACTION_PARAM.to_string()),
        preview_param: routing
            .preview_param
            .unwrap_or_else(|| DEFAULT_PREVIEW_PARAM.to_string()),
        preview_header: routing
            .preview_header
            .unwrap_or_else(|| DEFAULT_PREVIEW_HEADER.to_string())
            .to_ascii_lowercase(),
        site_header: routing
            .site_header
            .unwrap_or_else(|| DEFAULT_SITE_HEADER.to_string())
            .to_ascii_lowercase(),
        default_site_id: routing.default_site_id.unwrap_or(DEFAULT_SITE_ID),
    })
}

fn build_host_settings(host: RawHostSettings) -> HostSettings {
    HostSettings {
        dev_mode: host.dev_mode.unwrap_or(false),
        system_on: host.system_on.unwrap_or(true),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    admin_host: Option<String>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    force_on: Option<bool>,
    duration_secs: Option<u64>,
    directory: Option<PathBuf>,
    index: Option<String>,
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRoutingSettings {
    admin_prefix: Option<String>,
    action_prefix: Option<String>,
    action_param: Option<String>,
    preview_param: Option<String>,
    preview_header: Option<String>,
    site_header: Option<String>,
    default_site_id: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHostSettings {
    dev_mode: Option<bool>,
    system_on: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
