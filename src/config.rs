#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub auth: AuthConfig,

    #[validate(nested)]
    pub database: DatabaseConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    pub amber: AmberConfig,

    #[validate(nested)]
    pub device: DeviceConfig,

    #[validate(nested)]
    pub scheduler: SchedulerConfig,

    #[validate(nested)]
    pub spike: SpikeConfig,

    #[validate(nested)]
    pub lock: LockConfig,
}

/// HTTP server configuration for the administrative surface (§6 admin routes).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub enable_cors: bool,

    #[serde(default)]
    pub enable_compression: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse socket address")
    }
}

/// Authentication for the administrative surface.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AuthConfig {
    #[validate(length(min = 32))]
    pub token: String,

    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: u64,
}

/// Administrative/history database.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub url: String,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 100))]
    pub max_connections: u32,

    #[serde(default = "default_db_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub enable_statement_logging: bool,
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Price feed configuration: which site, which forecast channel, and how
/// to reach the push (WebSocket) and pull (REST) producers.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AmberConfig {
    /// The single site this process drives (§REDESIGN: per-user generalization
    /// exists in the data model, but the source deployment is single-tenant).
    #[validate(length(min = 1))]
    pub site_id: String,

    #[validate(url)]
    pub rest_base_url: String,

    #[validate(length(min = 1))]
    pub ws_url: String,

    #[validate(length(min = 1))]
    pub api_key: String,

    #[serde(default = "default_rest_poll_interval_secs")]
    pub rest_poll_interval_secs: u64,

    #[serde(default = "default_ws_ping_interval_secs")]
    pub ws_ping_interval_secs: u64,

    #[serde(default = "default_ws_ping_timeout_secs")]
    pub ws_ping_timeout_secs: u64,

    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: i64,

    #[serde(default = "default_sync_cooldown_secs")]
    pub sync_cooldown_secs: u64,
}

/// Which backend reaches the battery controller: a direct vendor API, or a
/// brokered proxy service that already holds the vendor credentials.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBackend {
    Direct,
    Proxy,
}

fn default_device_backend() -> DeviceBackend {
    DeviceBackend::Direct
}

/// Battery controller connection configuration (C2).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DeviceConfig {
    #[serde(default = "default_device_backend")]
    pub backend: DeviceBackend,

    #[validate(url)]
    pub base_url: String,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Per-job periodicity for the scheduler (C9).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    #[validate(range(min = 1, max = 3600))]
    pub sync_interval_secs: u64,

    #[validate(range(min = 1, max = 3600))]
    pub curtailment_interval_secs: u64,

    #[validate(range(min = 1, max = 3600))]
    pub spike_check_interval_secs: u64,

    #[validate(range(min = 1, max = 3600))]
    pub demand_check_interval_secs: u64,

    #[serde(default = "default_startup_stagger_min_ms")]
    pub startup_stagger_min_ms: u64,

    #[serde(default = "default_startup_stagger_max_ms")]
    pub startup_stagger_max_ms: u64,
}

/// Spike-response timings (C7). The multiplier and threshold live on
/// `UserPolicy` since they're per-user; these are process-wide waits.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SpikeConfig {
    #[serde(default = "default_spike_enter_wait_secs")]
    pub enter_wait_secs: u64,

    #[serde(default = "default_spike_exit_wait_secs")]
    pub exit_wait_secs: u64,
}

/// Process-wide singleton file locks (§5).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LockConfig {
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

fn default_max_connections() -> usize { 1000 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_token_expiry_hours() -> u64 { 24 }
fn default_db_max_connections() -> u32 { 10 }
fn default_db_timeout_secs() -> u64 { 30 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_rest_poll_interval_secs() -> u64 { 60 }
fn default_ws_ping_interval_secs() -> u64 { 30 }
fn default_ws_ping_timeout_secs() -> u64 { 10 }
fn default_max_staleness_secs() -> i64 { 10 }
fn default_sync_cooldown_secs() -> u64 { 60 }
fn default_http_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_startup_stagger_min_ms() -> u64 { 100 }
fn default_startup_stagger_max_ms() -> u64 { 500 }
fn default_spike_enter_wait_secs() -> u64 { 30 }
fn default_spike_exit_wait_secs() -> u64 { 60 }
fn default_lock_dir() -> PathBuf { PathBuf::from("/tmp/open-energy-controller") }

impl AppConfig {
    /// Loads configuration from TOML files and environment variables.
    ///
    /// Order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/<environment>.toml`, or `config/development.toml` when no
    ///    environment is given
    /// 3. Environment variables prefixed `OEC__`, double-underscore nested
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        } else {
            figment = figment.merge(Toml::file("config/development.toml").nested());
        }

        figment = figment.merge(Env::prefixed("OEC__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;
        config.validate().context("configuration validation failed")?;
        Ok(config)
    }

    pub fn validate_config(self) -> Result<Self> {
        self.validate().context("configuration validation failed")?;
        Ok(self)
    }
}

pub type Config = AppConfig;
