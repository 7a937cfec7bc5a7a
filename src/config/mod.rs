//! Service configuration.
//!
//! Settings are layered: built-in defaults, then optional
//! `config/{default,RUN_MODE}` files, then environment variables. The
//! recognized environment keys are the flat names the deployment uses
//! (`DATABASE_URL`, `REDIS_HOST`, `SMTP_HOST`, `ACCOUNT_SID`, ...), applied
//! explicitly after the file layers so they always win.

use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS origin for the dashboard
    #[serde(default)]
    pub frontend_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent workers in the pool
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Pool-wide rate limit: at most `rate_limit_max` jobs per window
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Idle sleep between empty queue polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Hard timeout on a single adapter call
    #[serde(default = "default_adapter_timeout")]
    pub adapter_timeout_seconds: u64,
    /// A `processing` row older than this is considered stalled
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_minutes: i64,
    /// Stall sweeper cadence
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Grace period for in-flight jobs on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Redis key prefix for the notifications queue
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PushConfig {
    pub project_id: Option<String>,
    /// Service-account key material as a JSON string
    pub service_account_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SlackConfig {
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_database_url() -> String {
    "postgres://localhost:5432/courier".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_concurrency() -> usize {
    10
}

fn default_rate_limit_max() -> u32 {
    100
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_adapter_timeout() -> u64 {
    30
}

fn default_stall_threshold() -> i64 {
    30
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_queue_prefix() -> String {
    "courier:notifications".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            frontend_url: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            adapter_timeout_seconds: default_adapter_timeout(),
            stall_threshold_minutes: default_stall_threshold(),
            sweep_interval_seconds: default_sweep_interval(),
            shutdown_grace_seconds: default_shutdown_grace(),
            queue_prefix: default_queue_prefix(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut settings: Settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .build()?
            .try_deserialize()?;

        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Apply the deployment's flat environment keys on top of file layers.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = env::var("FRONTEND_URL") {
            self.server.frontend_url = Some(v);
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = env::var("REDIS_HOST") {
            self.redis.host = v;
        }
        if let Ok(v) = env::var("REDIS_PORT") {
            if let Ok(port) = v.parse() {
                self.redis.port = port;
            }
        }
        if let Ok(v) = env::var("REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }
        if let Ok(v) = env::var("SMTP_HOST") {
            self.smtp.host = Some(v);
        }
        if let Ok(v) = env::var("SMTP_PORT") {
            if let Ok(port) = v.parse() {
                self.smtp.port = port;
            }
        }
        if let Ok(v) = env::var("SMTP_SECURE") {
            self.smtp.secure = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("SMTP_USER") {
            self.smtp.user = Some(v);
        }
        if let Ok(v) = env::var("SMTP_PASS") {
            self.smtp.pass = Some(v);
        }
        if let Ok(v) = env::var("SMTP_FROM") {
            self.smtp.from = Some(v);
        }
        if let Ok(v) = env::var("ACCOUNT_SID") {
            self.sms.account_sid = Some(v);
        }
        if let Ok(v) = env::var("AUTH_TOKEN") {
            self.sms.auth_token = Some(v);
        }
        if let Ok(v) = env::var("PHONE_NUMBER") {
            self.sms.phone_number = Some(v);
        }
        if let Ok(v) = env::var("PROJECT_ID") {
            self.push.project_id = Some(v);
        }
        if let Ok(v) = env::var("SERVICE_ACCOUNT_KEY") {
            self.push.service_account_key = Some(v);
        }
        if let Ok(v) = env::var("SLACK_BOT_TOKEN") {
            self.slack.bot_token = Some(v);
        }
        if let Ok(v) = env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(v);
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 3001);

        let worker = WorkerConfig::default();
        assert_eq!(worker.concurrency, 10);
        assert_eq!(worker.rate_limit_max, 100);
        assert_eq!(worker.rate_limit_window_ms, 60_000);
        assert_eq!(worker.stall_threshold_minutes, 30);
        assert_eq!(worker.sweep_interval_seconds, 30);
    }

    #[test]
    fn test_redis_url_with_and_without_password() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379");

        redis.password = Some("secret".to_string());
        assert_eq!(redis.url(), "redis://:secret@127.0.0.1:6379");
    }
}
