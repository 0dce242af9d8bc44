use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub approval: ApprovalConfig,
    pub notifications: NotificationsConfig,
    pub uploads: UploadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// ISO 4217 code stamped on new orders
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String { "PKR".to_string() }

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Postgres,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    /// JSON snapshot file for the local backend. Absent means memory only.
    pub snapshot_path: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    #[serde(default = "default_queue_prefix")]
    pub key_prefix: String,
}

fn default_queue_prefix() -> String { "tally:jobs".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApprovalConfig {
    pub token_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    pub admin_email: String,
    pub admin_origin: String,
    /// Base used to build the approve/reject links mailed to the admin.
    pub public_base_url: String,
}

fn default_token_ttl_hours() -> i64 { 24 }

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    #[serde(default = "default_email_concurrency")]
    pub email_concurrency: usize,
    #[serde(default = "default_whatsapp_concurrency")]
    pub whatsapp_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub email: EmailProviderConfig,
    pub whatsapp: WhatsAppProviderConfig,
}

fn default_email_concurrency() -> usize { 5 }
fn default_whatsapp_concurrency() -> usize { 3 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_backoff_ms() -> u64 { 2_000 }
fn default_max_backoff_ms() -> u64 { 300_000 }
fn default_visibility_timeout_secs() -> u64 { 60 }
fn default_poll_interval_ms() -> u64 { 500 }

#[derive(Debug, Deserialize, Clone)]
pub struct EmailProviderConfig {
    pub endpoint: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WhatsAppProviderConfig {
    pub endpoint: String,
    pub access_token: String,
    pub phone_number_id: String,
    #[serde(default = "default_template_language")]
    pub template_language: String,
}

fn default_template_language() -> String { "en".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    pub max_bytes: usize,
    pub allowed_extensions: Vec<String>,
    pub rate_limit_attempts: i64,
    pub rate_limit_window_secs: i64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Environment overlay is optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TALLY__STORAGE__BACKEND=postgres`
            .add_source(config::Environment::with_prefix("TALLY").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
