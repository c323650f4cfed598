//! Configuration loading for the follow-up service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `LOOM_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "LOOM_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `LOOM_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub providers: ProviderConfig,
    #[serde(default)]
    pub drafts: DraftConfig,
}

/// Dispatch worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    /// Seconds between dispatch passes (default: 300)
    ///
    /// Environment variable: `LOOM_WORKER_TICK_INTERVAL_SECONDS`
    #[serde(default = "default_worker_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Maximum number of due jobs picked up per pass (default: 50)
    ///
    /// Environment variable: `LOOM_WORKER_BATCH_SIZE`
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: u64,

    /// Upper bound on a single provider call (default: 30)
    ///
    /// Environment variable: `LOOM_WORKER_SEND_TIMEOUT_SECONDS`
    #[serde(default = "default_worker_send_timeout_seconds")]
    pub send_timeout_seconds: u64,

    /// Age after which an unreleased dispatch claim is reported (default: 900)
    ///
    /// Environment variable: `LOOM_WORKER_STALE_CLAIM_SECONDS`
    #[serde(default = "default_worker_stale_claim_seconds")]
    pub stale_claim_seconds: u64,

    /// Run the dispatch loop inside the API process (default: false)
    ///
    /// Environment variable: `LOOM_WORKER_EMBEDDED`
    #[serde(default)]
    pub embedded: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_worker_tick_interval_seconds(),
            batch_size: default_worker_batch_size(),
            send_timeout_seconds: default_worker_send_timeout_seconds(),
            stale_claim_seconds: default_worker_stale_claim_seconds(),
            embedded: false,
        }
    }
}

impl WorkerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }

    /// Validate worker configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3600).contains(&self.tick_interval_seconds) {
            return Err(ConfigError::InvalidWorkerTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        if !(1..=500).contains(&self.batch_size) {
            return Err(ConfigError::InvalidWorkerBatchSize {
                value: self.batch_size,
            });
        }
        if !(1..=300).contains(&self.send_timeout_seconds) {
            return Err(ConfigError::InvalidWorkerSendTimeout {
                value: self.send_timeout_seconds,
            });
        }
        if self.stale_claim_seconds < self.send_timeout_seconds {
            return Err(ConfigError::InvalidWorkerStaleClaim {
                value: self.stale_claim_seconds,
                send_timeout: self.send_timeout_seconds,
            });
        }
        Ok(())
    }
}

/// Email provider endpoints and OAuth client credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProviderConfig {
    /// Environment variable: `LOOM_RESEND_API_BASE`
    #[serde(default = "default_resend_api_base")]
    pub resend_api_base: String,
    /// Environment variable: `LOOM_GMAIL_API_BASE`
    #[serde(default = "default_gmail_api_base")]
    pub gmail_api_base: String,
    /// Environment variable: `LOOM_GOOGLE_TOKEN_URL`
    #[serde(default = "default_google_token_url")]
    pub google_token_url: String,
    /// Environment variable: `LOOM_GOOGLE_CLIENT_ID`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_id: Option<String>,
    /// Environment variable: `LOOM_GOOGLE_CLIENT_SECRET`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_secret: Option<String>,
    /// Sender display name used when a connection has none.
    ///
    /// Environment variable: `LOOM_DEFAULT_FROM_NAME`
    #[serde(default = "default_from_name")]
    pub default_from_name: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            resend_api_base: default_resend_api_base(),
            gmail_api_base: default_gmail_api_base(),
            google_token_url: default_google_token_url(),
            google_client_id: None,
            google_client_secret: None,
            default_from_name: default_from_name(),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("RESEND_API_BASE", &self.resend_api_base),
            ("GMAIL_API_BASE", &self.gmail_api_base),
            ("GOOGLE_TOKEN_URL", &self.google_token_url),
        ] {
            validate_url(field, value)?;
        }
        Ok(())
    }
}

/// AI draft generation endpoint. Drafting is disabled when no API key is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DraftConfig {
    /// Environment variable: `LOOM_DRAFTS_API_BASE`
    #[serde(default = "default_drafts_api_base")]
    pub api_base: String,
    /// Environment variable: `LOOM_DRAFTS_API_KEY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable: `LOOM_DRAFTS_MODEL`
    #[serde(default = "default_drafts_model")]
    pub model: String,
    /// Environment variable: `LOOM_DRAFTS_TIMEOUT_SECONDS`
    #[serde(default = "default_drafts_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for DraftConfig {
    fn default() -> Self {
        Self {
            api_base: default_drafts_api_base(),
            api_key: None,
            model: default_drafts_model(),
            timeout_seconds: default_drafts_timeout_seconds(),
        }
    }
}

impl DraftConfig {
    pub fn is_enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("DRAFTS_API_BASE", &self.api_base)?;
        if self.model.trim().is_empty() {
            return Err(ConfigError::MissingDraftsModel);
        }
        if !(1..=120).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidDraftsTimeout {
                value: self.timeout_seconds,
            });
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            cors_allowed_origins: Vec::new(),
            worker: WorkerConfig::default(),
            providers: ProviderConfig::default(),
            drafts: DraftConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(REDACTED.as_bytes().to_vec());
        }
        if config.providers.google_client_secret.is_some() {
            config.providers.google_client_secret = Some(REDACTED.to_string());
        }
        if config.drafts.api_key.is_some() {
            config.drafts.api_key = Some(REDACTED.to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.worker.validate()?;
        self.providers.validate()?;
        self.drafts.validate()?;

        Ok(())
    }
}

fn validate_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
            source,
        })
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/followups".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_worker_tick_interval_seconds() -> u64 {
    300 // 5 minutes
}

fn default_worker_batch_size() -> u64 {
    50
}

fn default_worker_send_timeout_seconds() -> u64 {
    30
}

fn default_worker_stale_claim_seconds() -> u64 {
    900 // 15 minutes
}

fn default_resend_api_base() -> String {
    "https://api.resend.com".to_string()
}

fn default_gmail_api_base() -> String {
    "https://gmail.googleapis.com".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_from_name() -> String {
    "Project Loom".to_string()
}

fn default_drafts_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_drafts_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_drafts_timeout_seconds() -> u64 {
    30
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("no operator tokens configured; set LOOM_OPERATOR_TOKEN or LOOM_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("crypto key is missing; set LOOM_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("invalid {field} url '{value}': {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("worker tick interval must be between 1 and 3600 seconds, got {value}")]
    InvalidWorkerTickInterval { value: u64 },
    #[error("worker batch size must be between 1 and 500, got {value}")]
    InvalidWorkerBatchSize { value: u64 },
    #[error("worker send timeout must be between 1 and 300 seconds, got {value}")]
    InvalidWorkerSendTimeout { value: u64 },
    #[error(
        "worker stale claim threshold ({value}s) must not be shorter than the send timeout ({send_timeout}s)"
    )]
    InvalidWorkerStaleClaim { value: u64, send_timeout: u64 },
    #[error("drafts model must not be empty")]
    MissingDraftsModel,
    #[error("drafts timeout must be between 1 and 120 seconds, got {value}")]
    InvalidDraftsTimeout { value: u64 },
}

/// Loads configuration using layered `.env` files and `LOOM_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`
    /// and finally the process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = take_string(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = match take_string(&mut layered, "CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let cors_allowed_origins = layered
            .remove("CORS_ALLOWED_ORIGINS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let worker = WorkerConfig {
            tick_interval_seconds: take_parsed(&mut layered, "WORKER_TICK_INTERVAL_SECONDS")
                .unwrap_or_else(default_worker_tick_interval_seconds),
            batch_size: take_parsed(&mut layered, "WORKER_BATCH_SIZE")
                .unwrap_or_else(default_worker_batch_size),
            send_timeout_seconds: take_parsed(&mut layered, "WORKER_SEND_TIMEOUT_SECONDS")
                .unwrap_or_else(default_worker_send_timeout_seconds),
            stale_claim_seconds: take_parsed(&mut layered, "WORKER_STALE_CLAIM_SECONDS")
                .unwrap_or_else(default_worker_stale_claim_seconds),
            embedded: take_parsed(&mut layered, "WORKER_EMBEDDED").unwrap_or(false),
        };

        let providers = ProviderConfig {
            resend_api_base: take_string(&mut layered, "RESEND_API_BASE")
                .unwrap_or_else(default_resend_api_base),
            gmail_api_base: take_string(&mut layered, "GMAIL_API_BASE")
                .unwrap_or_else(default_gmail_api_base),
            google_token_url: take_string(&mut layered, "GOOGLE_TOKEN_URL")
                .unwrap_or_else(default_google_token_url),
            google_client_id: take_string(&mut layered, "GOOGLE_CLIENT_ID"),
            google_client_secret: take_string(&mut layered, "GOOGLE_CLIENT_SECRET"),
            default_from_name: take_string(&mut layered, "DEFAULT_FROM_NAME")
                .unwrap_or_else(default_from_name),
        };

        let drafts = DraftConfig {
            api_base: take_string(&mut layered, "DRAFTS_API_BASE")
                .unwrap_or_else(default_drafts_api_base),
            api_key: take_string(&mut layered, "DRAFTS_API_KEY"),
            model: take_string(&mut layered, "DRAFTS_MODEL").unwrap_or_else(default_drafts_model),
            timeout_seconds: take_parsed(&mut layered, "DRAFTS_TIMEOUT_SECONDS")
                .unwrap_or_else(default_drafts_timeout_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            crypto_key,
            cors_allowed_origins,
            worker,
            providers,
            drafts,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(values: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    values.remove(key).and_then(|v| v.trim().parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
