//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`) and environment.
//! Every section is optional; a missing file yields the defaults.

use crate::api::Credentials;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Admin gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Platform endpoints and OAuth client.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Shared challenge store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Queue, cadence and timeout tuning.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Managed agents, one entry per chat identity.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Activation pattern for agents that do not set their own.
    #[serde(default)]
    pub default_pattern: Option<String>,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the admin HTTP API (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Operator authentication for `verify.send`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// Application id mixed into the operator hash.
    pub app_id: Option<String>,

    /// HMAC key for operator hashes. Overridden by PARLEY_APP_SECRET env.
    pub app_secret: Option<String>,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_oauth_base")]
    pub oauth_base: String,
    /// OAuth client used for the password grant.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Challenge images are fetched from `<captchaImageUrl>?sid=<sid>`.
    #[serde(default = "default_captcha_image_url")]
    pub captcha_image_url: String,
    /// Server-side wait of one long-poll request, seconds.
    #[serde(default = "default_long_poll_wait")]
    pub long_poll_wait: u64,
}

fn default_api_base() -> String {
    "https://api.vk.com".to_string()
}

fn default_api_version() -> String {
    "5.81".to_string()
}

fn default_oauth_base() -> String {
    "https://oauth.vk.com".to_string()
}

fn default_captcha_image_url() -> String {
    "https://api.vk.com/captcha.php".to_string()
}

fn default_long_poll_wait() -> u64 {
    crate::channels::DEFAULT_WAIT
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_version: default_api_version(),
            oauth_base: default_oauth_base(),
            client_id: None,
            client_secret: None,
            captcha_image_url: default_captcha_image_url(),
            long_poll_wait: default_long_poll_wait(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// e.g. `redis://127.0.0.1/`. Overridden by PARLEY_REDIS_URL env. When unset,
    /// challenges live in process memory and only this process can solve them.
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_messages_delay_ms")]
    pub messages_delay_ms: u64,
    #[serde(default = "default_poll_retry_delay_ms")]
    pub poll_retry_delay_ms: u64,
    #[serde(default = "default_verification_timeout_secs")]
    pub verification_timeout_secs: u64,
    /// Presence refresh interval; 0 disables it.
    #[serde(default = "default_status_delay_ms")]
    pub status_delay_ms: u64,
    /// Friend request housekeeping interval; 0 disables it.
    #[serde(default = "default_friends_delay_ms")]
    pub friends_delay_ms: u64,
    /// Sent when an agent joins a new chat. No greeting when unset.
    #[serde(default)]
    pub greeting: Option<String>,
}

fn default_queue_capacity() -> usize {
    crate::queue::DEFAULT_CAPACITY
}

fn default_messages_delay_ms() -> u64 {
    1000
}

fn default_poll_retry_delay_ms() -> u64 {
    1500
}

fn default_verification_timeout_secs() -> u64 {
    600
}

fn default_status_delay_ms() -> u64 {
    300_000
}

fn default_friends_delay_ms() -> u64 {
    600_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            messages_delay_ms: default_messages_delay_ms(),
            poll_retry_delay_ms: default_poll_retry_delay_ms(),
            verification_timeout_secs: default_verification_timeout_secs(),
            status_delay_ms: default_status_delay_ms(),
            friends_delay_ms: default_friends_delay_ms(),
            greeting: None,
        }
    }
}

fn optional_delay(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl RuntimeConfig {
    pub fn messages_delay(&self) -> Duration {
        Duration::from_millis(self.messages_delay_ms)
    }

    pub fn poll_retry_delay(&self) -> Duration {
        Duration::from_millis(self.poll_retry_delay_ms)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn status_delay(&self) -> Option<Duration> {
        optional_delay(self.status_delay_ms)
    }

    pub fn friends_delay(&self) -> Option<Duration> {
        optional_delay(self.friends_delay_ms)
    }
}

/// One managed agent: a token (optionally with its id) or a login/password pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: Option<i64>,
    pub token: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    /// Regex a group message must match to address this agent.
    pub pattern: Option<String>,
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl AgentConfig {
    /// Credentials of this entry; a token wins over login/password.
    pub fn credentials(&self) -> Result<Credentials> {
        if let Some(token) = non_empty(&self.token) {
            return Ok(Credentials::Token { token, id: self.id });
        }
        match (non_empty(&self.login), self.password.clone()) {
            (Some(login), Some(password)) => Ok(Credentials::Password { login, password }),
            _ => anyhow::bail!(
                "agent {} needs a token or a login and password",
                self.id.map(|id| id.to_string()).unwrap_or_else(|| "entry".to_string())
            ),
        }
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the operator HMAC key: env PARLEY_APP_SECRET overrides config.
pub fn resolve_app_secret(config: &Config) -> Option<String> {
    env_override("PARLEY_APP_SECRET").or_else(|| non_empty(&config.gateway.auth.app_secret))
}

/// Resolve the shared store URL: env PARLEY_REDIS_URL overrides config.
pub fn resolve_redis_url(config: &Config) -> Option<String> {
    env_override("PARLEY_REDIS_URL").or_else(|| non_empty(&config.store.redis_url))
}

/// Compile the activation pattern for `agent`, falling back to `defaultPattern`.
pub fn resolve_pattern(config: &Config, agent: &AgentConfig) -> Result<Option<Regex>> {
    let Some(source) = non_empty(&agent.pattern).or_else(|| non_empty(&config.default_pattern))
    else {
        return Ok(None);
    };
    let re = Regex::new(&source).with_context(|| format!("invalid activation pattern {:?}", source))?;
    Ok(Some(re))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".parley").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (PARLEY_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
