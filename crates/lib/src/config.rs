//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (default `~/.switchboard/config.json`) and environment.
//! Every section is optional; a missing file yields the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::RetryPolicy;
use crate::desk::{DeskSettings, DEFAULT_HANDOFF_ACKNOWLEDGEMENT};
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::router::{RouterSettings, DEFAULT_FALLBACK_REPLY, DEFAULT_HANDOFF_KEYWORD};

pub const CONFIG_PATH_ENV: &str = "SWITCHBOARD_CONFIG_PATH";
pub const GATEWAY_TOKEN_ENV: &str = "SWITCHBOARD_GATEWAY_TOKEN";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Messaging transport (protocol sidecar) settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Automated responder backend.
    #[serde(default)]
    pub responder: ResponderConfig,

    /// Handoff keyword and fixed replies.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Outbound retry policy.
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 3002).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only allowed on a loopback bind). "token" = agents send it in `connect`.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for the agent `connect` event. Overridden by SWITCHBOARD_GATEWAY_TOKEN.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    #[default]
    None,
    Token,
}

fn default_gateway_port() -> u16 {
    3002
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

/// Protocol sidecar connection and startup policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// "sidecar" (default) or "memory" (no messaging network; outbound calls are logged and recorded).
    #[serde(default)]
    pub mode: TransportMode,

    /// WebSocket URL of the sidecar (default ws://127.0.0.1:3100/ws).
    #[serde(default = "default_sidecar_url")]
    pub sidecar_url: String,

    /// Session credentials file. Relative paths resolve against the config directory;
    /// default `credentials.json` next to the config file.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,

    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    #[serde(default = "default_startup_retry_delay_secs")]
    pub startup_retry_delay_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Sidecar,
    Memory,
}

fn default_sidecar_url() -> String {
    "ws://127.0.0.1:3100/ws".to_string()
}

fn default_startup_attempts() -> u32 {
    3
}

fn default_startup_retry_delay_secs() -> u64 {
    5
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            sidecar_url: default_sidecar_url(),
            credentials_path: None,
            startup_attempts: default_startup_attempts(),
            startup_retry_delay_secs: default_startup_retry_delay_secs(),
        }
    }
}

impl TransportConfig {
    pub fn startup_retry_delay(&self) -> Duration {
        Duration::from_secs(self.startup_retry_delay_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponderBackend {
    #[default]
    Ollama,
    /// Any OpenAI-compatible chat completions API.
    OpenAi,
}

/// Automated responder settings. `baseUrl` and `model` fall back to backend defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponderConfig {
    #[serde(default)]
    pub backend: ResponderBackend,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Overridden by OPENAI_API_KEY.
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Case-insensitive word that asks for a human (default "humano").
    #[serde(default = "default_handoff_keyword")]
    pub handoff_keyword: String,

    /// Sent when the responder fails.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,

    /// Sent to the user when an agent takes the conversation.
    #[serde(default = "default_handoff_acknowledgement")]
    pub handoff_acknowledgement: String,

    /// Messages of history sent to an agent on claim (default 100).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_handoff_keyword() -> String {
    DEFAULT_HANDOFF_KEYWORD.to_string()
}

fn default_fallback_reply() -> String {
    DEFAULT_FALLBACK_REPLY.to_string()
}

fn default_handoff_acknowledgement() -> String {
    DEFAULT_HANDOFF_ACKNOWLEDGEMENT.to_string()
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            handoff_keyword: default_handoff_keyword(),
            fallback_reply: default_fallback_reply(),
            handoff_acknowledgement: default_handoff_acknowledgement(),
            history_limit: default_history_limit(),
        }
    }
}

impl RoutingConfig {
    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            handoff_keyword: self.handoff_keyword.clone(),
            fallback_reply: self.fallback_reply.clone(),
        }
    }

    pub fn desk_settings(&self) -> DeskSettings {
        DeskSettings {
            history_limit: self.history_limit,
            handoff_acknowledgement: self.handoff_acknowledgement.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// Total send attempts per message, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed pause between attempts (default 2000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Trimmed, non-empty value: the env value wins over the configured one.
fn env_or_config(env_value: Option<String>, configured: Option<&String>) -> Option<String> {
    env_value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the gateway token: env SWITCHBOARD_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_or_config(
        std::env::var(GATEWAY_TOKEN_ENV).ok(),
        config.gateway.auth.token.as_ref(),
    )
}

/// Resolve the responder api key: env OPENAI_API_KEY overrides config.
pub fn resolve_api_key(config: &Config) -> Option<String> {
    env_or_config(
        std::env::var(OPENAI_API_KEY_ENV).ok(),
        config.responder.api_key.as_ref(),
    )
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "localhost"
        || b.parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".switchboard").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Credentials file: `transport.credentialsPath` (relative paths resolved against the config
/// file's parent), otherwise `credentials.json` next to the config file.
pub fn resolve_credentials_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.transport.credentials_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_dir(config_path).join(p)
            }
        }
        _ => config_dir(config_path).join("credentials.json"),
    }
}

/// Load config from the given path, or the default path (or SWITCHBOARD_CONFIG_PATH).
/// Missing file => default config. Returns the config and the path that was used.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.gateway.port, 3002);
        assert_eq!(c.gateway.bind, "127.0.0.1");
        assert_eq!(c.transport.mode, TransportMode::Sidecar);
        assert_eq!(c.transport.sidecar_url, "ws://127.0.0.1:3100/ws");
        assert_eq!(c.transport.startup_attempts, 3);
        assert_eq!(c.transport.startup_retry_delay(), Duration::from_secs(5));
        assert_eq!(c.routing.handoff_keyword, "humano");
        assert_eq!(c.routing.history_limit, 100);
        assert_eq!(c.delivery.retry_policy(), RetryPolicy::default());
        assert_eq!(c.responder.backend, ResponderBackend::Ollama);
    }

    #[test]
    fn empty_object_parses_to_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.gateway.port, 3002);
        assert_eq!(c.routing.fallback_reply, DEFAULT_FALLBACK_REPLY);
    }

    #[test]
    fn camel_case_sections_parse() {
        let c: Config = serde_json::from_str(
            r#"{
                "gateway": { "port": 4000, "auth": { "mode": "token", "token": " s3cret " } },
                "transport": { "mode": "memory", "sidecarUrl": "ws://wa:9000/ws", "startupAttempts": 5 },
                "responder": { "backend": "openai", "model": "gpt-4o", "systemPrompt": "Sé breve." },
                "routing": { "handoffKeyword": "agente", "historyLimit": 20 },
                "delivery": { "maxAttempts": 4, "retryDelayMs": 500 }
            }"#,
        )
        .unwrap();
        assert_eq!(c.gateway.port, 4000);
        assert_eq!(c.gateway.bind, "127.0.0.1");
        assert_eq!(c.gateway.auth.mode, GatewayAuthMode::Token);
        assert_eq!(c.transport.mode, TransportMode::Memory);
        assert_eq!(c.transport.sidecar_url, "ws://wa:9000/ws");
        assert_eq!(c.transport.startup_attempts, 5);
        assert_eq!(c.transport.startup_retry_delay_secs, 5);
        assert_eq!(c.responder.backend, ResponderBackend::OpenAi);
        assert_eq!(c.routing.router_settings().handoff_keyword, "agente");
        assert_eq!(c.routing.desk_settings().history_limit, 20);
        assert_eq!(
            c.delivery.retry_policy(),
            RetryPolicy {
                max_attempts: 4,
                delay: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn env_value_wins_and_blanks_are_ignored() {
        let configured = Some(" from-config ".to_string());
        assert_eq!(
            env_or_config(Some("from-env".into()), configured.as_ref()).as_deref(),
            Some("from-env")
        );
        assert_eq!(
            env_or_config(Some("  ".into()), configured.as_ref()).as_deref(),
            Some("from-config")
        );
        assert_eq!(env_or_config(None, Some(&"".to_string())), None);
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind("::1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
        assert!(!is_loopback_bind("192.168.1.10"));
    }

    #[test]
    fn credentials_path_resolution() {
        let path = Path::new("/home/user/.switchboard/config.json");
        let mut config = Config::default();
        assert_eq!(
            resolve_credentials_path(&config, path),
            PathBuf::from("/home/user/.switchboard/credentials.json")
        );
        config.transport.credentials_path = Some(PathBuf::from("auth/creds.json"));
        assert_eq!(
            resolve_credentials_path(&config, path),
            PathBuf::from("/home/user/.switchboard/auth/creds.json")
        );
        config.transport.credentials_path = Some(PathBuf::from("/var/lib/switchboard/creds.json"));
        assert_eq!(
            resolve_credentials_path(&config, path),
            PathBuf::from("/var/lib/switchboard/creds.json")
        );
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("switchboard-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.gateway.port, 3002);
    }
}
