use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_SETTINGS_FILE: &str = "realtime.toml";
const PUSHER_PROTOCOL_VERSION: u8 = 7;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Zero means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_scheme: String,
    pub app_key: String,
    pub api_base_url: String,
    pub auth_timeout_ms: u64,
    pub activity_timeout_secs: u64,
    pub pong_timeout_secs: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".into(),
            broker_port: 8080,
            broker_scheme: "ws".into(),
            app_key: String::new(),
            api_base_url: "http://127.0.0.1:8000/api".into(),
            auth_timeout_ms: 10_000,
            activity_timeout_secs: 120,
            pong_timeout_secs: 30,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl RealtimeSettings {
    pub fn socket_url(&self) -> Result<Url, ConfigError> {
        if self.app_key.trim().is_empty() {
            return Err(ConfigError::MissingAppKey);
        }
        if self.broker_scheme != "ws" && self.broker_scheme != "wss" {
            return Err(ConfigError::UnsupportedScheme(self.broker_scheme.clone()));
        }
        let mut url = Url::parse(&format!(
            "{}://{}:{}/app/{}",
            self.broker_scheme, self.broker_host, self.broker_port, self.app_key
        ))?;
        url.query_pairs_mut()
            .append_pair("protocol", &PUSHER_PROTOCOL_VERSION.to_string())
            .append_pair("client", "rust-realtime-client")
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("flash", "false");
        Ok(url)
    }

    pub fn auth_url(&self) -> Result<Url, ConfigError> {
        Ok(Url::parse(&format!(
            "{}/broadcasting/auth",
            self.api_base_url.trim_end_matches('/')
        ))?)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// The broker announces its own activity timeout; the shorter one wins.
    pub fn activity_timeout(&self, announced_secs: Option<u64>) -> Duration {
        let secs = match announced_secs {
            Some(announced) if announced > 0 => announced.min(self.activity_timeout_secs),
            _ => self.activity_timeout_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs.max(1))
    }
}

pub fn parse_settings(raw: &str) -> Result<RealtimeSettings, ConfigError> {
    Ok(toml::from_str(raw)?)
}

pub fn load_settings(path: &Path) -> RealtimeSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => parse_settings(&raw).unwrap_or_else(|error| {
            warn!(path = %path.display(), %error, "realtime: ignoring unreadable settings file");
            RealtimeSettings::default()
        }),
        Err(_) => RealtimeSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn apply_env_overrides(
    settings: &mut RealtimeSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let first = |keys: &[&str]| keys.iter().rev().find_map(|key| lookup(*key));

    if let Some(v) = first(&["REVERB_HOST", "APP__BROKER_HOST"]) {
        settings.broker_host = v;
    }
    if let Some(v) = first(&["REVERB_PORT", "APP__BROKER_PORT"]) {
        if let Ok(parsed) = v.parse::<u16>() {
            settings.broker_port = parsed;
        }
    }
    if let Some(v) = first(&["REVERB_SCHEME", "APP__BROKER_SCHEME"]) {
        settings.broker_scheme = match v.as_str() {
            "https" => "wss".to_string(),
            "http" => "ws".to_string(),
            other => other.to_string(),
        };
    }
    if let Some(v) = first(&["REVERB_APP_KEY", "APP__APP_KEY"]) {
        settings.app_key = v;
    }
    if let Some(v) = first(&["API_BASE_URL", "APP__API_BASE_URL"]) {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__AUTH_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.auth_timeout_ms = parsed;
        }
    }
    if let Some(v) = lookup("APP__RECONNECT_ENABLED") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.reconnect.enabled = parsed;
        }
    }
    if let Some(v) = lookup("APP__RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect.max_attempts = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
