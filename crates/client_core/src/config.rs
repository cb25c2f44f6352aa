use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{error::ConfigError, live::ReconnectPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub request_timeout_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub ack_timeout_secs: u64,
    pub stable_connection_secs: u64,
    pub dedup_window_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            request_timeout_secs: 15,
            reconnect_base_ms: 500,
            reconnect_max_ms: 10_000,
            reconnect_max_attempts: 8,
            ack_timeout_secs: 10,
            stable_connection_secs: 5,
            dedup_window_secs: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    request_timeout_secs: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    ack_timeout_secs: Option<u64>,
    stable_connection_secs: Option<u64>,
    dedup_window_secs: Option<u64>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(DEFAULT_CONFIG_PATH), |key| std::env::var(key).ok())
}

/// Defaults, then the settings file (if readable), then environment overrides.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => settings.apply_file(file_cfg),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "config: ignoring unparsable settings file"
            ),
        }
    }

    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    override_number(&env, "APP__REQUEST_TIMEOUT_SECS", &mut settings.request_timeout_secs);
    override_number(&env, "APP__RECONNECT_BASE_MS", &mut settings.reconnect_base_ms);
    override_number(&env, "APP__RECONNECT_MAX_MS", &mut settings.reconnect_max_ms);
    override_number(
        &env,
        "APP__RECONNECT_MAX_ATTEMPTS",
        &mut settings.reconnect_max_attempts,
    );
    override_number(&env, "APP__ACK_TIMEOUT_SECS", &mut settings.ack_timeout_secs);
    override_number(
        &env,
        "APP__STABLE_CONNECTION_SECS",
        &mut settings.stable_connection_secs,
    );
    override_number(&env, "APP__DEDUP_WINDOW_SECS", &mut settings.dedup_window_secs);

    settings
}

fn override_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring non-numeric override"),
    }
}

impl Settings {
    fn apply_file(&mut self, file_cfg: FileSettings) {
        if let Some(v) = file_cfg.server_url {
            self.server_url = v;
        }
        if let Some(v) = file_cfg.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = file_cfg.reconnect_base_ms {
            self.reconnect_base_ms = v;
        }
        if let Some(v) = file_cfg.reconnect_max_ms {
            self.reconnect_max_ms = v;
        }
        if let Some(v) = file_cfg.reconnect_max_attempts {
            self.reconnect_max_attempts = v;
        }
        if let Some(v) = file_cfg.ack_timeout_secs {
            self.ack_timeout_secs = v;
        }
        if let Some(v) = file_cfg.stable_connection_secs {
            self.stable_connection_secs = v;
        }
        if let Some(v) = file_cfg.dedup_window_secs {
            self.dedup_window_secs = v;
        }
    }

    pub fn server_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(self.server_url.trim()).map_err(|err| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Live endpoint on the same host: `http -> ws`, `https -> wss`, path `/ws`.
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        let mut url = self.server_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms.max(1)),
            max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms).max(1)),
            max_attempts: self.reconnect_max_attempts,
            ack_timeout: Duration::from_secs(self.ack_timeout_secs.max(1)),
            stable_after: Duration::from_secs(self.stable_connection_secs),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
