use std::{
    collections::HashMap,
    fs,
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use crate::watermark::DEFAULT_WATERMARK_CAPACITY;

pub const SETTINGS_FILE: &str = "imsync.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub app_key: String,
    /// WebSocket endpoint of the message service.
    pub server_url: String,
    /// HTTP base for side-channel queries such as the unread probe.
    pub api_base_url: String,
    /// Local store location; empty keeps everything in memory.
    pub database_url: String,
    pub request_timeout_ms: u64,
    pub watermark_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            server_url: "ws://127.0.0.1:8443/ws".into(),
            api_base_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/imsync.db".into(),
            request_timeout_ms: 15_000,
            watermark_capacity: DEFAULT_WATERMARK_CAPACITY,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Defaults, then `imsync.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    let mut settings = load_settings_from(Path::new(SETTINGS_FILE));
    apply_env_overrides(&mut settings);
    settings
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("app_key") {
                settings.app_key = v.clone();
            }
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("api_base_url") {
                settings.api_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(parsed) = file_cfg
                .get("request_timeout_ms")
                .and_then(|v| v.parse::<u64>().ok())
            {
                settings.request_timeout_ms = parsed;
            }
            if let Some(parsed) = file_cfg
                .get("watermark_capacity")
                .and_then(|v| v.parse::<usize>().ok())
            {
                settings.watermark_capacity = parsed;
            }
        }
    }

    settings
}

fn apply_env_overrides(settings: &mut ClientSettings) {
    if let Ok(v) = std::env::var("IMSYNC_APP_KEY") {
        settings.app_key = v;
    }
    if let Ok(v) = std::env::var("APP__APP_KEY") {
        settings.app_key = v;
    }

    if let Ok(v) = std::env::var("IMSYNC_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Ok(v) = std::env::var("IMSYNC_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("APP__REQUEST_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__WATERMARK_CAPACITY") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.watermark_capacity = parsed;
        }
    }
}

/// Returns `None` when no durable store is configured. Storage creates the
/// parent directory of a file database when it opens it.
pub fn normalize_database_url(raw_database_url: &str) -> Option<String> {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return None;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return Some(raw_database_url.to_string());
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return Some(format!("sqlite://{path}"));
    }

    Some(format!("sqlite://{}", raw_database_url.replace('\\', "/")))
}
