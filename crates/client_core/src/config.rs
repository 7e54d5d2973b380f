use std::{fs, path::Path, time::Duration};

use shared::domain::ChatId;
use tracing::warn;

use crate::realtime::{RealtimeOptions, DEFAULT_JOIN_DELAY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub realtime_url: String,
    pub room_chat_id: i64,
    pub join_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub database_url: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api/v1".into(),
            realtime_url: "ws://127.0.0.1:8080/ws".into(),
            room_chat_id: 1,
            join_delay_ms: DEFAULT_JOIN_DELAY.as_millis() as u64,
            request_timeout_secs: 30,
            database_url: "sqlite://./data/client.db".into(),
        }
    }
}

impl ClientSettings {
    pub fn room(&self) -> ChatId {
        ChatId(self.room_chat_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn realtime_options(&self) -> RealtimeOptions {
        RealtimeOptions {
            url: self.realtime_url.clone(),
            room: self.room(),
            join_delay: Duration::from_millis(self.join_delay_ms),
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    apply_file(&mut settings, Path::new("client.toml"));
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    settings
}

fn apply_file(settings: &mut ClientSettings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    let table = match raw.parse::<toml::Table>() {
        Ok(table) => table,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config: ignoring unparseable file");
            return;
        }
    };

    if let Some(v) = table.get("api_url").and_then(|v| v.as_str()) {
        settings.api_base_url = v.to_string();
    }
    if let Some(v) = table.get("realtime_url").and_then(|v| v.as_str()) {
        settings.realtime_url = v.to_string();
    }
    if let Some(v) = table.get("room_chat_id").and_then(|v| v.as_integer()) {
        settings.room_chat_id = v;
    }
    if let Some(v) = table.get("join_delay_ms").and_then(|v| v.as_integer()) {
        settings.join_delay_ms = v.max(0) as u64;
    }
    if let Some(v) = table.get("request_timeout_secs").and_then(|v| v.as_integer()) {
        settings.request_timeout_secs = v.max(1) as u64;
    }
    if let Some(v) = table.get("database_url").and_then(|v| v.as_str()) {
        settings.database_url = v.to_string();
    }
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = lookup("CHAT_REALTIME_URL") {
        settings.realtime_url = v;
    }
    if let Some(v) = lookup("APP__REALTIME_URL") {
        settings.realtime_url = v;
    }

    if let Some(v) = lookup("APP__ROOM_CHAT_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.room_chat_id = parsed;
        }
    }
    if let Some(v) = lookup("APP__JOIN_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.join_delay_ms = parsed;
        }
    }
    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed.max(1);
        }
    }

    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
