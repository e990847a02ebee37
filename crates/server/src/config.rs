use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use relay::{RelaySettings, DEFAULT_HISTORY_LIMIT, DEFAULT_SEARCH_LIMIT};
use tracing::warn;

#[derive(Debug)]
pub struct Settings {
    pub server_bind: String,
    /// Line-delimited TCP listener for socket clients; `None` disables it.
    pub tcp_bind: Option<String>,
    pub database_url: String,
    pub bcrypt_cost: u32,
    pub history_limit: u32,
    pub search_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            tcp_bind: Some("127.0.0.1:8080".into()),
            database_url: "sqlite://./data/server.db".into(),
            bcrypt_cost: RelaySettings::default().bcrypt_cost,
            history_limit: DEFAULT_HISTORY_LIMIT,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl Settings {
    pub fn relay(&self) -> RelaySettings {
        RelaySettings {
            bcrypt_cost: self.bcrypt_cost,
            history_limit: self.history_limit,
            search_limit: self.search_limit,
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind_addr" => self.server_bind = value.to_string(),
            "tcp_bind_addr" => {
                let value = value.trim();
                self.tcp_bind = (!value.is_empty()).then(|| value.to_string());
            }
            "database_url" => self.database_url = value.to_string(),
            "bcrypt_cost" => parse_into(key, value, &mut self.bcrypt_cost),
            "history_limit" => parse_into(key, value, &mut self.history_limit),
            "search_limit" => parse_into(key, value, &mut self.search_limit),
            _ => {}
        }
    }
}

fn parse_into(key: &str, value: &str, slot: &mut u32) {
    match value.trim().parse::<u32>() {
        Ok(parsed) => *slot = parsed,
        Err(error) => warn!(key, value, %error, "ignoring invalid setting"),
    }
}

/// Later sources win: `server.toml` over defaults, plain env names over the
/// file, `APP__*` names over everything.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SERVER_BIND", "bind_addr"),
    ("APP__BIND_ADDR", "bind_addr"),
    ("TCP_BIND", "tcp_bind_addr"),
    ("APP__TCP_BIND_ADDR", "tcp_bind_addr"),
    ("DATABASE_URL", "database_url"),
    ("APP__DATABASE_URL", "database_url"),
    ("APP__BCRYPT_COST", "bcrypt_cost"),
    ("APP__HISTORY_LIMIT", "history_limit"),
    ("APP__SEARCH_LIMIT", "search_limit"),
];

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    settings_from(file.as_deref(), |name| std::env::var(name).ok())
}

fn settings_from(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<HashMap<String, String>>(raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    settings.apply(key, value);
                }
            }
            Err(error) => warn!(%error, "ignoring unreadable server.toml"),
        }
    }

    for &(name, key) in ENV_OVERRIDES {
        if let Some(value) = env(name) {
            settings.apply(key, &value);
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
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

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
