use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Settings {
    pub chat_api_url: String,
    pub chat_gateway_url: String,
    pub chat_token: String,
    pub guild_id: String,
    pub command_prefix: String,
    pub database_url: String,
    pub drive_api_url: String,
    pub drive_token: String,
    pub root_folder: String,
    pub template_sheet: Option<String>,
    pub start_party_size: u32,
    pub live_category: String,
    pub archive_category: String,
    pub voice_category: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chat_api_url: "https://discord.com/api/v10".into(),
            chat_gateway_url: "wss://gateway.discord.gg".into(),
            chat_token: String::new(),
            guild_id: String::new(),
            command_prefix: "!".into(),
            database_url: "sqlite://./data/huntbot.db".into(),
            drive_api_url: "https://www.googleapis.com/drive/v2".into(),
            drive_token: String::new(),
            root_folder: "Hunt".into(),
            template_sheet: None,
            start_party_size: 30,
            live_category: "Puzzles".into(),
            archive_category: "Solved".into(),
            voice_category: "Puzzle Voice Channels".into(),
        }
    }
}

pub fn load_settings(config_path: Option<&Path>) -> Settings {
    let mut settings = Settings::default();
    let path = config_path.unwrap_or_else(|| Path::new("huntbot.toml"));

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply(&mut settings, |key| file_cfg.get(key).cloned());
        }
    }

    apply(&mut settings, |key| {
        std::env::var(format!("HUNTBOT_{}", key.to_uppercase())).ok()
    });
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }

    settings
}

fn apply(settings: &mut Settings, get: impl Fn(&str) -> Option<String>) {
    if let Some(v) = get("chat_api_url") {
        settings.chat_api_url = v;
    }
    if let Some(v) = get("chat_gateway_url") {
        settings.chat_gateway_url = v;
    }
    if let Some(v) = get("chat_token") {
        settings.chat_token = v;
    }
    if let Some(v) = get("guild_id") {
        settings.guild_id = v;
    }
    if let Some(v) = get("command_prefix") {
        settings.command_prefix = v;
    }
    if let Some(v) = get("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = get("drive_api_url") {
        settings.drive_api_url = v;
    }
    if let Some(v) = get("drive_token") {
        settings.drive_token = v;
    }
    if let Some(v) = get("root_folder") {
        settings.root_folder = v;
    }
    if let Some(v) = get("template_sheet") {
        settings.template_sheet = Some(v);
    }
    if let Some(v) = get("start_party_size") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.start_party_size = parsed;
        }
    }
    if let Some(v) = get("live_category") {
        settings.live_category = v;
    }
    if let Some(v) = get("archive_category") {
        settings.archive_category = v;
    }
    if let Some(v) = get("voice_category") {
        settings.voice_category = v;
    }
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

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url);
    format!("sqlite://{}", path.replace('\\', "/"))
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
