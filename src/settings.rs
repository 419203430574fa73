use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// WebSocket endpoint of the conversation backend.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// REST endpoint for the history fetch. Empty = start with no history.
    #[serde(default)]
    pub api_url: String,
    /// Identity attached to outbound sends; supplied by the host's auth.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_email: String,
    /// Input device by name; empty = system default.
    #[serde(default)]
    pub mic_device: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Audio chunk cadence in milliseconds.
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_url: String::new(),
            user_id: String::new(),
            user_email: String::new(),
            mic_device: String::new(),
            sample_rate: default_sample_rate(),
            chunk_ms: default_chunk_ms(),
        }
    }
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080".into()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_chunk_ms() -> u32 {
    250
}

pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("Parlance").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".parlance").join("settings.json"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn load() -> Settings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(_) => return Settings::default(),
    };
    match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    let path = settings_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(&path, json).map_err(|e| format!("Failed to write settings: {}", e))
}
