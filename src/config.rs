use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::search::SearchEngineKind;
use crate::utils;

const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:3000";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_address: String,
    pub database_path: Option<PathBuf>,
    pub timezone: String,
    pub search_engine: SearchEngineKind,
    pub public_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND.to_string(),
            database_path: None,
            timezone: DEFAULT_TIMEZONE.to_string(),
            search_engine: SearchEngineKind::default(),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
        }
    }
}

impl AppConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(utils::database_path)
    }

    /// Falls back to UTC when the configured zone name is unknown.
    pub fn tz(&self) -> Tz {
        self.timezone.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!("unknown timezone {:?}, using UTC", self.timezone);
            Tz::UTC
        })
    }

    /// Renders the public url of an event, used when an export needs a URL the event lacks.
    pub fn event_url(&self, event_id: i64) -> String {
        format!("{}/events/{event_id}", self.public_url.trim_end_matches('/'))
    }

    fn apply_env(mut self) -> Self {
        if let Ok(path) = std::env::var("CALENDAR_DATABASE") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(bind) = std::env::var("CALENDAR_BIND") {
            self.bind_address = bind;
        }
        if let Ok(tz) = std::env::var("CALENDAR_TIMEZONE") {
            self.timezone = tz;
        }
        if let Ok(url) = std::env::var("CALENDAR_PUBLIC_URL") {
            self.public_url = url;
        }
        if let Ok(kind) = std::env::var("CALENDAR_SEARCH_ENGINE") {
            match kind.parse() {
                Ok(kind) => self.search_engine = kind,
                Err(err) => tracing::warn!("ignoring CALENDAR_SEARCH_ENGINE: {err}"),
            }
        }
        self
    }
}

pub struct ConfigStore {
    path: PathBuf,
    data: Mutex<AppConfig>,
}

impl ConfigStore {
    pub fn load() -> Self {
        Self::load_from(utils::config_path())
    }

    pub fn load_from(path: PathBuf) -> Self {
        let data = match read_config(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("failed to read config {:?}: {err}", path);
                AppConfig::default()
            }
        }
        .apply_env();
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            path: PathBuf::new(),
            data: Mutex::new(config),
        }
    }

    pub fn read(&self) -> AppConfig {
        match self.data.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, transform: F) -> Result<AppConfig, String>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| "config mutex poisoned".to_string())?;
        transform(&mut guard);
        if !self.path.as_os_str().is_empty() {
            write_config(&self.path, &guard)?;
        }
        Ok(guard.clone())
    }
}

fn read_config(path: &Path) -> Result<AppConfig, String> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&contents).map_err(|err| err.to_string())
}

fn write_config(path: &Path, config: &AppConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            return Err(err.to_string());
        }
    }
    let contents = serde_json::to_string_pretty(config).map_err(|err| err.to_string())?;
    fs::write(path, contents).map_err(|err| err.to_string())
}
