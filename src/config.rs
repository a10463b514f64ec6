use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{UserId, Viewer};

const APP_DIR: &str = "chatsync";
const CONFIG_FILE: &str = "config.json";
const SESSION_FILE: &str = "session.json";

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point every config/session/state file at `dir` instead of the per-user
/// config directory. Only the first call has an effect.
pub fn set_config_dir_override(dir: PathBuf) -> bool {
    CONFIG_DIR_OVERRIDE.set(dir).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE.get() {
        return Ok(dir.clone());
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_DIR);

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_cache_ttl_secs() -> u64 {
    60
}
fn default_max_pins() -> usize {
    3
}
fn default_write_attempts() -> usize {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_auto_mark_read() -> bool {
    true
}

/// Tunables for the sync engine. Every field has a default so a partial
/// `config.json` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_pins")]
    pub max_pins: usize,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_auto_mark_read")]
    pub auto_mark_read: bool,
    /// Where the local pin fallback lives; defaults to the config directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            poll_interval_ms: default_poll_interval_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_pins: default_max_pins(),
            write_attempts: default_write_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            auto_mark_read: default_auto_mark_read(),
            state_dir: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value for {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}

impl SyncConfig {
    /// Read a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        let config: SyncConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Defaults, then `config.json`, then `CHATSYNC_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => get_config_dir()?.join(CONFIG_FILE),
        };
        let mut config = Self::load_from(&path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("CHATSYNC_API_URL") {
            self.api_url = url;
        }
        if let Some(v) = env_parse("CHATSYNC_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("CHATSYNC_CACHE_TTL_SECS")? {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = env_parse("CHATSYNC_MAX_PINS")? {
            self.max_pins = v;
        }
        if let Some(v) = env_parse("CHATSYNC_WRITE_ATTEMPTS")? {
            self.write_attempts = v;
        }
        if let Some(v) = env_parse("CHATSYNC_RETRY_BASE_DELAY_MS")? {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = env_parse("CHATSYNC_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = v;
        }
        if let Some(v) = env_parse("CHATSYNC_AUTO_MARK_READ")? {
            self.auto_mark_read = v;
        }
        if let Ok(dir) = env::var("CHATSYNC_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            bail!("api_url must not be empty");
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!("api_url must start with http:// or https://, got {}", self.api_url);
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.max_pins == 0 {
            bail!("max_pins must be greater than zero");
        }
        if self.write_attempts == 0 {
            bail!("write_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_config_dir(),
        }
    }
}

/// The signed-in participant, remembered between runs
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Session {
    pub api_url: String,
    pub user_id: UserId,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Session {
    pub fn new(api_url: &str, viewer: Viewer, token: Option<&str>) -> Self {
        Session {
            api_url: api_url.to_string(),
            user_id: viewer.user_id(),
            role: viewer.role_name().to_string(),
            token: token.map(|t| BASE64.encode(t)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().map(|encoded| {
            String::from_utf8(BASE64.decode(encoded).unwrap_or_default()).unwrap_or_default()
        })
    }

    pub fn viewer(&self) -> Result<Viewer> {
        parse_viewer(&self.role, self.user_id)
    }
}

pub fn parse_viewer(role: &str, user_id: UserId) -> Result<Viewer> {
    match role.trim().to_ascii_lowercase().as_str() {
        "student" => Ok(Viewer::Student(user_id)),
        "company" => Ok(Viewer::Company(user_id)),
        other => bail!("Unknown role '{}', expected student or company", other),
    }
}

fn session_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(SESSION_FILE))
}

pub fn save_session_to(path: &Path, session: &Session) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, session)?;
    info!("Session saved for user {}", session.user_id);
    Ok(())
}

pub fn load_session_from(path: &Path) -> Result<Option<Session>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    let session: Session = serde_json::from_str(&contents)?;
    info!("Loaded session for user {} from {}", session.user_id, path.display());
    Ok(Some(session))
}

pub fn save_session(session: &Session) -> Result<()> {
    save_session_to(&session_path()?, session)
}

pub fn load_session() -> Result<Option<Session>> {
    load_session_from(&session_path()?)
}
