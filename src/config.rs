//! Configuration loading and persistence.
//!
//! Settings live in `<config_dir>/device-farm/config.json`. Environment
//! variables override the file, and CLI flags override both (applied by the
//! binary).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KILL_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_RESERVATION_TIMEOUT,
};
use crate::sdk::Sdk;

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Configuration for the device-farm client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Coordinator endpoint (`http(s)://host:port`).
    pub api_url: String,
    /// Device tag to request.
    pub tag: String,
    /// Android SDK root; adb is resolved from `PATH` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_root: Option<PathBuf>,
    /// Value for `ANDROID_SDK_HOME`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_home: Option<PathBuf>,
    /// Where `logcat.txt` and `screencap.png` are written.
    pub artifacts_dir: PathBuf,
    /// Seconds allowed for the coordinator handshake.
    pub connect_timeout: u64,
    /// Seconds to wait for a device to be granted.
    pub reservation_timeout: u64,
    /// Seconds between "waiting for device" lines.
    pub poll_interval: u64,
    /// Milliseconds allowed for each adb command.
    pub command_timeout_ms: u64,
    /// Seconds allowed for killing the log process.
    pub kill_timeout: u64,
    /// Take a screenshot during teardown.
    pub capture_screen: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:9001".to_string(),
            tag: String::new(),
            sdk_root: None,
            sdk_home: None,
            artifacts_dir: PathBuf::from("artifacts"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT.as_secs(),
            poll_interval: DEFAULT_POLL_INTERVAL.as_secs(),
            command_timeout_ms: u64::try_from(DEFAULT_COMMAND_TIMEOUT.as_millis())
                .unwrap_or(15_000),
            kill_timeout: DEFAULT_KILL_TIMEOUT.as_secs(),
            capture_screen: true,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `DEVICE_FARM_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("DEVICE_FARM_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("device-farm")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("[Config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(api_url) = var("DEVICE_FARM_API_URL") {
            self.api_url = api_url;
        }

        if let Some(tag) = var("DEVICE_FARM_TAG") {
            self.tag = tag;
        }

        if let Some(root) = var("DEVICE_FARM_SDK_ROOT") {
            self.sdk_root = Some(PathBuf::from(root));
        }

        if let Some(home) = var("DEVICE_FARM_SDK_HOME") {
            self.sdk_home = Some(PathBuf::from(home));
        }

        if let Some(dir) = var("DEVICE_FARM_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(dir);
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        self.save_to(&path)?;
        Ok(path)
    }

    /// Writes the configuration as pretty JSON to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// SDK described by `sdk_root` / `sdk_home`.
    pub fn sdk(&self) -> Sdk {
        Sdk::new(self.sdk_root.clone(), self.sdk_home.clone())
    }

    /// Handshake budget.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Overall reservation wait.
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout)
    }

    /// Progress line interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Per-command adb deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Log process kill budget.
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout)
    }
}
