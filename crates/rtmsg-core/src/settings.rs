//! Settings parser for `config.toml`
//!
//! Every section has defaults, so an empty or missing file yields a usable
//! configuration except for the server host, which must come from the file
//! or the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::prelude::*;

const CONFIG_FILENAME: &str = "config.toml";
const APP_DIR: &str = "rtmsg";

/// Environment variable overriding `server.auth_token`.
pub const AUTH_TOKEN_ENV: &str = "RTMSG_AUTH_TOKEN";

/// Application settings (`config.toml`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub lock: LockSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub keepalive: KeepAliveSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

/// Push endpoint location and credentials.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub host_name: String,

    #[serde(default)]
    pub shard_id: String,

    /// Use `wss://` instead of `ws://`.
    #[serde(default = "default_true")]
    pub secure: bool,

    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            shard_id: String::new(),
            secure: true,
            auth_token: None,
        }
    }
}

/// Lease-based leader election timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockSettings {
    /// Lease duration; a lock record older than this is stale.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl LockSettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Exponential reconnect backoff parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_step_ms")]
    pub step_ms: u64,

    /// Upper bound on the delay; `None` disables the cap.
    #[serde(default = "default_cap_ms")]
    pub cap_ms: Option<u64>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            step_ms: default_step_ms(),
            cap_ms: default_cap_ms(),
        }
    }
}

/// Ping/pong watchdog timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeepAliveSettings {
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            pong_timeout_ms: default_pong_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl KeepAliveSettings {
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Which shared store backs cross-context coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Directory of files shared between processes.
    #[default]
    File,
    /// In-process store; no coordination with other processes.
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Store directory; defaults to the platform data directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StoreSettings {
    /// Resolve the store directory, falling back to `<data dir>/rtmsg/store`.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("store")
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_jitter_min_ms() -> u64 {
    10
}

fn default_jitter_max_ms() -> u64 {
    260
}

fn default_base_ms() -> u64 {
    1000
}

fn default_step_ms() -> u64 {
    1000
}

fn default_cap_ms() -> Option<u64> {
    Some(100_000)
}

fn default_pong_timeout_ms() -> u64 {
    15_000
}

fn default_sweep_interval_ms() -> u64 {
    7000
}

impl Settings {
    /// Override values from the process environment.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
            if !token.is_empty() {
                self.server.auth_token = Some(token);
            }
        }
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.host_name.trim().is_empty() {
            return Err(Error::config_invalid("server.host_name must not be empty"));
        }
        // A zero period would leave a deadline permanently due
        for (name, value) in [
            ("lock.heartbeat_timeout_ms", self.lock.heartbeat_timeout_ms),
            ("lock.heartbeat_interval_ms", self.lock.heartbeat_interval_ms),
            ("keepalive.pong_timeout_ms", self.keepalive.pong_timeout_ms),
            ("keepalive.sweep_interval_ms", self.keepalive.sweep_interval_ms),
            ("reconnect.base_ms", self.reconnect.base_ms),
        ] {
            if value == 0 {
                return Err(Error::config_invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.lock.jitter_min_ms > self.lock.jitter_max_ms {
            return Err(Error::config_invalid(format!(
                "lock.jitter_min_ms ({}) exceeds lock.jitter_max_ms ({})",
                self.lock.jitter_min_ms, self.lock.jitter_max_ms
            )));
        }
        if self.lock.heartbeat_interval_ms >= self.lock.heartbeat_timeout_ms {
            return Err(Error::config_invalid(
                "lock.heartbeat_interval_ms must be shorter than lock.heartbeat_timeout_ms",
            ));
        }
        if let Some(cap) = self.reconnect.cap_ms {
            if cap < self.reconnect.base_ms {
                return Err(Error::config_invalid(
                    "reconnect.cap_ms must not be below reconnect.base_ms",
                ));
            }
        }
        Ok(())
    }
}

/// Default location of the settings file (`~/.config/rtmsg/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(CONFIG_FILENAME)
}

/// Load settings from `config_path`, returning defaults when the file is
/// missing or cannot be parsed.
pub fn load_settings(config_path: &Path) -> Settings {
    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}
