use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CronfleetError, Result};

// Scheduler tunables. Only `timeout_secs` is configurable at runtime.
pub const CONTROLLERS_PER_JOB: usize = 2;
pub const JOB_RESET_INTERVAL: Duration = Duration::from_secs(60);
pub const NEW_JOB_GRACE_WINDOW: Duration = Duration::from_secs(80);
pub const KILL_STALE_PERIOD: Duration = Duration::from_secs(60);
pub const DAL_BACKOFF: Duration = Duration::from_secs(5);
pub const STALE_OVERRUN_MARGIN: Duration = Duration::from_secs(60);
pub const JOB_CHANGE_CAPACITY: usize = 128;
pub const SINGLETON_LEASE_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_VERB_ENDPOINT: &str = "http://127.0.0.1:8892";

/// Top-level config (cronfleet.toml + CRONFLEET_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronfleetConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub verbs: VerbServiceConfig,
}

/// Identity and static fleet membership of this controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Stable controller key. A fresh `ctr-*` key is generated when unset.
    pub key: Option<String>,
    /// Ordered controller keys of the whole fleet, this controller included.
    /// An empty list means a fleet of one.
    #[serde(default)]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Deadline for a single verb call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl CronConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Where verbs are invoked. Requests go to `{endpoint}/{module}/{verb}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerbServiceConfig {
    #[serde(default = "default_verb_endpoint")]
    pub endpoint: String,
    /// Sent as the origin host of every call. Defaults to the controller key.
    pub origin_host: Option<String>,
}

impl Default for VerbServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_verb_endpoint(),
            origin_host: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_verb_endpoint() -> String {
    DEFAULT_VERB_ENDPOINT.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronfleet/cronfleet.db", home)
}

impl CronfleetConfig {
    /// Load config from a TOML file with CRONFLEET_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `CRONFLEET_CRON__TIMEOUT_SECS=30`.
    /// An explicitly given path must exist; the default
    /// `~/.cronfleet/cronfleet.toml` is optional.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(p) => {
                if !std::path::Path::new(p).exists() {
                    return Err(CronfleetError::ConfigNotFound {
                        path: p.to_string(),
                    });
                }
                p.to_string()
            }
            None => default_config_path(),
        };

        let config: CronfleetConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONFLEET_").split("__"))
            .extract()
            .map_err(|e| CronfleetError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronfleet/cronfleet.toml", home)
}
