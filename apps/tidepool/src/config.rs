use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::coordinator::CoordinatorConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_MATCH_RETRY_MS: u64 = 1000;
const IDENTITY_FILE: &str = "participant_id";
const HOME_DIR_NAME: &str = ".tidepool";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unable to determine home directory; set TIDEPOOL_HOME")]
    NoHomeDirectory,
}

/// Tidepool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Shared store address (defaults to a local Redis)
    pub redis_url: String,
    /// Directory holding the persisted participant id, `None` when neither
    /// `TIDEPOOL_HOME` nor a user home directory is available
    pub home: Option<PathBuf>,
    /// Delay before a failed match attempt is retried
    pub match_retry: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let redis_url = env::var("TIDEPOOL_REDIS_URL")
            .or_else(|_| env::var("REDIS_URL"))
            .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let home = env::var_os("TIDEPOOL_HOME")
            .map(PathBuf::from)
            .or_else(default_home);
        let match_retry = env::var("TIDEPOOL_MATCH_RETRY_MS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_MATCH_RETRY_MS));
        Self {
            redis_url,
            home,
            match_retry,
        }
    }

    pub fn identity_path(&self) -> Result<PathBuf, ConfigError> {
        let home = self.home.as_ref().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(IDENTITY_FILE))
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            match_retry: self.match_retry,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            home: default_home(),
            match_retry: Duration::from_millis(DEFAULT_MATCH_RETRY_MS),
        }
    }
}

fn default_home() -> Option<PathBuf> {
    let base = BaseDirs::new()?;
    Some(base.home_dir().join(HOME_DIR_NAME))
}
