/// Configuration management for roster-warden
use crate::error::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Lowest acceptable roster poll interval. Anything shorter hammers the
/// directory service for no benefit.
pub const MIN_POLL_INTERVAL_SECS: u64 = 30;

/// Service configuration, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Full URL of the group roster, e.g.
    /// `https://directory.example.com/groups/my-clan`
    pub group_url: String,
    /// Seconds between roster polls (>= 30)
    pub group_poll_interval_secs: u64,
    /// Identity cache database file
    pub cache_file: PathBuf,
    /// Access list database file
    pub acl_file: PathBuf,
    /// Port for the lookup service to listen on (localhost only)
    pub service_port: u16,
    /// Statically allowed members: display name -> account id
    #[serde(default)]
    pub allowed: HashMap<String, String>,
    /// Statically denied members: display name -> account id
    #[serde(default)]
    pub denied: HashMap<String, String>,
}

impl Config {
    /// Load configuration from the file named by `WARDEN_CONFIG`, the
    /// first CLI argument, or `config.json`, in that order of preference.
    pub fn load() -> WardenResult<Self> {
        dotenv::dotenv().ok();

        let path = env::var("WARDEN_CONFIG")
            .ok()
            .or_else(|| env::args().nth(1))
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        Self::from_file(Path::new(&path))
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> WardenResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            WardenError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> WardenResult<()> {
        if self.group_url.trim().is_empty() {
            return Err(WardenError::Config("group_url cannot be empty".to_string()));
        }

        if self.group_poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(WardenError::Config(format!(
                "group_poll_interval_secs is too short ({} secs, minimum {})",
                self.group_poll_interval_secs, MIN_POLL_INTERVAL_SECS
            )));
        }

        if self.service_port == 0 {
            return Err(WardenError::Config("service_port cannot be 0".to_string()));
        }

        Ok(())
    }

    /// Roster id: the last path segment of `group_url`
    pub fn roster_id(&self) -> &str {
        self.group_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.group_url)
    }

    /// Directory service base URL: everything before `/groups/`.
    /// Falls back to the full group URL when the marker is absent.
    pub fn directory_base(&self) -> &str {
        match self.group_url.split_once("/groups/") {
            Some((base, _)) => base,
            None => &self.group_url,
        }
    }
}
