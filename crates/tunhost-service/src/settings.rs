//! Service settings
//!
//! Host-environment knobs of the tunnel service. None of these are user
//! preferences; they describe the platform the service runs on.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunhost_config::ConfigError;

/// First platform release that forbids starting activities from the
/// background.
pub const DEFAULT_REACHABILITY_REQUIRED_SINCE: u32 = 29;

/// Service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Route the whole device (VPN) rather than offering local proxies only
    pub vpn_mode: bool,
    /// Release number of the host platform
    pub platform_version: u32,
    /// From this release on, routing and intent delivery wait for a UI
    /// client to answer a ping
    pub reachability_required_since: u32,
    /// How long to wait for a ping answer before falling back to a
    /// notification
    pub ping_timeout_ms: u64,
    /// Period of `DATA_TRANSFER_STATS` broadcasts while a run is active
    pub stats_interval_ms: u64,
    /// Where the engine may store a downloaded upgrade, `None` disables
    /// upgrade checks
    pub upgrade_download: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            vpn_mode: true,
            platform_version: DEFAULT_REACHABILITY_REQUIRED_SINCE,
            reachability_required_since: DEFAULT_REACHABILITY_REQUIRED_SINCE,
            ping_timeout_ms: 2000,
            stats_interval_ms: 1000,
            upgrade_download: None,
        }
    }
}

impl ServiceSettings {
    /// Load from a TOML file. A missing file yields defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Whether a UI client must prove it is reachable before the service
    /// routes traffic or hands it an intent.
    pub fn requires_reachable_client(&self) -> bool {
        self.platform_version >= self.reachability_required_since
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}
