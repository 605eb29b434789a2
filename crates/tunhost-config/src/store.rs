//! Persisted user preferences
//!
//! A flat TOML document holding what the user chose (region, timeouts,
//! app exclusions) and what the service learned (known regions, last
//! proxy port). Every setter writes through to disk when the store is
//! file-backed.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};
use tunhost_core::REGION_CODE_ANY;

/// Preference document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Selected egress region, empty for "any"
    pub egress_region: String,
    /// Relax network timeouts for slow networks
    pub disable_timeouts: bool,
    /// Comma-joined regions last reported by the engine
    pub known_regions: String,
    /// Comma-joined application ids excluded from the VPN
    pub vpn_excluded_apps: String,
    pub notification_sound: bool,
    pub notification_vibrate: bool,
    /// Upstream proxy the engine must dial through, empty for none
    pub upstream_proxy_url: String,
    /// Last local HTTP proxy port the engine listened on
    pub last_http_proxy_port: u16,
    /// Replaces the embedded default sponsor when set
    pub sponsor_override: Option<String>,
    /// UI language, `None` follows the system
    pub language_code: Option<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            egress_region: REGION_CODE_ANY.to_string(),
            disable_timeouts: false,
            known_regions: String::new(),
            vpn_excluded_apps: String::new(),
            notification_sound: false,
            notification_vibrate: false,
            upstream_proxy_url: String::new(),
            last_http_proxy_port: 0,
            sponsor_override: None,
            language_code: None,
        }
    }
}

/// Key-value preference store.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    prefs: RwLock<Preferences>,
}

impl ConfigStore {
    /// Open a file-backed store. A missing file starts from defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let prefs = Self::read_file(&path)?;
        debug!("Loaded preferences from {}", path.display());
        Ok(Self {
            path: Some(path),
            prefs: RwLock::new(prefs),
        })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_preferences(Preferences::default())
    }

    pub fn with_preferences(prefs: Preferences) -> Self {
        Self {
            path: None,
            prefs: RwLock::new(prefs),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file, picking up writes from other processes.
    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            let prefs = Self::read_file(path)?;
            *self.write() = prefs;
        }
        Ok(())
    }

    /// Copy of the current preferences.
    pub fn snapshot(&self) -> Preferences {
        self.read().clone()
    }

    /// Mutate preferences and persist the result.
    pub fn update<F>(&self, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Preferences),
    {
        let mut prefs = self.write();
        mutate(&mut prefs);
        self.persist(&prefs)
    }

    /// Selected egress region; blank values read as "any".
    pub fn egress_region(&self) -> String {
        let region = self.read().egress_region.trim().to_string();
        if region.is_empty() {
            REGION_CODE_ANY.to_string()
        } else {
            region
        }
    }

    pub fn set_egress_region(&self, region: &str) -> Result<(), ConfigError> {
        self.update(|p| p.egress_region = region.to_string())
    }

    pub fn disable_timeouts(&self) -> bool {
        self.read().disable_timeouts
    }

    pub fn known_regions(&self) -> Vec<String> {
        split_list(&self.read().known_regions)
    }

    pub fn set_known_regions(&self, regions: &[String]) -> Result<(), ConfigError> {
        let joined = regions.join(",");
        self.update(|p| p.known_regions = joined)
    }

    /// Applications excluded from the VPN.
    pub fn excluded_apps(&self) -> Vec<String> {
        split_list(&self.read().vpn_excluded_apps)
    }

    pub fn upstream_proxy_url(&self) -> String {
        self.read().upstream_proxy_url.clone()
    }

    pub fn set_last_http_proxy_port(&self, port: u16) -> Result<(), ConfigError> {
        self.update(|p| p.last_http_proxy_port = port)
    }

    pub fn last_http_proxy_port(&self) -> u16 {
        self.read().last_http_proxy_port
    }

    /// Notification alert flags (sound, vibrate).
    pub fn notification_alerts(&self) -> (bool, bool) {
        let prefs = self.read();
        (prefs.notification_sound, prefs.notification_vibrate)
    }

    pub fn sponsor_override(&self) -> Option<String> {
        self.read()
            .sponsor_override
            .clone()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn language_code(&self) -> Option<String> {
        self.read().language_code.clone()
    }

    pub fn set_language_code(&self, code: Option<String>) -> Result<(), ConfigError> {
        self.update(|p| p.language_code = code)
    }

    fn read_file(path: &Path) -> Result<Preferences, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Preferences::default()),
            Err(e) => Err(ConfigError::io(path, e)),
        }
    }

    fn persist(&self, prefs: &Preferences) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content =
            toml::to_string_pretty(prefs).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }
        std::fs::write(path, content).map_err(|e| {
            warn!("Failed to persist preferences: {}", e);
            ConfigError::io(path, e)
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Preferences> {
        self.prefs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Preferences> {
        self.prefs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn split_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("tunhost-store-{}-{}", std::process::id(), name))
            .join("prefs.toml")
    }

    #[test]
    fn test_defaults() {
        let store = ConfigStore::in_memory();
        assert_eq!(store.egress_region(), REGION_CODE_ANY);
        assert!(!store.disable_timeouts());
        assert!(store.known_regions().is_empty());
        assert!(store.sponsor_override().is_none());
    }

    #[test]
    fn test_blank_region_reads_as_any() {
        let store = ConfigStore::in_memory();
        store.set_egress_region("   ").unwrap();
        assert_eq!(store.egress_region(), REGION_CODE_ANY);
    }

    #[test]
    fn test_lists_are_comma_joined() {
        let store = ConfigStore::in_memory();
        store
            .set_known_regions(&["CA".to_string(), "DE".to_string(), "US".to_string()])
            .unwrap();
        assert_eq!(store.snapshot().known_regions, "CA,DE,US");
        assert_eq!(store.known_regions(), vec!["CA", "DE", "US"]);

        store
            .update(|p| p.vpn_excluded_apps = "org.example.a, ,org.example.b".into())
            .unwrap();
        assert_eq!(store.excluded_apps(), vec!["org.example.a", "org.example.b"]);
    }

    #[test]
    fn test_file_round_trip_and_reload() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let store = ConfigStore::open(&path).unwrap();
        store.set_egress_region("DE").unwrap();
        store.set_last_http_proxy_port(8118).unwrap();

        let other = ConfigStore::open(&path).unwrap();
        assert_eq!(other.egress_region(), "DE");
        assert_eq!(other.last_http_proxy_port(), 8118);

        other.set_egress_region(REGION_CODE_ANY).unwrap();
        store.reload().unwrap();
        assert_eq!(store.egress_region(), REGION_CODE_ANY);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let path = temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "egress_region = [").unwrap();

        assert!(matches!(
            ConfigStore::open(&path),
            Err(ConfigError::ParseError(_))
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
