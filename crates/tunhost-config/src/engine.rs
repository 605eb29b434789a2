//! Engine config JSON
//!
//! Builds the flat JSON object the tunnel engine reads at start. Key
//! names and key presence are part of the engine's contract:
//!
//! | Key | Present |
//! |-----|---------|
//! | ClientVersion, PropagationChannelId, SponsorId | always |
//! | RemoteServerListURLs, ObfuscatedServerListRootURLs | always |
//! | RemoteServerListSignaturePublicKey, UpstreamProxyUrl | always |
//! | EmitDiagnosticNotices, EmitDiagnosticNetworkParameters | always |
//! | EgressRegion | always (empty for temporary tunnels) |
//! | Upgrade* | upgrade check requested |
//! | DataRootDirectory, RemoteServerListDownloadFilename, ObfuscatedServerListDownloadDirectory | temporary tunnels |
//! | EstablishTunnelTimeoutSeconds, TunnelWholeDevice | temporary tunnels |
//! | NetworkLatencyMultiplier | timeouts disabled |
//! | TunnelPortForwardTimeoutSeconds | timeouts enabled |
//! | DeviceLocation | location known |

use crate::embedded::EmbeddedValues;
use crate::error::ConfigError;
use crate::tunnel::TunnelConfig;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Response header carrying the version of a downloaded upgrade.
const UPGRADE_VERSION_HEADER: &str = "x-amz-meta-psiphon-client-version";

/// Temporary tunnels give up establishing after this long.
const TEMPORARY_ESTABLISH_TIMEOUT_SECS: u64 = 300;

const PORT_FORWARD_TIMEOUT_SECS: u64 = 30;
const RELAXED_LATENCY_MULTIPLIER: f64 = 3.0;

/// Which kind of tunnel the config is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    /// The user's tunnel
    Primary,
    /// A short-lived helper tunnel (e.g. upgrade download) with its own
    /// data directory under `files_dir/name`
    Temporary { name: String, files_dir: PathBuf },
}

/// Inputs for [`build_engine_config`].
#[derive(Debug, Clone)]
pub struct EngineConfigParams<'a> {
    pub embedded: &'a EmbeddedValues,
    pub config: &'a TunnelConfig,
    pub upstream_proxy_url: String,
    /// Where to store a downloaded upgrade, `None` when no check is due
    pub upgrade_download: Option<PathBuf>,
    pub mode: TunnelMode,
}

/// Serialize the engine config for one run.
pub fn build_engine_config(params: &EngineConfigParams<'_>) -> Result<String, ConfigError> {
    let embedded = params.embedded;
    let config = params.config;
    let mut json = Map::new();

    json.insert("ClientVersion".into(), json!(embedded.client_version));

    if let Some(path) = &params.upgrade_download {
        json.insert("UpgradeDownloadURLs".into(), json!(embedded.upgrade_urls));
        json.insert(
            "UpgradeDownloadClientVersionHeader".into(),
            json!(UPGRADE_VERSION_HEADER),
        );
        json.insert("UpgradeDownloadFilename".into(), path_value(path));
    }

    json.insert(
        "PropagationChannelId".into(),
        json!(embedded.propagation_channel_id),
    );
    json.insert("SponsorId".into(), json!(config.sponsor_id()));
    json.insert(
        "RemoteServerListURLs".into(),
        json!(embedded.remote_server_list_urls),
    );
    json.insert(
        "ObfuscatedServerListRootURLs".into(),
        json!(embedded.obfuscated_server_list_root_urls),
    );
    json.insert(
        "RemoteServerListSignaturePublicKey".into(),
        json!(embedded.remote_server_list_signature_public_key),
    );
    json.insert("UpstreamProxyUrl".into(), json!(params.upstream_proxy_url));
    json.insert("EmitDiagnosticNotices".into(), json!(true));
    json.insert("EmitDiagnosticNetworkParameters".into(), json!(true));

    match &params.mode {
        TunnelMode::Temporary { name, files_dir } => {
            let dir = temporary_dir(files_dir, name)?;
            let osl_dir = dir.join("osl");
            create_dir(&osl_dir)?;

            json.insert("DataRootDirectory".into(), path_value(&dir));
            json.insert(
                "RemoteServerListDownloadFilename".into(),
                path_value(&dir.join("remote_server_list")),
            );
            json.insert(
                "ObfuscatedServerListDownloadDirectory".into(),
                path_value(&osl_dir),
            );
            json.insert(
                "EstablishTunnelTimeoutSeconds".into(),
                json!(TEMPORARY_ESTABLISH_TIMEOUT_SECS),
            );
            json.insert("TunnelWholeDevice".into(), json!(0));
            json.insert("EgressRegion".into(), json!(""));
        }
        TunnelMode::Primary => {
            debug!("EgressRegion: {:?}", config.egress_region);
            json.insert("EgressRegion".into(), json!(config.egress_region));
        }
    }

    if config.disable_timeouts {
        debug!("DisableTimeouts: true");
        json.insert(
            "NetworkLatencyMultiplier".into(),
            json!(RELAXED_LATENCY_MULTIPLIER),
        );
    } else {
        json.insert(
            "TunnelPortForwardTimeoutSeconds".into(),
            json!(PORT_FORWARD_TIMEOUT_SECS),
        );
    }

    if !config.device_location.is_empty() {
        json.insert("DeviceLocation".into(), json!(config.device_location));
    }

    serde_json::to_string(&Value::Object(json))
        .map_err(|e| ConfigError::SerializeError(e.to_string()))
}

fn temporary_dir(files_dir: &Path, name: &str) -> Result<PathBuf, ConfigError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ConfigError::InvalidConfig(format!(
            "invalid temporary tunnel name {:?}",
            name
        )));
    }
    let dir = files_dir.join(name);
    create_dir(&dir)?;
    Ok(dir)
}

fn create_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::io(dir, e))
}

fn path_value(path: &Path) -> Value {
    json!(path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sponsorship::{RestartType, SponsorIds, SponsorshipState};
    use crate::tunnel::BaseConfig;

    fn tunnel_config(region: &str, disable_timeouts: bool, location: &str) -> TunnelConfig {
        TunnelConfig::new(
            1,
            BaseConfig {
                egress_region: region.into(),
                disable_timeouts,
            },
            location,
            SponsorshipState::default(),
            RestartType::Full,
            &SponsorIds::from_embedded(&EmbeddedValues::development()),
        )
    }

    fn build(config: &TunnelConfig, mode: TunnelMode, upgrade: Option<PathBuf>) -> Value {
        let embedded = EmbeddedValues::development();
        let params = EngineConfigParams {
            embedded: &embedded,
            config,
            upstream_proxy_url: "http://proxy.local:3128".into(),
            upgrade_download: upgrade,
            mode,
        };
        serde_json::from_str(&build_engine_config(&params).unwrap()).unwrap()
    }

    #[test]
    fn test_primary_config_keys() {
        let config = tunnel_config("DE", false, "");
        let json = build(&config, TunnelMode::Primary, None);
        let obj = json.as_object().unwrap();

        assert_eq!(obj["EgressRegion"], "DE");
        assert_eq!(obj["SponsorId"], EmbeddedValues::development().sponsor_id.as_str());
        assert_eq!(obj["UpstreamProxyUrl"], "http://proxy.local:3128");
        assert_eq!(obj["TunnelPortForwardTimeoutSeconds"], 30);
        assert_eq!(obj["EmitDiagnosticNotices"], true);
        assert_eq!(
            obj["RemoteServerListURLs"][0]["URL"],
            "https://s3.example.net/server_list_compressed"
        );
        for key in [
            "ClientVersion",
            "PropagationChannelId",
            "ObfuscatedServerListRootURLs",
            "RemoteServerListSignaturePublicKey",
            "EmitDiagnosticNetworkParameters",
        ] {
            assert!(obj.contains_key(key), "missing {}", key);
        }
        for key in [
            "DataRootDirectory",
            "EstablishTunnelTimeoutSeconds",
            "TunnelWholeDevice",
            "NetworkLatencyMultiplier",
            "UpgradeDownloadURLs",
            "DeviceLocation",
        ] {
            assert!(!obj.contains_key(key), "unexpected {}", key);
        }
    }

    #[test]
    fn test_disabled_timeouts_and_location() {
        let config = tunnel_config("", true, "u4pruydqqvj");
        let json = build(&config, TunnelMode::Primary, None);

        assert_eq!(json["NetworkLatencyMultiplier"], 3.0);
        assert!(json.get("TunnelPortForwardTimeoutSeconds").is_none());
        assert_eq!(json["DeviceLocation"], "u4pruydqqvj");
    }

    #[test]
    fn test_temporary_tunnel_overrides() {
        let files_dir = std::env::temp_dir().join(format!("tunhost-engine-{}", std::process::id()));
        let config = tunnel_config("DE", false, "");
        let json = build(
            &config,
            TunnelMode::Temporary {
                name: "upgrade".into(),
                files_dir: files_dir.clone(),
            },
            Some(files_dir.join("upgrade.bin")),
        );

        assert_eq!(json["EgressRegion"], "");
        assert_eq!(json["TunnelWholeDevice"], 0);
        assert_eq!(json["EstablishTunnelTimeoutSeconds"], 300);
        assert!(json["DataRootDirectory"].as_str().unwrap().ends_with("upgrade"));
        assert!(files_dir.join("upgrade").join("osl").is_dir());
        assert_eq!(
            json["UpgradeDownloadClientVersionHeader"],
            "x-amz-meta-psiphon-client-version"
        );

        let _ = std::fs::remove_dir_all(&files_dir);
    }

    #[test]
    fn test_invalid_temporary_name_rejected() {
        let embedded = EmbeddedValues::development();
        let config = tunnel_config("", false, "");
        let params = EngineConfigParams {
            embedded: &embedded,
            config: &config,
            upstream_proxy_url: String::new(),
            upgrade_download: None,
            mode: TunnelMode::Temporary {
                name: "../escape".into(),
                files_dir: std::env::temp_dir(),
            },
        };
        assert!(matches!(
            build_engine_config(&params),
            Err(ConfigError::InvalidConfig(_))
        ));
    }
}
