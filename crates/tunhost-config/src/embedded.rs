//! Build-time embedded values
//!
//! Values that ship with a client build: version, propagation channel,
//! sponsor identifiers and server list locations. Loaded from a TOML or
//! JSON file so that different builds can share one binary.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A remote URL entry as the engine expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUrl {
    #[serde(rename = "URL")]
    pub url: String,
    /// Only use this URL after this many failed attempts
    #[serde(rename = "OnlyAfterAttempts", default)]
    pub only_after_attempts: u32,
    /// Skip TLS verification (server lists are signed)
    #[serde(rename = "SkipVerify", default)]
    pub skip_verify: bool,
}

impl RemoteUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            only_after_attempts: 0,
            skip_verify: false,
        }
    }
}

/// Embedded build values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedValues {
    /// Client build version, reported to the network
    pub client_version: String,
    /// Distribution channel identifier
    pub propagation_channel_id: String,
    /// Default sponsor
    pub sponsor_id: String,
    /// Sponsor while a subscription is active
    pub subscription_sponsor_id: String,
    /// Sponsor while speed boost is authorized
    pub speed_boost_sponsor_id: String,
    /// Sponsor while the companion relay is running
    pub companion_running_sponsor_id: String,
    #[serde(default)]
    pub remote_server_list_urls: Vec<RemoteUrl>,
    #[serde(default)]
    pub obfuscated_server_list_root_urls: Vec<RemoteUrl>,
    #[serde(default)]
    pub remote_server_list_signature_public_key: String,
    #[serde(default)]
    pub upgrade_urls: Vec<RemoteUrl>,
    /// Encoded server entries shipped with the build
    #[serde(default)]
    pub embedded_server_entries: Vec<String>,
}

impl EmbeddedValues {
    /// Load from a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Server entries in the newline-separated form the engine imports.
    pub fn server_entries(&self) -> String {
        let mut list = String::new();
        for entry in &self.embedded_server_entries {
            list.push_str(entry);
            list.push('\n');
        }
        list
    }

    /// Placeholder values for local runs and tests.
    pub fn development() -> Self {
        Self {
            client_version: "1".to_string(),
            propagation_channel_id: "DEV0000000000000".to_string(),
            sponsor_id: "DEFAULT0SPONSOR0".to_string(),
            subscription_sponsor_id: "SUBSCRIPTION0000".to_string(),
            speed_boost_sponsor_id: "SPEEDBOOST000000".to_string(),
            companion_running_sponsor_id: "COMPANION0000000".to_string(),
            remote_server_list_urls: vec![RemoteUrl::new(
                "https://s3.example.net/server_list_compressed",
            )],
            obfuscated_server_list_root_urls: vec![RemoteUrl::new("https://s3.example.net/osl")],
            remote_server_list_signature_public_key: String::new(),
            upgrade_urls: Vec::new(),
            embedded_server_entries: Vec::new(),
        }
    }
}
