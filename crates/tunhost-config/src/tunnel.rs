//! Effective tunnel configuration value.

use crate::sponsorship::{RestartType, SponsorIds, SponsorshipState};
use crate::store::ConfigStore;

/// Persisted part of the tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseConfig {
    pub egress_region: String,
    pub disable_timeouts: bool,
}

impl BaseConfig {
    /// Read from the preference store.
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            egress_region: store.egress_region(),
            disable_timeouts: store.disable_timeouts(),
        }
    }
}

/// Effective tunnel configuration.
///
/// Immutable once built; updates produce a new value. `sponsor_id` is
/// derived from `sponsorship` at construction and cannot drift from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Incremented on every published change
    pub version: u64,
    pub egress_region: String,
    pub disable_timeouts: bool,
    /// Coarse device location, empty when unknown
    pub device_location: String,
    pub sponsorship: SponsorshipState,
    /// How the change that produced this value should restart a run
    pub restart_type: RestartType,
    sponsor_id: String,
}

impl TunnelConfig {
    pub fn new(
        version: u64,
        base: BaseConfig,
        device_location: impl Into<String>,
        sponsorship: SponsorshipState,
        restart_type: RestartType,
        sponsors: &SponsorIds,
    ) -> Self {
        Self {
            version,
            egress_region: base.egress_region,
            disable_timeouts: base.disable_timeouts,
            device_location: device_location.into(),
            sponsor_id: sponsors.resolve(&sponsorship).to_string(),
            sponsorship,
            restart_type,
        }
    }

    pub fn sponsor_id(&self) -> &str {
        &self.sponsor_id
    }

    pub fn base(&self) -> BaseConfig {
        BaseConfig {
            egress_region: self.egress_region.clone(),
            disable_timeouts: self.disable_timeouts,
        }
    }

    /// Same config with a different sponsorship state.
    pub(crate) fn with_sponsorship(
        &self,
        version: u64,
        sponsorship: SponsorshipState,
        restart_type: RestartType,
        sponsors: &SponsorIds,
    ) -> Self {
        Self::new(
            version,
            self.base(),
            self.device_location.clone(),
            sponsorship,
            restart_type,
            sponsors,
        )
    }

    /// Same config with freshly read persisted values.
    pub(crate) fn with_base(&self, base: BaseConfig) -> Self {
        Self {
            egress_region: base.egress_region,
            disable_timeouts: base.disable_timeouts,
            ..self.clone()
        }
    }
}
