//! tunhost configuration
//!
//! Everything that decides how the next tunnel run is configured:
//!
//! - [`ConfigStore`]: persisted user preferences (TOML)
//! - [`EmbeddedValues`]: build-time values (TOML or JSON)
//! - [`SponsorIds`] / [`SponsorshipChange`]: sponsor and restart-type resolution
//! - [`TunnelConfigManager`]: the current [`TunnelConfig`] and its relay
//! - [`build_engine_config`]: the JSON handed to the engine

mod embedded;
mod engine;
mod error;
mod manager;
mod sponsorship;
mod store;
mod tunnel;

pub use embedded::{EmbeddedValues, RemoteUrl};
pub use engine::{build_engine_config, EngineConfigParams, TunnelMode};
pub use error::ConfigError;
pub use manager::TunnelConfigManager;
pub use sponsorship::{
    should_publish, RestartType, SponsorIds, SponsorshipChange, SponsorshipState,
    SubscriptionTier,
};
pub use store::{ConfigStore, Preferences};
pub use tunnel::{BaseConfig, TunnelConfig};
