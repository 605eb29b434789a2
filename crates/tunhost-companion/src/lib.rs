//! tunhost companion
//!
//! Observes whether the companion relay application is running, through a
//! state service it exposes to trusted peers. The observed state feeds the
//! sponsorship inputs of the tunnel configuration.

mod error;
mod manager;
mod platform;
mod state;

pub use error::CompanionError;
pub use manager::{CompanionConnection, CompanionSettings, CompanionStateManager, StateCallback};
pub use platform::{CompanionPlatform, CompanionStateService, StateServiceHandle};
pub use state::CompanionState;
