//! Platform seams for reaching the companion application.

use crate::error::CompanionError;
use crate::manager::{CompanionConnection, StateCallback};
use std::sync::Arc;

/// Package and service-binding operations of the host platform.
///
/// Binding is asynchronous: `bind_state_service` only requests the bind,
/// the outcome arrives later through the [`CompanionConnection`]. The
/// platform may also invoke the connection synchronously from inside
/// `bind_state_service`.
pub trait CompanionPlatform: Send + Sync + 'static {
    fn is_package_installed(&self, package: &str) -> bool;

    /// Signing certificate matches the expected trust anchor.
    fn verify_trusted_package(&self, package: &str) -> bool;

    /// The package exposes a service answering `action`.
    fn resolve_state_service(&self, package: &str, action: &str) -> bool;

    /// Request a bind. `Ok(false)` means the platform refused the request.
    fn bind_state_service(
        &self,
        package: &str,
        action: &str,
        connection: CompanionConnection,
    ) -> Result<bool, CompanionError>;

    fn unbind_state_service(&self);
}

/// The companion's bound state service.
pub trait CompanionStateService: Send + Sync {
    /// Start receiving state payloads through `callback`.
    fn register_client(&self, callback: StateCallback) -> Result<(), CompanionError>;

    fn unregister_client(&self) -> Result<(), CompanionError>;
}

/// Shared handle to a bound service.
pub type StateServiceHandle = Arc<dyn CompanionStateService>;
