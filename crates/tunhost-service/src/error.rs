//! Service and engine errors

use tunhost_config::ConfigError;

/// Errors reported by the tunnel engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Application is not prepared for VPN or permission was revoked")]
    VpnNotPrepared,

    #[error("Failed to start tunnel: {0}")]
    StartFailed(String),

    #[error("Failed to restart tunnel: {0}")]
    RestartFailed(String),

    #[error("Failed to route traffic: {0}")]
    RoutingFailed(String),
}

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Tunnel service has shut down")]
    ServiceGone,
}
