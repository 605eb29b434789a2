//! Companion binding errors

/// Errors raised while checking or binding the companion state service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompanionError {
    /// Package signature or platform security check failed
    #[error("Security error: {0}")]
    Security(String),

    /// Package missing or unusable
    #[error("Package error: {0}")]
    Package(String),

    /// Bind request or client registration failed
    #[error("Binding error: {0}")]
    Binding(String),
}

impl CompanionError {
    /// Only binding failures can heal on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompanionError::Binding(_))
    }
}
