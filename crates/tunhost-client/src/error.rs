//! Client bridge errors

use thiserror::Error;
use tunhost_core::MessengerError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not bound to the tunnel service")]
    NotBound,

    #[error("Tunnel service refused to start")]
    StartRefused,

    #[error(transparent)]
    Messenger(#[from] MessengerError),
}
