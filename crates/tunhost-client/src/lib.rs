//! tunhost client bridge
//!
//! Runs inside each UI process. Binds to the tunnel service, registers an
//! inbox and turns the raw message protocol into typed streams:
//!
//! - tunnel state, latest value only, deduplicated
//! - data transfer statistics
//! - one-shot events (known regions, exchange results, intents, restarts)

mod bridge;
mod error;

pub use bridge::{BridgeEvent, ServiceClientBridge, ServiceConnector};
pub use error::ClientError;
