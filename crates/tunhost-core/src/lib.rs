//! tunhost core types
//!
//! Shared vocabulary between the tunnel service process and its UI clients:
//!
//! - [`TunnelState`]: the published tunnel snapshot
//! - [`Bundle`]: string-keyed typed payload used on the IPC boundary
//! - [`ClientToService`] / [`ServiceToClient`]: the messenger protocol
//! - [`DataTransferStats`]: byte counters with time-bucketed history
//! - [`TaskBag`] and [`StopLatch`]: cancellation primitives
//!
//! # Message flow
//!
//! ```text
//! ┌──────────────┐  ClientEnvelope   ┌──────────────────┐
//! │  UI client   │──────────────────▶│  tunnel service  │
//! │  (bridge)    │◀──────────────────│  (actor)         │
//! └──────────────┘  ServiceToClient  └──────────────────┘
//! ```

mod bundle;
mod latch;
mod message;
mod state;
mod stats;
mod tasks;

pub use bundle::{Bundle, BundleError, BundleValue};
pub use latch::StopLatch;
pub use message::{
    ClientEnvelope, ClientToService, IntentAction, Messenger, MessengerError, MessengerId,
    ServiceIntent, ServiceLink, ServiceToClient, EXTRA_ACTION_URLS, EXTRA_HOME_PAGES,
    EXTRA_MESSAGE, EXTRA_REGION, EXTRA_SUBJECT,
};
pub use state::{ConnectionData, NetworkConnectionState, TunnelState};
pub use stats::{Bucket, DataTransferSnapshot, DataTransferStats};
pub use tasks::TaskBag;

/// Region code meaning "best performance" (no explicit egress region).
pub const REGION_CODE_ANY: &str = "";
