//! tunhost service
//!
//! The tunnel service process: supervises one engine run at a time,
//! translates engine callbacks into published [`TunnelState`], serves any
//! number of UI clients over the messenger protocol and delivers intents
//! and notifications.
//!
//! [`TunnelState`]: tunhost_core::TunnelState

mod actor;
mod context;
mod engine;
mod error;
mod feeds;
mod platform;
mod registry;
mod run;
mod service;
mod settings;

pub use context::ServiceContext;
pub use engine::{EngineHost, TunnelEngine, DIAGNOSTIC_TARGET};
pub use error::{EngineError, ServiceError};
pub use feeds::spawn_companion_feed;
pub use platform::{Notification, NotificationId, ServicePlatform};
pub use service::{StartCommand, TunnelService};
pub use settings::{ServiceSettings, DEFAULT_REACHABILITY_REQUIRED_SINCE};
