//! Host platform seam: notifications, activity launch, service lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use tunhost_core::ServiceIntent;

/// Notification slots owned by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationId {
    /// Ongoing foreground status
    Service,
    /// Connected but waiting for the app to be opened
    OpenApp,
    RegionNotAvailable,
    VpnRevoked,
    UpstreamProxyError,
    UnsafeTrafficAlert,
}

/// A system notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub text: String,
    /// Delivered when the user taps the notification
    pub intent: ServiceIntent,
    pub ongoing: bool,
    pub sound: bool,
    pub vibrate: bool,
}

impl Notification {
    pub fn new(title: impl Into<String>, text: impl Into<String>, intent: ServiceIntent) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            intent,
            ongoing: false,
            sound: false,
            vibrate: false,
        }
    }
}

/// Platform operations the service needs.
pub trait ServicePlatform: Send + Sync + 'static {
    /// Enter the foreground with the status notification.
    fn start_foreground(&self, notification: &Notification);

    fn notify(&self, id: NotificationId, notification: &Notification);

    fn cancel_notification(&self, id: NotificationId);

    /// Start an activity directly. Only possible on platforms that allow
    /// background activity starts; returns `false` if refused.
    fn launch(&self, intent: &ServiceIntent) -> bool;

    fn set_locale(&self, language_code: Option<&str>);

    fn stop_foreground(&self);

    /// Ask the platform to tear the service down.
    fn stop_self(&self);
}

/// Posts notifications, skipping repeats of what is already shown.
pub(crate) struct Notifier {
    platform: Arc<dyn ServicePlatform>,
    shown: HashMap<NotificationId, Notification>,
}

impl Notifier {
    pub fn new(platform: Arc<dyn ServicePlatform>) -> Self {
        Self {
            platform,
            shown: HashMap::new(),
        }
    }

    /// Post `notification` unless identical content is already showing.
    pub fn show(&mut self, id: NotificationId, notification: Notification) -> bool {
        if self.shown.get(&id) == Some(&notification) {
            debug!("Notification {:?} unchanged", id);
            return false;
        }
        self.platform.notify(id, &notification);
        self.shown.insert(id, notification);
        true
    }

    /// Post again even if unchanged (e.g. after a locale change).
    pub fn refresh(&mut self, id: NotificationId) {
        if let Some(notification) = self.shown.get(&id) {
            self.platform.notify(id, notification);
        }
    }

    /// Cancel `id` if it is showing.
    pub fn cancel(&mut self, id: NotificationId) -> bool {
        if self.shown.remove(&id).is_none() {
            return false;
        }
        self.platform.cancel_notification(id);
        true
    }

    /// Post a one-shot alert. Alerts are not tracked, so the same text
    /// is posted again the next time it is raised.
    pub fn alert(&mut self, id: NotificationId, notification: Notification) {
        self.shown.remove(&id);
        self.platform.notify(id, &notification);
    }

    /// Forget the status notification once the foreground ends.
    pub fn forget(&mut self, id: NotificationId) {
        self.shown.remove(&id);
    }
}
