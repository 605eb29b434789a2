//! Tunnel configuration manager
//!
//! Holds the single current [`TunnelConfig`] and republishes it when a
//! sponsorship input changes in a way that alters effective behavior.
//!
//! ```text
//!  subscription ─┐
//!  speed boost  ─┼─▶ SponsorshipChange ─▶ publish gate ─▶ watch relay ─▶ service
//!  companion    ─┘        (apply)        (tier/sponsor)   (latest value)
//! ```
//!
//! The relay always holds the latest state, even when the gate decides
//! not to notify; subscribers are only woken for published changes.

use crate::embedded::EmbeddedValues;
use crate::error::ConfigError;
use crate::sponsorship::{
    should_publish, RestartType, SponsorIds, SponsorshipChange, SponsorshipState,
    SubscriptionTier,
};
use crate::store::ConfigStore;
use crate::tunnel::{BaseConfig, TunnelConfig};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tunhost_core::REGION_CODE_ANY;

/// Process-scoped owner of the effective tunnel configuration.
pub struct TunnelConfigManager {
    store: Arc<ConfigStore>,
    sponsors: SponsorIds,
    relay: watch::Sender<Option<TunnelConfig>>,
}

impl TunnelConfigManager {
    pub fn new(store: Arc<ConfigStore>, embedded: &EmbeddedValues) -> Self {
        let mut sponsors = SponsorIds::from_embedded(embedded);
        if let Some(sponsor) = store.sponsor_override() {
            info!("Using sponsor override {}", sponsor);
            sponsors = sponsors.with_default(sponsor);
        }
        let (relay, _) = watch::channel(None);
        Self {
            store,
            sponsors,
            relay,
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn sponsors(&self) -> &SponsorIds {
        &self.sponsors
    }

    /// Build the initial configuration from persisted preferences and the
    /// four external signals, then publish it with a full restart type.
    pub async fn init_configuration<A, B, C, D>(
        &self,
        speed_boost: A,
        companion_running: B,
        device_location: C,
        subscription: D,
    ) -> Result<TunnelConfig, ConfigError>
    where
        A: Future<Output = bool>,
        B: Future<Output = bool>,
        C: Future<Output = String>,
        D: Future<Output = SubscriptionTier>,
    {
        let (base, has_speed_boost_auth, is_companion_running, device_location, subscription_tier) = tokio::join!(
            self.load_base_config(),
            speed_boost,
            companion_running,
            device_location,
            subscription
        );

        let sponsorship = SponsorshipState {
            subscription_tier,
            has_speed_boost_auth,
            is_companion_running,
        };
        let version = self.relay.borrow().as_ref().map_or(1, |c| c.version + 1);
        let config = TunnelConfig::new(
            version,
            base?,
            device_location,
            sponsorship,
            RestartType::Full,
            &self.sponsors,
        );

        info!(
            "Tunnel config v{} initialized: region={:?} sponsor={}",
            config.version,
            config.egress_region,
            config.sponsor_id()
        );
        self.relay.send_replace(Some(config.clone()));
        Ok(config)
    }

    /// Always warrants a full restart when published.
    pub fn update_subscription_state(&self, tier: SubscriptionTier) -> bool {
        self.apply(SponsorshipChange::Subscription(tier))
    }

    /// Always warrants a full restart when published.
    pub fn update_speed_boost_state(&self, authorized: bool) -> bool {
        self.apply(SponsorshipChange::SpeedBoost(authorized))
    }

    /// Quiet unless `has_enforcement` demands a visible reconnect.
    pub fn update_companion_state_conditional(&self, is_running: bool, has_enforcement: bool) -> bool {
        self.apply(SponsorshipChange::Companion {
            running: is_running,
            enforcement: has_enforcement,
        })
    }

    /// Apply a sponsorship change. Returns `true` if subscribers were notified.
    fn apply(&self, change: SponsorshipChange) -> bool {
        self.relay.send_if_modified(|current| {
            let Some(config) = current.as_ref() else {
                debug!("Ignoring {:?}: tunnel config not initialized", change);
                return false;
            };

            let next_state = change.apply(&config.sponsorship);
            if next_state == config.sponsorship {
                return false;
            }

            let publish = should_publish(&self.sponsors, &config.sponsorship, &next_state);
            let version = if publish {
                config.version + 1
            } else {
                config.version
            };
            let next =
                config.with_sponsorship(version, next_state, change.restart_type(), &self.sponsors);

            if publish {
                info!(
                    "Tunnel config v{} published: sponsor={} restart={}",
                    next.version,
                    next.sponsor_id(),
                    next.restart_type
                );
            } else {
                debug!("Tunnel config updated without effective change: {:?}", change);
            }
            *current = Some(next);
            publish
        })
    }

    /// Subscribe to published configurations.
    ///
    /// The receiver starts with the current value marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<Option<TunnelConfig>> {
        self.relay.subscribe()
    }

    pub fn current(&self) -> Option<TunnelConfig> {
        self.relay.borrow().clone()
    }

    /// Wait for initialization, then return the current config with
    /// freshly read persisted values.
    pub async fn effective_config(&self) -> Result<TunnelConfig, ConfigError> {
        let mut rx = self.relay.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .map_err(|_| ConfigError::NotInitialized)?;
        self.refresh_base_config().await
    }

    /// Re-read persisted values into the current config without notifying.
    pub async fn refresh_base_config(&self) -> Result<TunnelConfig, ConfigError> {
        let base = self.load_base_config().await?;
        let mut refreshed = None;
        self.relay.send_if_modified(|current| {
            if let Some(config) = current.as_mut() {
                *config = config.with_base(base);
                refreshed = Some(config.clone());
            }
            false
        });
        refreshed.ok_or(ConfigError::NotInitialized)
    }

    pub fn egress_region(&self) -> String {
        self.relay
            .borrow()
            .as_ref()
            .map_or_else(|| REGION_CODE_ANY.to_string(), |c| c.egress_region.clone())
    }

    pub fn sponsor_id(&self) -> String {
        self.relay
            .borrow()
            .as_ref()
            .map_or_else(|| self.sponsors.default.clone(), |c| c.sponsor_id().to_string())
    }

    pub fn disable_timeouts(&self) -> bool {
        self.relay.borrow().as_ref().is_some_and(|c| c.disable_timeouts)
    }

    pub fn device_location(&self) -> String {
        self.relay
            .borrow()
            .as_ref()
            .map(|c| c.device_location.clone())
            .unwrap_or_default()
    }

    pub fn is_speed_boost_active(&self) -> bool {
        self.relay
            .borrow()
            .as_ref()
            .is_some_and(|c| c.sponsorship.has_speed_boost_auth)
    }

    pub fn is_subscription_active(&self) -> bool {
        self.relay
            .borrow()
            .as_ref()
            .is_some_and(|c| c.sponsorship.subscription_tier.is_active())
    }

    pub fn is_companion_running_active(&self) -> bool {
        self.relay
            .borrow()
            .as_ref()
            .is_some_and(|c| c.sponsorship.is_companion_running)
    }

    async fn load_base_config(&self) -> Result<BaseConfig, ConfigError> {
        let store = Arc::clone(&self.store);
        let loaded = tokio::task::spawn_blocking(move || -> Result<BaseConfig, ConfigError> {
            store.reload()?;
            Ok(BaseConfig::from_store(&store))
        })
        .await
        .map_err(|e| ConfigError::LoadFailed(e.to_string()))
        .and_then(|result| result);

        if let Err(e) = &loaded {
            error!("Error loading base config: {}", e);
        }
        loaded
    }
}
