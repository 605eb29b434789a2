//! Sponsorship resolution
//!
//! The sponsor a tunnel runs under is a pure function of the user's
//! sponsorship state. Priority, highest first:
//!
//! 1. subscription (limited or unlimited)
//! 2. speed boost authorization
//! 3. companion relay running
//! 4. embedded default
//!
//! The kind of restart a sponsorship change warrants is decided here as
//! well, so the config manager only has to apply the result.

use crate::embedded::EmbeddedValues;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    None,
    Limited,
    Unlimited,
}

impl SubscriptionTier {
    pub fn is_active(&self) -> bool {
        !matches!(self, SubscriptionTier::None)
    }
}

/// Inputs that decide the sponsor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SponsorshipState {
    pub subscription_tier: SubscriptionTier,
    pub has_speed_boost_auth: bool,
    pub is_companion_running: bool,
}

/// How a configuration change reaches the running tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartType {
    /// Visible reconnect: clients see Connecting and drop browser views
    Full,
    /// Seamless reconnect with no visible state change
    Quiet,
}

impl fmt::Display for RestartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartType::Full => write!(f, "full"),
            RestartType::Quiet => write!(f, "quiet"),
        }
    }
}

/// Sponsor identifiers for each sponsorship source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorIds {
    pub default: String,
    pub subscription: String,
    pub speed_boost: String,
    pub companion_running: String,
}

impl SponsorIds {
    pub fn from_embedded(values: &EmbeddedValues) -> Self {
        Self {
            default: values.sponsor_id.clone(),
            subscription: values.subscription_sponsor_id.clone(),
            speed_boost: values.speed_boost_sponsor_id.clone(),
            companion_running: values.companion_running_sponsor_id.clone(),
        }
    }

    /// Replace the default sponsor (user or build override).
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = default.into();
        self
    }

    /// Sponsor for `state`.
    pub fn resolve(&self, state: &SponsorshipState) -> &str {
        match state.subscription_tier {
            SubscriptionTier::Unlimited | SubscriptionTier::Limited => &self.subscription,
            SubscriptionTier::None if state.has_speed_boost_auth => &self.speed_boost,
            SubscriptionTier::None if state.is_companion_running => &self.companion_running,
            SubscriptionTier::None => &self.default,
        }
    }
}

/// A single change to the sponsorship inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SponsorshipChange {
    Subscription(SubscriptionTier),
    SpeedBoost(bool),
    Companion { running: bool, enforcement: bool },
}

impl SponsorshipChange {
    /// New state with this change applied and every other field held.
    pub fn apply(&self, state: &SponsorshipState) -> SponsorshipState {
        let mut next = *state;
        match *self {
            SponsorshipChange::Subscription(tier) => next.subscription_tier = tier,
            SponsorshipChange::SpeedBoost(authorized) => next.has_speed_boost_auth = authorized,
            SponsorshipChange::Companion { running, .. } => next.is_companion_running = running,
        }
        next
    }

    /// Subscription and speed boost changes always reconnect visibly.
    /// Companion changes stay quiet unless an enforcement condition applies.
    pub fn restart_type(&self) -> RestartType {
        match self {
            SponsorshipChange::Subscription(_) | SponsorshipChange::SpeedBoost(_) => {
                RestartType::Full
            }
            SponsorshipChange::Companion {
                enforcement: true, ..
            } => RestartType::Full,
            SponsorshipChange::Companion {
                enforcement: false, ..
            } => RestartType::Quiet,
        }
    }
}

/// Whether moving from `current` to `next` changes effective behavior.
pub fn should_publish(
    sponsors: &SponsorIds,
    current: &SponsorshipState,
    next: &SponsorshipState,
) -> bool {
    current.subscription_tier != next.subscription_tier
        || sponsors.resolve(current) != sponsors.resolve(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sponsors() -> SponsorIds {
        SponsorIds {
            default: "DEFAULT".into(),
            subscription: "SUB".into(),
            speed_boost: "BOOST".into(),
            companion_running: "COMPANION".into(),
        }
    }

    fn state(tier: SubscriptionTier, boost: bool, companion: bool) -> SponsorshipState {
        SponsorshipState {
            subscription_tier: tier,
            has_speed_boost_auth: boost,
            is_companion_running: companion,
        }
    }

    #[test]
    fn test_resolve_priority() {
        let ids = sponsors();
        assert_eq!(ids.resolve(&state(SubscriptionTier::Unlimited, true, true)), "SUB");
        assert_eq!(ids.resolve(&state(SubscriptionTier::Limited, true, true)), "SUB");
        assert_eq!(ids.resolve(&state(SubscriptionTier::None, true, true)), "BOOST");
        assert_eq!(ids.resolve(&state(SubscriptionTier::None, false, true)), "COMPANION");
        assert_eq!(ids.resolve(&state(SubscriptionTier::None, false, false)), "DEFAULT");
    }

    #[test]
    fn test_apply_holds_other_fields() {
        let base = state(SubscriptionTier::Limited, true, false);
        let next = SponsorshipChange::Companion {
            running: true,
            enforcement: false,
        }
        .apply(&base);
        assert_eq!(next, state(SubscriptionTier::Limited, true, true));
    }

    #[test]
    fn test_restart_types() {
        assert_eq!(
            SponsorshipChange::Subscription(SubscriptionTier::None).restart_type(),
            RestartType::Full
        );
        assert_eq!(SponsorshipChange::SpeedBoost(true).restart_type(), RestartType::Full);
        assert_eq!(
            SponsorshipChange::Companion {
                running: true,
                enforcement: false
            }
            .restart_type(),
            RestartType::Quiet
        );
        assert_eq!(
            SponsorshipChange::Companion {
                running: true,
                enforcement: true
            }
            .restart_type(),
            RestartType::Full
        );
    }

    #[test]
    fn test_publish_gate() {
        let ids = sponsors();
        // Companion toggles under a subscription: sponsor unchanged.
        assert!(!should_publish(
            &ids,
            &state(SubscriptionTier::Unlimited, false, false),
            &state(SubscriptionTier::Unlimited, false, true),
        ));
        // Tier change with the same sponsor still publishes.
        assert!(should_publish(
            &ids,
            &state(SubscriptionTier::Limited, false, false),
            &state(SubscriptionTier::Unlimited, false, false),
        ));
        // Sponsor change publishes.
        assert!(should_publish(
            &ids,
            &state(SubscriptionTier::None, false, false),
            &state(SubscriptionTier::None, true, false),
        ));
    }
}
