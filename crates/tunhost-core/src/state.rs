//! Published tunnel state.
//!
//! [`TunnelState`] is produced by the service, flattened into a [`Bundle`]
//! for the `TUNNEL_CONNECTION_STATE` message and rebuilt on the client side.
//! The bundle round-trip is lossless for `Stopped` and `Running`; `Unknown`
//! is a client-local placeholder and is never transmitted.

use crate::bundle::{Bundle, BundleError};
use std::fmt;

const KEY_IS_RUNNING: &str = "isRunning";
const KEY_IS_VPN: &str = "isVpn";
const KEY_NETWORK_STATE: &str = "networkConnectionState";
const KEY_SOCKS_PORT: &str = "listeningLocalSocksProxyPort";
const KEY_HTTP_PORT: &str = "listeningLocalHttpProxyPort";
const KEY_CLIENT_REGION: &str = "clientRegion";
const KEY_SPONSOR_ID: &str = "sponsorId";
const KEY_HOME_PAGES: &str = "homePages";
const KEY_WAITING_FOR_APP: &str = "waitingForApp";

/// Network connection state of a running tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkConnectionState {
    /// Establishing a tunnel
    Connecting,
    /// Tunnel established
    Connected,
    /// No network available, engine is waiting
    WaitingForNetwork,
}

impl NetworkConnectionState {
    /// Wire ordinal.
    pub fn ordinal(&self) -> i32 {
        match self {
            NetworkConnectionState::Connecting => 0,
            NetworkConnectionState::Connected => 1,
            NetworkConnectionState::WaitingForNetwork => 2,
        }
    }

    /// Parse a wire ordinal.
    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(NetworkConnectionState::Connecting),
            1 => Some(NetworkConnectionState::Connected),
            2 => Some(NetworkConnectionState::WaitingForNetwork),
            _ => None,
        }
    }
}

/// Connection details of a running tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionData {
    pub network_state: NetworkConnectionState,
    pub client_region: String,
    pub sponsor_id: String,
    pub listening_socks_port: u16,
    pub listening_http_port: u16,
    /// Only meaningful while `network_state` is `Connected`.
    pub home_pages: Vec<String>,
    pub is_vpn_mode: bool,
    /// Connected, but traffic is not routed until a UI client answers a ping.
    pub waiting_for_app: bool,
}

impl ConnectionData {
    /// Connection data for a run that has just started.
    pub fn connecting(sponsor_id: impl Into<String>, is_vpn_mode: bool) -> Self {
        Self {
            network_state: NetworkConnectionState::Connecting,
            client_region: String::new(),
            sponsor_id: sponsor_id.into(),
            listening_socks_port: 0,
            listening_http_port: 0,
            home_pages: Vec::new(),
            is_vpn_mode,
            waiting_for_app: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.network_state == NetworkConnectionState::Connected
    }
}

/// Tunnel state snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// Not known yet (no service contact)
    Unknown,
    /// No tunnel run is active
    Stopped,
    /// A tunnel run is active
    Running(ConnectionData),
}

impl TunnelState {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, TunnelState::Stopped)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TunnelState::Unknown)
    }

    /// Connection data when running.
    pub fn connection_data(&self) -> Option<&ConnectionData> {
        match self {
            TunnelState::Running(data) => Some(data),
            _ => None,
        }
    }

    /// Flatten into the `TUNNEL_CONNECTION_STATE` bundle.
    pub fn to_bundle(&self) -> Bundle {
        let mut bundle = Bundle::new();
        match self {
            TunnelState::Running(data) => {
                let home_pages = if data.is_connected() {
                    data.home_pages.clone()
                } else {
                    Vec::new()
                };
                bundle
                    .put_bool(KEY_IS_RUNNING, true)
                    .put_bool(KEY_IS_VPN, data.is_vpn_mode)
                    .put_int(KEY_NETWORK_STATE, data.network_state.ordinal())
                    .put_int(KEY_SOCKS_PORT, i32::from(data.listening_socks_port))
                    .put_int(KEY_HTTP_PORT, i32::from(data.listening_http_port))
                    .put_string(KEY_CLIENT_REGION, data.client_region.clone())
                    .put_string(KEY_SPONSOR_ID, data.sponsor_id.clone())
                    .put_string_list(KEY_HOME_PAGES, home_pages)
                    .put_bool(KEY_WAITING_FOR_APP, data.waiting_for_app);
            }
            TunnelState::Stopped | TunnelState::Unknown => {
                bundle.put_bool(KEY_IS_RUNNING, false);
            }
        }
        bundle
    }

    /// Rebuild from a `TUNNEL_CONNECTION_STATE` bundle.
    pub fn from_bundle(bundle: &Bundle) -> Result<Self, BundleError> {
        if !bundle.get_bool(KEY_IS_RUNNING)? {
            return Ok(TunnelState::Stopped);
        }

        let ordinal = bundle.get_int(KEY_NETWORK_STATE)?;
        let network_state = NetworkConnectionState::from_ordinal(ordinal).ok_or_else(|| {
            BundleError::InvalidValue {
                key: KEY_NETWORK_STATE.to_string(),
                reason: format!("unknown ordinal {}", ordinal),
            }
        })?;

        let home_pages = if network_state == NetworkConnectionState::Connected {
            bundle.get_string_list(KEY_HOME_PAGES)?
        } else {
            Vec::new()
        };

        Ok(TunnelState::Running(ConnectionData {
            network_state,
            client_region: bundle.get_string(KEY_CLIENT_REGION)?,
            sponsor_id: bundle.get_string(KEY_SPONSOR_ID)?,
            listening_socks_port: port(bundle, KEY_SOCKS_PORT)?,
            listening_http_port: port(bundle, KEY_HTTP_PORT)?,
            home_pages,
            is_vpn_mode: bundle.get_bool(KEY_IS_VPN)?,
            waiting_for_app: bundle.get_bool_or(KEY_WAITING_FOR_APP, false)?,
        }))
    }
}

fn port(bundle: &Bundle, key: &str) -> Result<u16, BundleError> {
    let raw = bundle.get_int(key)?;
    u16::try_from(raw).map_err(|_| BundleError::InvalidValue {
        key: key.to_string(),
        reason: format!("{} is not a port", raw),
    })
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Unknown => write!(f, "unknown"),
            TunnelState::Stopped => write!(f, "stopped"),
            TunnelState::Running(data) if data.waiting_for_app => {
                write!(f, "running ({:?}, waiting for app)", data.network_state)
            }
            TunnelState::Running(data) => write!(f, "running ({:?})", data.network_state),
        }
    }
}
