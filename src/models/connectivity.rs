//! Network reachability snapshots

use serde::{Deserialize, Serialize};
use std::fmt;

/// Network transport reported by the connectivity source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Wifi,
    Cellular,
    Ethernet,
    Other,
    #[default]
    None,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Wifi => "wifi",
            Transport::Cellular => "cellular",
            Transport::Ethernet => "ethernet",
            Transport::Other => "other",
            Transport::None => "none",
        };
        f.write_str(name)
    }
}

/// Device connectivity at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ConnectivityState {
    pub connected: bool,
    pub transport: Transport,
}

impl ConnectivityState {
    /// Connected over the given transport
    pub fn online(transport: Transport) -> Self {
        Self {
            connected: true,
            transport,
        }
    }

    /// No usable network
    pub fn offline() -> Self {
        Self {
            connected: false,
            transport: Transport::None,
        }
    }
}

/// A change between two distinct connectivity states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityTransition {
    pub previous: ConnectivityState,
    pub current: ConnectivityState,
}

impl ConnectivityTransition {
    /// Previous state was disconnected and the new state is connected
    pub fn is_reconnect(&self) -> bool {
        !self.previous.connected && self.current.connected
    }
}
