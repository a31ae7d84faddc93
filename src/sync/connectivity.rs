//! Connectivity monitor
//!
//! Folds raw reachability observations into a deduplicated stream of
//! transitions. The current state is always readable synchronously.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnectivityConfig, SharedRemoteConfig};
use crate::models::{ConnectivityState, ConnectivityTransition, Transport};

const TRANSITION_BUFFER: usize = 64;

/// Tracks device connectivity and publishes state changes
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
    transitions: broadcast::Sender<ConnectivityTransition>,
}

impl ConnectivityMonitor {
    /// Create a monitor with a known initial state
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self { state, transitions }
    }

    /// Latest observed state
    pub fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_currently_connected(&self) -> bool {
        self.current().connected
    }

    /// Feed one observation from the connectivity source
    ///
    /// Returns the transition when the observation differs from the current
    /// state; identical observations are swallowed.
    pub fn report(&self, observed: ConnectivityState) -> Option<ConnectivityTransition> {
        let mut transition = None;

        self.state.send_if_modified(|current| {
            if *current == observed {
                return false;
            }
            let change = ConnectivityTransition {
                previous: *current,
                current: observed,
            };
            *current = observed;
            // Published under the state lock so subscribers see transitions in order
            let _ = self.transitions.send(change);
            transition = Some(change);
            true
        });

        match &transition {
            Some(change) => info!(
                connected = change.current.connected,
                transport = %change.current.transport,
                reconnect = change.is_reconnect(),
                "Connectivity changed"
            ),
            None => debug!(
                connected = observed.connected,
                transport = %observed.transport,
                "Connectivity unchanged"
            ),
        }

        transition
    }

    /// Attach to the live transition stream
    ///
    /// Only transitions reported after this call are delivered. Dropping the
    /// subscription unsubscribes.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let state = self.state.subscribe();
        let last = *state.borrow();
        ConnectivitySubscription {
            rx: self.transitions.subscribe(),
            state,
            last,
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.transitions.receiver_count()
    }

    /// Resolve once the device reports a connected state
    pub async fn wait_until_connected(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as self, so the wait only ends on a match
        let _ = rx.wait_for(|state| state.connected).await;
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::offline())
    }
}

/// Live stream of connectivity transitions
///
/// A subscriber that falls behind loses the skipped transitions; it then
/// receives one transition from the last state it saw to the current state,
/// so a flap that nets to no change is not reported.
pub struct ConnectivitySubscription {
    rx: broadcast::Receiver<ConnectivityTransition>,
    state: watch::Receiver<ConnectivityState>,
    last: ConnectivityState,
}

impl ConnectivitySubscription {
    /// Next transition, or `None` once the monitor is gone
    pub async fn next(&mut self) -> Option<ConnectivityTransition> {
        loop {
            match self.rx.recv().await {
                Ok(transition) => {
                    self.last = transition.current;
                    return Some(transition);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Connectivity subscriber lagged, resynchronizing");
                    if let Some(transition) = self.resync() {
                        return Some(transition);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drop queued transitions and summarize them against the current state
    fn resync(&mut self) -> Option<ConnectivityTransition> {
        // Transitions are published under the state lock, so holding the
        // read guard while draining leaves nothing newer than `current` queued
        let current = {
            let guard = self.state.borrow();
            loop {
                match self.rx.try_recv() {
                    Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
            *guard
        };

        if current == self.last {
            return None;
        }
        let transition = ConnectivityTransition {
            previous: self.last,
            current,
        };
        self.last = current;
        Some(transition)
    }
}

/// Periodically probe the remote host and report reachability
///
/// A successful TCP connection within the probe timeout counts as
/// `{connected, Other}`; anything else as offline. The probe stops when
/// `shutdown_rx` fires.
pub fn spawn_reachability_probe(
    monitor: Arc<ConnectivityMonitor>,
    remote: SharedRemoteConfig,
    settings: ConnectivityConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(settings.probe_interval_secs));
        let timeout = Duration::from_millis(settings.probe_timeout_ms);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Reachability probe shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let base_url = remote.snapshot().await.base_url;
                    let state = probe_once(&base_url, timeout).await;
                    monitor.report(state);
                }
            }
        }
    })
}

/// One reachability check against the host of `base_url`
pub async fn probe_once(base_url: &str, timeout: Duration) -> ConnectivityState {
    let Some(addr) = probe_address(base_url) else {
        warn!(base_url = base_url, "Cannot derive probe address from base URL");
        return ConnectivityState::offline();
    };

    match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(_)) => ConnectivityState::online(Transport::Other),
        Ok(Err(err)) => {
            debug!(addr = %addr, error = %err, "Probe connection failed");
            ConnectivityState::offline()
        }
        Err(_) => {
            debug!(addr = %addr, "Probe timed out");
            ConnectivityState::offline()
        }
    }
}

fn probe_address(base_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}
