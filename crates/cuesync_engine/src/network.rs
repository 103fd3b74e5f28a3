//! Connectivity collaborator.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Current network status as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// No network.
    Offline,
    /// Online over a metered connection.
    Metered,
    /// Online over an unmetered connection.
    Unmetered,
}

impl NetworkStatus {
    /// Returns true for any online status.
    pub fn is_online(&self) -> bool {
        !matches!(self, NetworkStatus::Offline)
    }

    fn to_code(self) -> u8 {
        match self {
            NetworkStatus::Offline => 0,
            NetworkStatus::Metered => 1,
            NetworkStatus::Unmetered => 2,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => NetworkStatus::Metered,
            2 => NetworkStatus::Unmetered,
            _ => NetworkStatus::Offline,
        }
    }
}

/// Reports whether the device can reach the network.
pub trait Connectivity: Send + Sync {
    /// Current status.
    fn status(&self) -> NetworkStatus;
}

/// Connectivity set by the host, e.g. from platform callbacks.
///
/// Going from offline to online notifies the waker returned by
/// [`ManualConnectivity::waker`], which the scheduler listens on.
#[derive(Debug)]
pub struct ManualConnectivity {
    status: AtomicU8,
    waker: Arc<Notify>,
}

impl ManualConnectivity {
    /// Creates connectivity with an initial status.
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: AtomicU8::new(status.to_code()),
            waker: Arc::new(Notify::new()),
        }
    }

    /// Updates the status.
    pub fn set_status(&self, status: NetworkStatus) {
        let previous = NetworkStatus::from_code(self.status.swap(status.to_code(), Ordering::SeqCst));
        if !previous.is_online() && status.is_online() {
            self.waker.notify_one();
        }
    }

    /// Signal fired when connectivity is regained.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.waker)
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(NetworkStatus::Unmetered)
    }
}

impl Connectivity for ManualConnectivity {
    fn status(&self) -> NetworkStatus {
        NetworkStatus::from_code(self.status.load(Ordering::SeqCst))
    }
}
