//! Connectivity as an injected collaborator.

use std::fmt::Debug;
use tokio::sync::watch;

/// Reports whether the remote endpoint is reachable.
pub trait NetworkStatus: Send + Sync + Debug {
    fn is_online(&self) -> bool;

    /// Receiver that observes every online/offline change.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Settable [`NetworkStatus`], driven by the platform's connectivity callbacks.
#[derive(Debug)]
pub struct NetworkMonitor {
    state: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    /// Record a connectivity change. Repeating the current state notifies nobody.
    pub fn set_online(&self, online: bool) {
        self.state.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
