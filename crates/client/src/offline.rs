//! Connectivity and visibility signals.
//!
//! The host application reports network and app-visibility changes here;
//! the sync worker and the realtime broadcaster watch them.

use std::sync::Arc;

use tokio::sync::watch;

pub use crate::types::ConnectivityState;

/// Shared connectivity state. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<ConnectivityState>>,
    visible: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

impl Connectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        let (visible, _) = watch::channel(true);
        Self {
            state: Arc::new(state),
            visible: Arc::new(visible),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    pub fn set_online(&self) {
        self.set(ConnectivityState::Online);
    }

    pub fn set_offline(&self) {
        self.set(ConnectivityState::Offline);
    }

    fn set(&self, next: ConnectivityState) {
        let changed = self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
        if changed {
            tracing::info!(state = ?next, "connectivity changed");
        }
    }

    /// Report whether the app is in the foreground.
    pub fn set_visible(&self, visible: bool) {
        self.visible.send_if_modified(|v| {
            let changed = *v != visible;
            *v = visible;
            changed
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn watch_visibility(&self) -> watch::Receiver<bool> {
        self.visible.subscribe()
    }
}
