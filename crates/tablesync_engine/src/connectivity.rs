//! Connectivity tracking.
//!
//! A [`ConnectivityMonitor`] holds one [`ConnectivityState`] and reports each
//! change exactly once. The engine keeps two monitors: one for the network
//! (fed by OS signals through `SyncEngine::set_network_online`) and one for
//! the realtime subscriptions (fed by the dispatcher).

use std::fmt;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Reachability of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Reachable.
    Online,
    /// Unreachable; no automatic retries are running.
    Offline,
    /// Unreachable; a backoff retry is pending.
    Reconnecting,
}

impl ConnectivityState {
    /// Returns true if the state is `Online`.
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
            ConnectivityState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state.
    pub from: ConnectivityState,
    /// New state.
    pub to: ConnectivityState,
}

impl Transition {
    /// Returns true for a change into `Online` from any other state.
    pub fn came_online(&self) -> bool {
        !self.from.is_online() && self.to.is_online()
    }

    /// Returns true for a change out of `Online`.
    pub fn went_offline(&self) -> bool {
        self.from.is_online() && !self.to.is_online()
    }
}

const TRANSITION_CAPACITY: usize = 64;

/// Tracks one connectivity state and publishes its changes.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    name: &'static str,
    state: watch::Sender<ConnectivityState>,
    transitions: broadcast::Sender<Transition>,
}

impl ConnectivityMonitor {
    /// Creates a monitor in `initial` state.
    pub fn new(name: &'static str, initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            name,
            state,
            transitions,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Sets the state.
    ///
    /// Returns the transition if the state changed, `None` if it was already
    /// `state`. Subscribers see each transition once.
    pub fn set(&self, state: ConnectivityState) -> Option<Transition> {
        let mut from = state;
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                from = *current;
                *current = state;
                true
            }
        });
        if !changed {
            return None;
        }

        let transition = Transition { from, to: state };
        debug!(monitor = self.name, %from, to = %state, "connectivity changed");
        // No receivers is fine.
        let _ = self.transitions.send(transition);
        Some(transition)
    }

    /// Returns a receiver that always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Returns a receiver of future transitions.
    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }
}
