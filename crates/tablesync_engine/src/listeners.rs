//! Listener registry for inbound change events.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tablesync_protocol::SyncEvent;
use tracing::{error, warn};

/// Table name that subscribes to every table.
pub const WILDCARD: &str = "*";

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type of a listener callback.
pub type ListenerResult = Result<(), ListenerError>;

type Callback = Arc<dyn Fn(&SyncEvent) -> ListenerResult + Send + Sync>;

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Result of delivering one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Listeners that returned `Ok`.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
}

/// Handle returned by [`ListenerRegistry::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`ListenerHandle::unsubscribe`].
#[derive(Debug)]
#[must_use = "keep the handle to unsubscribe later"]
pub struct ListenerHandle {
    id: ListenerId,
    table: String,
    registry: Weak<ListenerRegistry>,
}

impl ListenerHandle {
    /// Returns the listener id.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns the table the listener is registered for.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Removes the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.table, self.id),
            None => false,
        }
    }
}

/// Maps table names (or [`WILDCARD`]) to listener callbacks.
///
/// Callbacks run on the task that delivers the event, outside the
/// registry lock, so a callback may subscribe or unsubscribe listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Callback)>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a callback for `table`, or for every table with
    /// [`WILDCARD`].
    pub fn subscribe<F>(self: &Arc<Self>, table: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&SyncEvent) -> ListenerResult + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(table.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        ListenerHandle {
            id,
            table: table.to_string(),
            registry: Arc::downgrade(self),
        }
    }

    /// Removes a listener by handle. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        self.remove(&handle.table, handle.id)
    }

    fn remove(&self, table: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(callbacks) = listeners.get_mut(table) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(listener, _)| *listener != id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            listeners.remove(table);
        }
        removed
    }

    /// Returns the total number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }

    /// Returns the number of tables (including the wildcard) with listeners.
    pub fn table_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers an event to the table's listeners, then the wildcard ones.
    ///
    /// A listener that returns an error or panics is logged and skipped;
    /// the remaining listeners still receive the event.
    pub fn dispatch(&self, event: &SyncEvent) -> Delivery {
        let callbacks: Vec<(ListenerId, Callback)> = {
            let listeners = self.listeners.read();
            let exact = listeners.get(event.table.as_str()).into_iter().flatten();
            let wildcard = if event.table == WILDCARD {
                None
            } else {
                listeners.get(WILDCARD)
            };
            exact
                .chain(wildcard.into_iter().flatten())
                .cloned()
                .collect()
        };

        let mut delivery = Delivery::default();
        for (id, callback) in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(e)) => {
                    warn!(listener = ?id, table = %event.table, error = %e, "listener failed");
                    delivery.failed += 1;
                }
                Err(payload) => {
                    error!(
                        listener = ?id,
                        table = %event.table,
                        panic = panic_message(payload.as_ref()),
                        "listener panicked"
                    );
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
