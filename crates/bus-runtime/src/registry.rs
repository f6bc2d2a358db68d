//! Link registry.
//!
//! Tracks the live link-owning components on a connection so that a
//! connection-level fault can be fanned out to each of them. Entries are held
//! weakly; a component that is dropped without unregistering simply disappears
//! from the next notification sweep. Explicit unregistration happens through
//! the [`LinkRegistration`] guard returned at registration time.

use crate::error::AmqpError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

/// A component holding links on the shared connection
pub trait RegisteredLink: Send + Sync {
    /// Invoked when the underlying connection faults. The component must
    /// treat its links as gone and fail or re-queue its in-flight work.
    fn on_connection_error(&self, error: &AmqpError);
}

struct RegistryState {
    entries: HashMap<u64, Weak<dyn RegisteredLink>>,
}

/// Registry of link owners attached to one connection supervisor
pub struct LinkRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl LinkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a link owner. The returned guard removes the entry when
    /// dropped.
    pub fn register(self: &Arc<Self>, link: Weak<dyn RegisteredLink>) -> LinkRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|_, entry| entry.strong_count() > 0);
        state.entries.insert(id, link);
        LinkRegistration {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Fan a connection fault out to every live registrant.
    ///
    /// Strong handles are collected under the lock and invoked outside it, so
    /// a registrant may re-enter the registry from its callback.
    pub fn notify_connection_error(&self, error: &AmqpError) {
        let live: Vec<Arc<dyn RegisteredLink>> = {
            let mut state = self.state.lock().unwrap();
            state.entries.retain(|_, entry| entry.strong_count() > 0);
            state.entries.values().filter_map(Weak::upgrade).collect()
        };
        debug!(
            registrants = live.len(),
            error = %error,
            "propagating connection error to registered links"
        );
        for link in live {
            link.on_connection_error(error);
        }
    }

    /// Number of live registrants
    pub fn len(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|_, entry| entry.strong_count() > 0);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, id: u64) {
        self.state.lock().unwrap().entries.remove(&id);
    }
}

/// Guard tying a registry entry to the lifetime of its owner
pub struct LinkRegistration {
    id: u64,
    registry: Weak<LinkRegistry>,
}

impl Drop for LinkRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}
