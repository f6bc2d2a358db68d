//! Request-response link cache.
//!
//! Management operations share one request-response link per entity path.
//! The cache hands out that shared link under a reference count: `obtain`
//! creates the link on first use (concurrent first users coalesce onto one
//! attach), `release` tears it down when the last holder lets go. The
//! decision to tear down is made under the same lock acquisition as the
//! decrement, so a racing `obtain` either finds the entry gone or finds a
//! live link, never a closing one.

use crate::error::AmqpError;
use crate::message::EntityPath;
use crate::registry::RegisteredLink;
use crate::transport::RequestLink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "link_cache_tests.rs"]
mod tests;

/// Creates request-response links on demand.
///
/// Implemented by the factory layer, which authorizes the management path
/// and attaches the link on the shared connection.
#[async_trait]
pub trait RequestLinkFactory: Send + Sync {
    async fn create(&self, path: &EntityPath) -> Result<Arc<dyn RequestLink>, AmqpError>;
}

type LinkWaiter = oneshot::Sender<Result<Arc<dyn RequestLink>, AmqpError>>;

fn enlist(waiters: &mut Vec<LinkWaiter>) -> oneshot::Receiver<Result<Arc<dyn RequestLink>, AmqpError>> {
    let (tx, rx) = oneshot::channel();
    waiters.push(tx);
    rx
}

#[derive(Default)]
struct CacheEntry {
    link: Option<Arc<dyn RequestLink>>,
    ref_count: usize,
    creating: bool,
    waiters: Vec<LinkWaiter>,
}

struct CacheState {
    entries: HashMap<EntityPath, CacheEntry>,
    closed: bool,
}

/// Reference-counted cache of request-response links, one per entity path
pub struct LinkCache {
    factory: Arc<dyn RequestLinkFactory>,
    state: Mutex<CacheState>,
}

impl LinkCache {
    pub fn new(factory: Arc<dyn RequestLinkFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                closed: false,
            }),
        })
    }

    /// Obtain the shared link for `path`, incrementing its reference count.
    ///
    /// Every successful `obtain` must be paired with exactly one
    /// [`LinkCache::release`].
    pub async fn obtain(
        self: &Arc<Self>,
        path: &EntityPath,
    ) -> Result<Arc<dyn RequestLink>, AmqpError> {
        enum Plan {
            Ready(Arc<dyn RequestLink>),
            Wait(oneshot::Receiver<Result<Arc<dyn RequestLink>, AmqpError>>),
            Create(oneshot::Receiver<Result<Arc<dyn RequestLink>, AmqpError>>),
        }

        loop {
            let plan = {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(AmqpError::closed("request link cache"));
                }
                let entry = state.entries.entry(path.clone()).or_default();
                if let Some(link) = &entry.link {
                    if link.is_open() {
                        entry.ref_count += 1;
                        Plan::Ready(Arc::clone(link))
                    } else {
                        // Stale link from a dead connection; replace it.
                        entry.link = None;
                        entry.creating = true;
                        Plan::Create(enlist(&mut entry.waiters))
                    }
                } else if entry.creating {
                    Plan::Wait(enlist(&mut entry.waiters))
                } else {
                    entry.creating = true;
                    Plan::Create(enlist(&mut entry.waiters))
                }
            };

            let rx = match plan {
                Plan::Ready(link) => return Ok(link),
                Plan::Wait(rx) => rx,
                Plan::Create(rx) => {
                    // The attach runs on its own task so an abandoned caller
                    // cannot leave the entry stuck in `creating`.
                    let cache = Arc::clone(self);
                    let path = path.clone();
                    tokio::spawn(async move { cache.create_link(&path).await });
                    rx
                }
            };
            match rx.await {
                Ok(result) => return result,
                // The creating task vanished; retake the decision.
                Err(_) => continue,
            }
        }
    }

    async fn create_link(self: &Arc<Self>, path: &EntityPath) {
        enum AfterCreate {
            Deliver(Result<Arc<dyn RequestLink>, AmqpError>, Vec<LinkWaiter>),
            // Entry removed by a connection fault while attaching; a fresh
            // link belongs to no one.
            Orphan(Result<Arc<dyn RequestLink>, AmqpError>),
        }

        debug!(path = %path, "attaching request link");
        let result = self.factory.create(path).await;

        let after = {
            let mut state = self.state.lock().unwrap();
            match state.entries.get_mut(path) {
                None => AfterCreate::Orphan(result),
                Some(entry) => {
                    entry.creating = false;
                    let waiters = std::mem::take(&mut entry.waiters);
                    match result {
                        Ok(link) => {
                            entry.link = Some(Arc::clone(&link));
                            // One reference per waiter about to receive it.
                            entry.ref_count += waiters.len();
                            AfterCreate::Deliver(Ok(link), waiters)
                        }
                        Err(error) => {
                            if entry.ref_count == 0 {
                                state.entries.remove(path);
                            }
                            AfterCreate::Deliver(Err(error), waiters)
                        }
                    }
                }
            }
        };

        match after {
            AfterCreate::Orphan(Ok(link)) => link.close().await,
            AfterCreate::Orphan(Err(_)) => {}
            AfterCreate::Deliver(outcome, waiters) => {
                let mut abandoned = 0;
                for waiter in waiters {
                    if waiter.send(outcome.clone()).is_err() {
                        abandoned += 1;
                    }
                }
                // References granted to waiters that vanished are handed back
                if outcome.is_ok() {
                    for _ in 0..abandoned {
                        self.release(path).await;
                    }
                }
            }
        }
    }

    /// Release one reference to the link for `path`, closing it when the
    /// count reaches zero.
    pub async fn release(&self, path: &EntityPath) {
        let to_close = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.entries.get_mut(path) else {
                warn!(path = %path, "release for unknown request link");
                return;
            };
            if entry.ref_count == 0 {
                warn!(path = %path, "release without matching obtain");
                return;
            }
            entry.ref_count -= 1;
            if entry.ref_count == 0 && !entry.creating {
                state.entries.remove(path).and_then(|entry| entry.link)
            } else {
                None
            }
        };

        if let Some(link) = to_close {
            debug!(path = %path, "closing request link");
            link.close().await;
        }
    }

    /// Number of live cached links
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .entries
            .values()
            .filter(|entry| entry.link.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every cached link and refuse further obtains.
    pub async fn free_all(&self) {
        let (links, waiters) = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            let mut links = Vec::new();
            let mut waiters = Vec::new();
            for (_, mut entry) in state.entries.drain() {
                if let Some(link) = entry.link.take() {
                    links.push(link);
                }
                waiters.append(&mut entry.waiters);
            }
            (links, waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(Err(AmqpError::closed("request link cache")));
        }
        for link in links {
            link.close().await;
        }
    }
}

// Request links die with their connection; dropping the entries lets the
// next obtain attach on the replacement connection.
impl RegisteredLink for LinkCache {
    fn on_connection_error(&self, error: &AmqpError) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            let mut waiters = Vec::new();
            for (_, mut entry) in state.entries.drain() {
                waiters.append(&mut entry.waiters);
            }
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
