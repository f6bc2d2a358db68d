//! Connection supervisor.
//!
//! Owns the single physical connection shared by every link in a factory and
//! the dedicated control link used for token puts. All connection creation
//! funnels through [`ConnectionSupervisor::get_connection`]: concurrent
//! callers during an open coalesce onto one attempt, and a faulted connection
//! is replaced lazily on the next request. Connection-level faults reported by
//! the transport are fanned out to the [`LinkRegistry`] so each link owner can
//! fail or re-queue its in-flight work.

use crate::config::ClientConfig;
use crate::error::AmqpError;
use crate::registry::LinkRegistry;
use crate::transport::{ConnectionEvent, TokenLink, Transport, TransportConnection};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Supervisor lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No connection has been requested yet
    Unopened,
    /// A connect attempt is in flight
    Opening,
    /// A connection is available
    Open,
    /// `close` is running
    Closing,
    /// `close` completed; the supervisor is permanently unusable
    Closed,
    /// The last connection faulted; the next request opens a new one
    Faulted,
}

type ConnectionWaiter = oneshot::Sender<Result<Arc<dyn TransportConnection>, AmqpError>>;
type ControlWaiter = oneshot::Sender<Result<Arc<dyn TokenLink>, AmqpError>>;

struct SupervisorState {
    phase: Phase,
    connection: Option<Arc<dyn TransportConnection>>,
    /// Bumped on every successful connect so stale event watchers are ignored
    generation: u64,
    connection_waiters: Vec<ConnectionWaiter>,
    control_link: Option<Arc<dyn TokenLink>>,
    control_creating: bool,
    /// Connection generation the control attach budget belongs to
    control_generation: u64,
    control_attempts: u32,
    control_last_error: Option<AmqpError>,
    control_waiters: Vec<ControlWaiter>,
}

fn enlist<T>(waiters: &mut Vec<oneshot::Sender<T>>) -> oneshot::Receiver<T> {
    let (tx, rx) = oneshot::channel();
    waiters.push(tx);
    rx
}

/// Owns the shared connection and control link for one factory
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    registry: Arc<LinkRegistry>,
    state: Mutex<SupervisorState>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        registry: Arc<LinkRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            registry,
            state: Mutex::new(SupervisorState {
                phase: Phase::Unopened,
                connection: None,
                generation: 0,
                connection_waiters: Vec::new(),
                control_link: None,
                control_creating: false,
                control_generation: 0,
                control_attempts: 0,
                control_last_error: None,
                control_waiters: Vec::new(),
            }),
        })
    }

    /// Registry receiving connection-fault notifications
    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    /// Get the shared connection, opening one if necessary.
    ///
    /// Exactly one connect attempt runs at a time; concurrent callers wait on
    /// its outcome. After a fault or a failed attempt the next caller starts
    /// a fresh attempt.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::ClientClosed`] once the supervisor is closed, or
    /// the transport error when the connect attempt fails.
    pub async fn get_connection(
        self: &Arc<Self>,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        enum Plan {
            Ready(Arc<dyn TransportConnection>),
            Wait(oneshot::Receiver<Result<Arc<dyn TransportConnection>, AmqpError>>),
            Create(oneshot::Receiver<Result<Arc<dyn TransportConnection>, AmqpError>>),
        }

        let plan = {
            let mut state = self.state.lock().unwrap();
            match state.phase {
                Phase::Closing | Phase::Closed => {
                    return Err(AmqpError::closed("connection supervisor"));
                }
                Phase::Open => match &state.connection {
                    Some(connection) if !connection.is_closed() => {
                        Plan::Ready(Arc::clone(connection))
                    }
                    _ => {
                        state.phase = Phase::Opening;
                        Plan::Create(enlist(&mut state.connection_waiters))
                    }
                },
                Phase::Opening => Plan::Wait(enlist(&mut state.connection_waiters)),
                Phase::Unopened | Phase::Faulted => {
                    state.phase = Phase::Opening;
                    Plan::Create(enlist(&mut state.connection_waiters))
                }
            }
        };

        let rx = match plan {
            Plan::Ready(connection) => return Ok(connection),
            Plan::Wait(rx) => rx,
            Plan::Create(rx) => {
                // The open runs on its own task so an abandoned caller
                // cannot leave the supervisor stuck in `Opening`.
                let supervisor = Arc::clone(self);
                tokio::spawn(async move { supervisor.open_connection().await });
                rx
            }
        };
        rx.await
            .unwrap_or_else(|_| Err(AmqpError::cancelled("connect attempt abandoned")))
    }

    async fn open_connection(self: &Arc<Self>) {
        debug!(host = %self.config.host, "opening connection");
        let result = self.transport.connect(&self.config.host).await;

        let (outcome, waiters, orphan) = {
            let mut state = self.state.lock().unwrap();
            let waiters = std::mem::take(&mut state.connection_waiters);
            match result {
                Ok(handle) => {
                    if matches!(state.phase, Phase::Closing | Phase::Closed) {
                        // Teardown raced the open; the fresh connection
                        // belongs to no one
                        (
                            Err(AmqpError::closed("connection supervisor")),
                            waiters,
                            Some(handle.connection),
                        )
                    } else {
                        state.phase = Phase::Open;
                        state.connection = Some(Arc::clone(&handle.connection));
                        state.generation += 1;
                        // A control link from the old connection died with it;
                        // its attach budget resets once the new generation is
                        // observed
                        state.control_link = None;
                        self.spawn_event_watcher(state.generation, handle.events);
                        info!(host = %self.config.host, generation = state.generation, "connection open");
                        (Ok(handle.connection), waiters, None)
                    }
                }
                Err(error) => {
                    if !matches!(state.phase, Phase::Closing | Phase::Closed) {
                        state.phase = Phase::Faulted;
                    }
                    warn!(host = %self.config.host, error = %error, "connect attempt failed");
                    (Err(error), waiters, None)
                }
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        if let Some(connection) = orphan {
            connection.close().await;
        }
    }

    fn spawn_event_watcher(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(supervisor) = Weak::upgrade(&supervisor) else {
                    return;
                };
                match event {
                    ConnectionEvent::Error(error) => {
                        supervisor.handle_connection_error(generation, error);
                    }
                    ConnectionEvent::Closed { error } => {
                        let error = error.unwrap_or_else(|| AmqpError::ConnectionLost {
                            message: "connection closed by remote".to_string(),
                        });
                        supervisor.handle_connection_error(generation, error);
                    }
                }
            }
        });
    }

    /// Record a connection fault and notify every registered link owner.
    ///
    /// Events from superseded connections are ignored.
    fn handle_connection_error(&self, generation: u64, error: AmqpError) {
        let propagate = {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation
                || matches!(state.phase, Phase::Closing | Phase::Closed)
            {
                false
            } else {
                warn!(error = %error, "connection faulted");
                state.phase = Phase::Faulted;
                state.connection = None;
                // The control link died with the connection; restore its
                // attach budget for the replacement
                state.control_link = None;
                state.control_attempts = 0;
                state.control_last_error = None;
                for waiter in std::mem::take(&mut state.connection_waiters) {
                    let _ = waiter.send(Err(error.clone()));
                }
                for waiter in std::mem::take(&mut state.control_waiters) {
                    let _ = waiter.send(Err(error.clone()));
                }
                true
            }
        };
        if propagate {
            self.registry.notify_connection_error(&error);
        }
    }

    /// Get the control link, attaching one if necessary.
    ///
    /// Attach attempts per connection are bounded by
    /// `control_link_max_attempts`; once exhausted, the last error is
    /// returned until a new connection is opened.
    pub async fn get_control_link(self: &Arc<Self>) -> Result<Arc<dyn TokenLink>, AmqpError> {
        enum Plan {
            Ready(Arc<dyn TokenLink>),
            Wait(oneshot::Receiver<Result<Arc<dyn TokenLink>, AmqpError>>),
            Create(oneshot::Receiver<Result<Arc<dyn TokenLink>, AmqpError>>),
        }

        loop {
            let plan = {
                let mut state = self.state.lock().unwrap();
                if matches!(state.phase, Phase::Closing | Phase::Closed) {
                    return Err(AmqpError::closed("connection supervisor"));
                }
                // The attach budget is per connection
                if state.control_generation != state.generation {
                    state.control_generation = state.generation;
                    state.control_attempts = 0;
                    state.control_last_error = None;
                }
                match &state.control_link {
                    Some(link) if link.is_open() => Plan::Ready(Arc::clone(link)),
                    _ if state.control_creating => Plan::Wait(enlist(&mut state.control_waiters)),
                    _ if state.control_attempts >= self.config.control_link_max_attempts => {
                        let error = state.control_last_error.clone().unwrap_or_else(|| {
                            AmqpError::Unauthorized {
                                message: "control link unavailable".to_string(),
                            }
                        });
                        return Err(error);
                    }
                    _ => {
                        state.control_creating = true;
                        Plan::Create(enlist(&mut state.control_waiters))
                    }
                }
            };

            let rx = match plan {
                Plan::Ready(link) => return Ok(link),
                Plan::Wait(rx) => rx,
                Plan::Create(rx) => {
                    // Detached for the same reason as `get_connection`
                    let supervisor = Arc::clone(self);
                    tokio::spawn(async move { supervisor.open_control_link().await });
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

    async fn open_control_link(self: &Arc<Self>) {
        let result = match self.get_connection().await {
            Ok(connection) => connection.open_token_link().await,
            Err(error) => Err(error),
        };

        let (outcome, waiters, orphan) = {
            let mut state = self.state.lock().unwrap();
            state.control_creating = false;
            // The connect above may have replaced the connection; the attempt
            // counts against the generation it actually ran on
            if state.control_generation != state.generation {
                state.control_generation = state.generation;
                state.control_attempts = 0;
            }
            let waiters = std::mem::take(&mut state.control_waiters);
            match result {
                Ok(link) => {
                    if matches!(state.phase, Phase::Closing | Phase::Closed) {
                        (
                            Err(AmqpError::closed("connection supervisor")),
                            waiters,
                            Some(link),
                        )
                    } else {
                        state.control_link = Some(Arc::clone(&link));
                        state.control_last_error = None;
                        debug!("control link attached");
                        (Ok(link), waiters, None)
                    }
                }
                Err(error) => {
                    state.control_attempts += 1;
                    state.control_last_error = Some(error.clone());
                    warn!(
                        attempt = state.control_attempts,
                        max = self.config.control_link_max_attempts,
                        error = %error,
                        "control link attach failed"
                    );
                    (Err(error), waiters, None)
                }
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        if let Some(link) = orphan {
            link.close().await;
        }
    }

    /// Close the control link ahead of full teardown, failing any waiters.
    ///
    /// The supervisor stays usable; factory close calls this first so the
    /// control link is gone before cached links are released.
    pub async fn close_control_link(&self) {
        let link = {
            let mut state = self.state.lock().unwrap();
            for waiter in std::mem::take(&mut state.control_waiters) {
                let _ = waiter.send(Err(AmqpError::closed("connection supervisor")));
            }
            state.control_link.take()
        };
        if let Some(link) = link {
            link.close().await;
            debug!("control link closed");
        }
    }

    /// Close the control link and connection, in that order.
    ///
    /// Idempotent; the whole teardown is bounded by `close_timeout`.
    pub async fn close(&self) {
        let (connection, control_link) = {
            let mut state = self.state.lock().unwrap();
            if matches!(state.phase, Phase::Closing | Phase::Closed) {
                return;
            }
            state.phase = Phase::Closing;
            for waiter in std::mem::take(&mut state.connection_waiters) {
                let _ = waiter.send(Err(AmqpError::closed("connection supervisor")));
            }
            for waiter in std::mem::take(&mut state.control_waiters) {
                let _ = waiter.send(Err(AmqpError::closed("connection supervisor")));
            }
            (state.connection.take(), state.control_link.take())
        };

        let teardown = async {
            if let Some(link) = control_link {
                link.close().await;
            }
            if let Some(connection) = connection {
                connection.close().await;
            }
        };
        if tokio::time::timeout(self.config.close_timeout, teardown)
            .await
            .is_err()
        {
            warn!("connection teardown exceeded close timeout");
        }

        self.state.lock().unwrap().phase = Phase::Closed;
        info!("connection supervisor closed");
    }
}
