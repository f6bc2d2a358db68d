//! Message and session pumps.
//!
//! A pump turns a pull-style receiver into a push-style handler dispatch:
//! the caller registers exactly one handler, the pump runs a configurable
//! number of concurrent receive loops, and each received message flows
//! through lock renewal, the user callback, and settlement. Failures in any
//! phase are reported to the exception callback tagged with the phase they
//! occurred in; the pump itself keeps running.
//!
//! Under peek-lock the message lock is renewed in the background while the
//! handler runs. The next renewal fires at
//! `remaining - min(remaining / 2, buffer)` before expiry, and renewal stops
//! once the lock has been held for the maximum auto-renew duration.

use crate::error::AmqpError;
use crate::message::{LockToken, ReceiveMode, ReceivedMessage, SessionId, Timestamp};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "pump_tests.rs"]
mod tests;

// ============================================================================
// Collaborator traits
// ============================================================================

/// Pull-style receiver a pump drives
#[async_trait]
pub trait PumpReceiver: Send + Sync {
    /// Receive one message, resolving with `None` when `timeout` elapses
    /// without a delivery
    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, AmqpError>;

    async fn complete(&self, lock_token: &LockToken) -> Result<(), AmqpError>;

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), AmqpError>;

    /// Renew the message lock, returning the new expiry
    async fn renew_lock(&self, lock_token: &LockToken) -> Result<Timestamp, AmqpError>;

    fn receive_mode(&self) -> ReceiveMode;
}

/// Session-aware receiver accepted from a [`SessionSource`]
#[async_trait]
pub trait SessionReceiver: PumpReceiver {
    fn session_id(&self) -> &SessionId;

    /// When the session lock expires
    fn session_locked_until(&self) -> Timestamp;

    /// Renew the session lock, returning the new expiry
    async fn renew_session_lock(&self) -> Result<Timestamp, AmqpError>;

    async fn close(&self);
}

/// Accepts the next available session on an entity
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Accept whichever session the server offers next, resolving with
    /// `None` when `timeout` elapses without one
    async fn accept_next_session(
        &self,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn SessionReceiver>>, AmqpError>;
}

/// User callback invoked once per received message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage) -> Result<(), AmqpError>;
}

/// User callback invoked once per received message within a session
#[async_trait]
pub trait SessionMessageHandler: Send + Sync {
    async fn handle(
        &self,
        session_id: &SessionId,
        message: ReceivedMessage,
    ) -> Result<(), AmqpError>;
}

/// Pipeline phase an exception was raised from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionPhase {
    Receive,
    UserCallback,
    Complete,
    Abandon,
    RenewLock,
    AcceptSession,
}

/// Callback receiving pipeline failures, tagged with their phase
pub type ExceptionCallback = Arc<dyn Fn(ExceptionPhase, &AmqpError) + Send + Sync>;

// ============================================================================
// Options
// ============================================================================

/// Tuning for a message pump
#[derive(Clone)]
pub struct PumpOptions {
    /// Number of concurrent receive-and-dispatch loops
    pub max_concurrent_calls: usize,
    /// Settle messages automatically from the handler result
    pub auto_complete: bool,
    /// Stop renewing a message lock once it has been held this long
    pub max_auto_renew_duration: Duration,
    /// Ceiling on how early before expiry a renewal may fire
    pub renewal_buffer: Duration,
    /// Budget for one receive call before the loop re-checks for shutdown
    pub receive_timeout: Duration,
    /// Pause after a failed receive or accept before the loop retries
    pub receive_retry_backoff: Duration,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: true,
            max_auto_renew_duration: Duration::from_secs(5 * 60),
            renewal_buffer: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(60),
            receive_retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Tuning for a session pump
#[derive(Clone)]
pub struct SessionPumpOptions {
    pub pump: PumpOptions,
    /// Number of sessions processed concurrently
    pub max_concurrent_sessions: usize,
    /// Give up on an idle session after this long without a delivery
    pub session_idle_timeout: Duration,
}

impl Default for SessionPumpOptions {
    fn default() -> Self {
        Self {
            pump: PumpOptions::default(),
            max_concurrent_sessions: 1,
            session_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Delay before the next renewal of a lock with `remaining` validity
fn renewal_delay(remaining: Duration, buffer: Duration) -> Duration {
    remaining.saturating_sub((remaining / 2).min(buffer))
}

// ============================================================================
// Message pump
// ============================================================================

/// Push-style dispatch over one receiver
pub struct MessagePump {
    receiver: Arc<dyn PumpReceiver>,
    options: PumpOptions,
    registered: AtomicBool,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagePump {
    pub fn new(receiver: Arc<dyn PumpReceiver>, options: PumpOptions) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            receiver,
            options,
            registered: AtomicBool::new(false),
            stop_tx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Register the handler and start the receive loops.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::AlreadyRegistered`] on any call after the first;
    /// a pump dispatches to exactly one handler for its whole lifetime.
    pub fn register_handler(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        on_exception: ExceptionCallback,
    ) -> Result<(), AmqpError> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyRegistered);
        }

        let mut workers = self.workers.lock().unwrap();
        for worker in 0..self.options.max_concurrent_calls.max(1) {
            let pump = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let on_exception = Arc::clone(&on_exception);
            let mut stop_rx = self.stop_tx.subscribe();
            workers.push(tokio::spawn(async move {
                debug!(worker, "receive loop started");
                loop {
                    let received = tokio::select! {
                        _ = stop_rx.changed() => break,
                        received = pump.receiver.receive(pump.options.receive_timeout) => received,
                    };
                    match received {
                        Ok(None) => continue,
                        Ok(Some(message)) => {
                            dispatch_message(
                                &pump.receiver,
                                &pump.options,
                                &handler,
                                &on_exception,
                                message,
                            )
                            .await;
                        }
                        Err(error) => {
                            on_exception(ExceptionPhase::Receive, &error);
                            if matches!(error, AmqpError::ClientClosed { .. }) {
                                break;
                            }
                            // Receive failures back off briefly so a dead
                            // link cannot spin the loop
                            tokio::time::sleep(pump.options.receive_retry_backoff).await;
                        }
                    }
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                debug!(worker, "receive loop stopped");
            }));
        }
        Ok(())
    }

    /// Stop the receive loops and wait for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// Run one message through renewal, the handler, and settlement.
async fn dispatch_message(
    receiver: &Arc<dyn PumpReceiver>,
    options: &PumpOptions,
    handler: &Arc<dyn MessageHandler>,
    on_exception: &ExceptionCallback,
    message: ReceivedMessage,
) {
    let peek_lock = receiver.receive_mode() == ReceiveMode::PeekLock;
    let lock = message
        .lock_token
        .clone()
        .filter(|_| peek_lock)
        .map(|token| Arc::new(Mutex::new(token)));

    let renewal = lock.as_ref().map(|lock| {
        spawn_message_renewal(
            Arc::clone(receiver),
            options.clone(),
            Arc::clone(lock),
            Arc::clone(on_exception),
        )
    });

    let result = {
        let handler = Arc::clone(handler);
        let message = message.clone();
        // Run on a separate task so a panicking handler is contained
        match tokio::spawn(async move { handler.handle(message).await }).await {
            Ok(result) => result,
            Err(join_error) => Err(AmqpError::cancelled(format!(
                "message handler panicked: {join_error}"
            ))),
        }
    };
    if let Err(error) = &result {
        on_exception(ExceptionPhase::UserCallback, error);
    }

    if let Some(renewal) = renewal {
        renewal.abort();
    }

    if !peek_lock || !options.auto_complete {
        return;
    }
    let Some(lock) = lock else { return };
    let token = lock.lock().unwrap().clone();
    match result {
        Ok(()) => {
            if let Err(error) = receiver.complete(&token).await {
                on_exception(ExceptionPhase::Complete, &error);
            }
        }
        Err(_) => {
            if let Err(error) = receiver.abandon(&token).await {
                on_exception(ExceptionPhase::Abandon, &error);
            }
        }
    }
}

/// Renew the message lock until cancelled, a terminal renewal error, or the
/// maximum auto-renew duration.
fn spawn_message_renewal(
    receiver: Arc<dyn PumpReceiver>,
    options: PumpOptions,
    lock: Arc<Mutex<LockToken>>,
    on_exception: ExceptionCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cutoff = Instant::now() + options.max_auto_renew_duration;
        loop {
            let locked_until = lock.lock().unwrap().locked_until();
            let remaining = locked_until.until().to_std().unwrap_or(Duration::ZERO);
            // Once the lock outlives the auto-renew window there is nothing
            // left to extend
            if Instant::now() + remaining >= cutoff {
                debug!("lock expiry reached the maximum auto-renew duration");
                return;
            }
            tokio::time::sleep(renewal_delay(remaining, options.renewal_buffer)).await;

            let token = lock.lock().unwrap().clone();
            match receiver.renew_lock(&token).await {
                Ok(new_expiry) => {
                    let mut token = lock.lock().unwrap();
                    let renewed = token.renewed_until(new_expiry);
                    *token = renewed;
                }
                Err(error) => {
                    on_exception(ExceptionPhase::RenewLock, &error);
                    if error.is_lock_renewal_terminal() {
                        return;
                    }
                    // Transient; try again shortly rather than waiting out
                    // the full window
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

// ============================================================================
// Session pump
// ============================================================================

/// Push-style dispatch over sessions accepted one at a time
pub struct SessionPump {
    source: Arc<dyn SessionSource>,
    options: SessionPumpOptions,
    registered: AtomicBool,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionPump {
    pub fn new(source: Arc<dyn SessionSource>, options: SessionPumpOptions) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            source,
            options,
            registered: AtomicBool::new(false),
            stop_tx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Register the handler and start the session loops.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::AlreadyRegistered`] on any call after the first.
    pub fn register_handler(
        self: &Arc<Self>,
        handler: Arc<dyn SessionMessageHandler>,
        on_exception: ExceptionCallback,
    ) -> Result<(), AmqpError> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyRegistered);
        }

        let mut workers = self.workers.lock().unwrap();
        for worker in 0..self.options.max_concurrent_sessions.max(1) {
            let pump = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let on_exception = Arc::clone(&on_exception);
            let mut stop_rx = self.stop_tx.subscribe();
            workers.push(tokio::spawn(async move {
                debug!(worker, "session loop started");
                loop {
                    let accepted = tokio::select! {
                        _ = stop_rx.changed() => break,
                        accepted = pump
                            .source
                            .accept_next_session(pump.options.pump.receive_timeout) => accepted,
                    };
                    match accepted {
                        Ok(None) => continue,
                        Ok(Some(session)) => {
                            pump.run_session(&session, &handler, &on_exception, &mut stop_rx)
                                .await;
                            session.close().await;
                        }
                        Err(error) => {
                            on_exception(ExceptionPhase::AcceptSession, &error);
                            if matches!(error, AmqpError::ClientClosed { .. }) {
                                break;
                            }
                            tokio::time::sleep(pump.options.pump.receive_retry_backoff).await;
                        }
                    }
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                debug!(worker, "session loop stopped");
            }));
        }
        Ok(())
    }

    /// Pump one accepted session until it idles out, its lock is lost, or
    /// shutdown is requested.
    async fn run_session(
        &self,
        session: &Arc<dyn SessionReceiver>,
        handler: &Arc<dyn SessionMessageHandler>,
        on_exception: &ExceptionCallback,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let session_id = session.session_id().clone();
        debug!(session = %session_id, "session accepted");

        let renewal = spawn_session_renewal(
            Arc::clone(session),
            self.options.pump.clone(),
            Arc::clone(on_exception),
        );

        loop {
            let received = tokio::select! {
                _ = stop_rx.changed() => break,
                received = session.receive(self.options.session_idle_timeout) => received,
            };
            match received {
                // No more messages within the idle window; release the
                // session so another client may take it
                Ok(None) => break,
                Ok(Some(message)) => {
                    let session_handler = SessionHandlerAdapter {
                        handler: Arc::clone(handler),
                        session_id: session_id.clone(),
                    };
                    dispatch_message(
                        &(Arc::clone(session) as Arc<dyn PumpReceiver>),
                        &self.options.pump,
                        &(Arc::new(session_handler) as Arc<dyn MessageHandler>),
                        on_exception,
                        message,
                    )
                    .await;
                }
                Err(error) => {
                    on_exception(ExceptionPhase::Receive, &error);
                    if matches!(
                        error,
                        AmqpError::SessionLockLost { .. } | AmqpError::ClientClosed { .. }
                    ) {
                        break;
                    }
                    tokio::time::sleep(self.options.pump.receive_retry_backoff).await;
                }
            }
            if *stop_rx.borrow() {
                break;
            }
        }

        renewal.abort();
        debug!(session = %session_id, "session released");
    }

    /// Stop the session loops and wait for in-flight work to finish.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// Bridges the session handler into the shared dispatch pipeline
struct SessionHandlerAdapter {
    handler: Arc<dyn SessionMessageHandler>,
    session_id: SessionId,
}

#[async_trait]
impl MessageHandler for SessionHandlerAdapter {
    async fn handle(&self, message: ReceivedMessage) -> Result<(), AmqpError> {
        self.handler.handle(&self.session_id, message).await
    }
}

/// Renew the session lock until cancelled or a terminal renewal error.
fn spawn_session_renewal(
    session: Arc<dyn SessionReceiver>,
    options: PumpOptions,
    on_exception: ExceptionCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut locked_until = session.session_locked_until();
        loop {
            let remaining = locked_until.until().to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(renewal_delay(remaining, options.renewal_buffer)).await;

            match session.renew_session_lock().await {
                Ok(new_expiry) => locked_until = new_expiry,
                Err(error) => {
                    on_exception(ExceptionPhase::RenewLock, &error);
                    if error.is_lock_renewal_terminal() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}
