//! Sending link core.
//!
//! A [`Sender`] owns one outbound link to an entity path and drives the full
//! delivery pipeline: messages are encoded, queued, transferred when credit
//! allows, and completed when the remote settles the corresponding delivery
//! tag. Two queues feed the link; deliveries that were already attempted
//! (rejected transiently, or in flight when the link died) drain before
//! first-attempt deliveries.
//!
//! Link failures are classified through the retry policy: a transient failure
//! schedules exactly one reconnect attempt, bounded by the reconnect
//! watchdog, after which every unsettled delivery is re-queued at retry
//! priority under a fresh tag. A non-transient failure fails every pending
//! send with the link error.

use crate::codec::MessageCodec;
use crate::config::ClientConfig;
use crate::error::AmqpError;
use crate::message::{DeliveryTag, EntityPath, Message};
use crate::registry::{LinkRegistration, RegisteredLink};
use crate::retry::RetryPolicy;
use crate::timer::{TimerKind, TimerService};
use crate::transport::{DeliveryOutcome, LinkEvent, SenderAttach, SenderLink};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Attaches sender links, authorizing the path first.
///
/// Implemented by the factory layer over the connection supervisor and token
/// lifecycle.
#[async_trait]
pub trait SenderLinkFactory: Send + Sync {
    async fn attach(&self, path: &EntityPath) -> Result<SenderAttach, AmqpError>;
}

/// Lifecycle of the underlying link instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Detached,
    Attached,
    Closed,
}

struct PendingSend {
    payload: Bytes,
    completion: Option<oneshot::Sender<Result<(), AmqpError>>>,
    deadline: Instant,
    /// Current correlation tag; regenerated for every transfer attempt on a
    /// fresh link
    tag: DeliveryTag,
    awaiting_ack: bool,
}

struct SenderState {
    phase: LinkPhase,
    link: Option<Arc<dyn SenderLink>>,
    /// Bumped on every attach so events from superseded links are ignored
    epoch: u64,
    credit: u32,
    next_delivery_id: u64,
    pending: HashMap<u64, PendingSend>,
    tags: HashMap<DeliveryTag, u64>,
    /// Deliveries re-attempted after a transient failure; drained first
    retry_queue: VecDeque<u64>,
    /// First-attempt deliveries in send order
    fresh_queue: VecDeque<u64>,
    /// Transfer order of unsettled deliveries, for re-queue on reconnect
    unsettled_order: VecDeque<u64>,
    draining: bool,
    reconnecting: bool,
    last_error: Option<AmqpError>,
}

enum FailurePlan {
    Ignore,
    FailAll,
    Reconnect(std::time::Duration),
}

enum Settled {
    Complete(oneshot::Sender<Result<(), AmqpError>>, Result<(), AmqpError>),
    Retry(u64, std::time::Duration),
    Ignore,
}

/// Drop the delivery's correlation state and take its completion channel.
fn remove_settled(
    state: &mut SenderState,
    id: u64,
    tag: &DeliveryTag,
) -> Option<oneshot::Sender<Result<(), AmqpError>>> {
    state.tags.remove(tag);
    state.unsettled_order.retain(|queued| *queued != id);
    state
        .pending
        .remove(&id)
        .and_then(|mut entry| entry.completion.take())
}

/// Sender for one entity path
pub struct Sender {
    path: EntityPath,
    client_id: String,
    factory: Arc<dyn SenderLinkFactory>,
    codec: Arc<dyn MessageCodec>,
    retry: Arc<RetryPolicy>,
    timer: TimerService,
    config: ClientConfig,
    state: Mutex<SenderState>,
    registration: Mutex<Option<LinkRegistration>>,
    weak_self: Weak<Sender>,
}

impl Sender {
    pub fn new(
        path: EntityPath,
        factory: Arc<dyn SenderLinkFactory>,
        codec: Arc<dyn MessageCodec>,
        retry: Arc<RetryPolicy>,
        timer: TimerService,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client_id: format!("sender:{path}"),
            path,
            factory,
            codec,
            retry,
            timer,
            config,
            state: Mutex::new(SenderState {
                phase: LinkPhase::Detached,
                link: None,
                epoch: 0,
                credit: 0,
                next_delivery_id: 1,
                pending: HashMap::new(),
                tags: HashMap::new(),
                retry_queue: VecDeque::new(),
                fresh_queue: VecDeque::new(),
                unsettled_order: VecDeque::new(),
                draining: false,
                reconnecting: false,
                last_error: None,
            }),
            registration: Mutex::new(None),
            weak_self: Weak::clone(weak_self),
        })
    }

    /// Entity path this sender delivers to
    pub fn path(&self) -> &EntityPath {
        &self.path
    }

    /// Keep the registry entry alive for this sender's lifetime
    pub(crate) fn hold_registration(&self, registration: LinkRegistration) {
        *self.registration.lock().unwrap() = Some(registration);
    }

    /// Number of deliveries accepted but not yet settled or failed
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Send one message, resolving when the remote settles the delivery.
    ///
    /// The operation budget starts when the delivery is queued and covers
    /// any link attach that has to happen first.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::MessageTooLarge`] before anything is queued,
    /// [`AmqpError::Timeout`] (carrying the last link error, if any) when the
    /// operation budget expires, or the settlement/link error otherwise.
    pub async fn send(self: &Arc<Self>, message: &Message) -> Result<(), AmqpError> {
        let payload = self.codec.encode(message)?;
        let (id, mut rx, deadline) = self.enqueue(payload)?;

        self.ensure_attached();
        self.drain();

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AmqpError::cancelled("sender torn down")),
            Err(_) => self.fail_timed_out(id, rx),
        }
    }

    /// Send a batch of messages, each delivery under its own operation
    /// budget started at queue time.
    ///
    /// Deliveries are settled independently; the first failure is returned
    /// after every delivery in the batch has resolved.
    pub async fn send_batch(self: &Arc<Self>, messages: &[Message]) -> Result<(), AmqpError> {
        let mut payloads = Vec::with_capacity(messages.len());
        for message in messages {
            payloads.push(self.codec.encode(message)?);
        }

        let mut receivers = Vec::with_capacity(payloads.len());
        for payload in payloads {
            receivers.push(self.enqueue(payload)?);
        }

        self.ensure_attached();
        self.drain();

        let mut first_error = None;
        for (id, mut rx, deadline) in receivers {
            let result = match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AmqpError::cancelled("sender torn down")),
                Err(_) => self.fail_timed_out(id, rx),
            };
            if first_error.is_none() {
                first_error = result.err();
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn enqueue(
        &self,
        payload: Bytes,
    ) -> Result<(u64, oneshot::Receiver<Result<(), AmqpError>>, Instant), AmqpError> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.operation_timeout;
        let mut state = self.state.lock().unwrap();
        if state.phase == LinkPhase::Closed {
            return Err(AmqpError::closed("sender"));
        }
        let id = state.next_delivery_id;
        state.next_delivery_id += 1;
        let tag = DeliveryTag::fresh();
        state.tags.insert(tag.clone(), id);
        state.pending.insert(
            id,
            PendingSend {
                payload,
                completion: Some(tx),
                deadline,
                tag,
                awaiting_ack: false,
            },
        );
        state.fresh_queue.push_back(id);
        Ok((id, rx, deadline))
    }

    /// Withdraw a delivery whose operation budget expired. If settlement
    /// raced the timeout and won, the settled result is returned instead.
    fn fail_timed_out(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Result<(), AmqpError>>,
    ) -> Result<(), AmqpError> {
        let last_error = {
            let mut state = self.state.lock().unwrap();
            match state.pending.remove(&id) {
                Some(entry) => {
                    state.tags.remove(&entry.tag);
                    state.fresh_queue.retain(|queued| *queued != id);
                    state.retry_queue.retain(|queued| *queued != id);
                    state.unsettled_order.retain(|queued| *queued != id);
                    state.last_error.clone()
                }
                None => {
                    return match rx.try_recv() {
                        Ok(result) => result,
                        Err(_) => {
                            Err(AmqpError::timed_out(self.config.operation_timeout, None))
                        }
                    };
                }
            }
        };
        Err(AmqpError::timed_out(
            self.config.operation_timeout,
            last_error,
        ))
    }

    // ========================================================================
    // Link attachment
    // ========================================================================

    /// Kick off an attach if the link is missing and no reconnect is in
    /// flight. The attempt runs on its own task so an abandoned caller
    /// cannot leave the reconnect claim stuck.
    fn ensure_attached(self: &Arc<Self>) {
        let should_attach = {
            let mut state = self.state.lock().unwrap();
            if state.phase == LinkPhase::Closed
                || state.link.is_some()
                || state.reconnecting
            {
                false
            } else {
                state.reconnecting = true;
                true
            }
        };
        if should_attach {
            let sender = Arc::clone(self);
            tokio::spawn(async move { sender.reattach().await });
        }
    }

    /// Run one attach attempt under the watchdog and wire up the new link.
    ///
    /// Requires `reconnecting` to have been claimed by the caller.
    async fn reattach(self: &Arc<Self>) {
        let result = match tokio::time::timeout(
            self.config.reconnect_watchdog,
            self.factory.attach(&self.path),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AmqpError::timed_out(self.config.reconnect_watchdog, None)),
        };

        match result {
            Ok(attach) => {
                let events = {
                    let mut state = self.state.lock().unwrap();
                    state.reconnecting = false;
                    if state.phase == LinkPhase::Closed {
                        attach.link.close();
                        return;
                    }
                    state.phase = LinkPhase::Attached;
                    state.link = Some(Arc::clone(&attach.link));
                    state.epoch += 1;
                    state.credit = 0;
                    self.requeue_unsettled(&mut state);
                    debug!(path = %self.path, epoch = state.epoch, "sender link attached");
                    (state.epoch, attach.events)
                };
                self.spawn_event_pump(events.0, events.1);
                self.drain();
            }
            Err(error) => {
                warn!(path = %self.path, error = %error, "sender link attach failed");
                self.state.lock().unwrap().reconnecting = false;
                self.handle_link_failure(error);
            }
        }
    }

    /// Move every unsettled delivery back to the retry queue, in original
    /// transfer order and under a fresh tag.
    fn requeue_unsettled(&self, state: &mut SenderState) {
        let order = std::mem::take(&mut state.unsettled_order);
        for id in order {
            if let Some(entry) = state.pending.get_mut(&id) {
                state.tags.remove(&entry.tag);
                entry.tag = DeliveryTag::fresh();
                entry.awaiting_ack = false;
                state.tags.insert(entry.tag.clone(), id);
                state.retry_queue.push_back(id);
            }
        }
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let weak = Weak::clone(&self.weak_self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(sender) = weak.upgrade() else {
                    return;
                };
                match event {
                    LinkEvent::Flow { credit } => sender.on_flow(epoch, credit),
                    LinkEvent::Disposition { tag, outcome } => {
                        sender.on_disposition(epoch, tag, outcome);
                    }
                    LinkEvent::Detached { error } => {
                        sender.on_detached(epoch, error);
                        return;
                    }
                }
            }
        });
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    fn on_flow(self: &Arc<Self>, epoch: u64, credit: u32) {
        {
            let mut state = self.state.lock().unwrap();
            if state.epoch != epoch {
                return;
            }
            state.credit = state.credit.saturating_add(credit);
        }
        self.drain();
    }

    fn on_disposition(self: &Arc<Self>, epoch: u64, tag: DeliveryTag, outcome: DeliveryOutcome) {
        let settled = {
            let mut state = self.state.lock().unwrap();
            if state.epoch != epoch {
                return;
            }
            let Some(id) = state.tags.get(&tag).copied() else {
                // Already timed out or settled; exactly-once completion wins
                debug!(path = %self.path, %tag, "disposition for unknown delivery tag");
                return;
            };
            match outcome {
                DeliveryOutcome::Accepted => {
                    self.retry.reset_retry_count(&self.client_id);
                    match remove_settled(&mut state, id, &tag) {
                        Some(completion) => Settled::Complete(completion, Ok(())),
                        None => Settled::Ignore,
                    }
                }
                DeliveryOutcome::Rejected { error } if error.is_transient() => {
                    let remaining = state
                        .pending
                        .get(&id)
                        .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
                        .unwrap_or_default();
                    match self.retry.next_interval(&self.client_id, &error, remaining) {
                        Some(delay) => {
                            self.retry.increment_retry_count(&self.client_id);
                            state.tags.remove(&tag);
                            state.unsettled_order.retain(|queued| *queued != id);
                            state.last_error = Some(error);
                            if let Some(entry) = state.pending.get_mut(&id) {
                                entry.tag = DeliveryTag::fresh();
                                entry.awaiting_ack = false;
                                let retagged = entry.tag.clone();
                                state.tags.insert(retagged, id);
                            }
                            Settled::Retry(id, delay)
                        }
                        None => match remove_settled(&mut state, id, &tag) {
                            Some(completion) => Settled::Complete(completion, Err(error)),
                            None => Settled::Ignore,
                        },
                    }
                }
                DeliveryOutcome::Rejected { error } => {
                    match remove_settled(&mut state, id, &tag) {
                        Some(completion) => Settled::Complete(completion, Err(error)),
                        None => Settled::Ignore,
                    }
                }
                DeliveryOutcome::Released => match remove_settled(&mut state, id, &tag) {
                    Some(completion) => Settled::Complete(
                        completion,
                        Err(AmqpError::cancelled("delivery released by remote")),
                    ),
                    None => Settled::Ignore,
                },
                DeliveryOutcome::Other { description } => {
                    match remove_settled(&mut state, id, &tag) {
                        Some(completion) => Settled::Complete(
                            completion,
                            Err(AmqpError::DeliveryFailed { description }),
                        ),
                        None => Settled::Ignore,
                    }
                }
            }
        };

        match settled {
            Settled::Complete(completion, result) => {
                let _ = completion.send(result);
            }
            Settled::Retry(id, delay) => self.schedule_retry(id, delay),
            Settled::Ignore => {}
        }

        self.drain();
    }

    fn schedule_retry(self: &Arc<Self>, id: u64, delay: std::time::Duration) {
        debug!(path = %self.path, id, ?delay, "delivery re-queued after rejection");
        let weak = Weak::clone(&self.weak_self);
        self.timer.schedule(delay, TimerKind::Once, move || {
            let weak = Weak::clone(&weak);
            async move {
                let Some(sender) = weak.upgrade() else {
                    return;
                };
                {
                    let mut state = sender.state.lock().unwrap();
                    if state.phase == LinkPhase::Closed || !state.pending.contains_key(&id) {
                        return;
                    }
                    state.retry_queue.push_back(id);
                }
                sender.ensure_attached();
                sender.drain();
            }
        });
    }

    fn on_detached(self: &Arc<Self>, epoch: u64, error: Option<AmqpError>) {
        {
            let state = self.state.lock().unwrap();
            if state.epoch != epoch {
                return;
            }
        }
        let error = error.unwrap_or_else(|| AmqpError::LinkDetached {
            message: format!("sender link to '{}' detached", self.path),
        });
        self.handle_link_failure(error);
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    /// Classify a link-level failure and either fail every pending send or
    /// schedule a single reconnect attempt.
    fn handle_link_failure(self: &Arc<Self>, error: AmqpError) {
        let plan = {
            let mut state = self.state.lock().unwrap();
            if state.phase == LinkPhase::Closed {
                FailurePlan::Ignore
            } else {
                state.link = None;
                state.credit = 0;
                state.phase = LinkPhase::Detached;
                state.last_error = Some(error.clone());
                if state.pending.is_empty() {
                    // Nothing in flight; the next send reattaches
                    FailurePlan::Ignore
                } else if !error.is_transient() {
                    FailurePlan::FailAll
                } else if state.reconnecting {
                    FailurePlan::Ignore
                } else {
                    let now = Instant::now();
                    let remaining = state
                        .pending
                        .values()
                        .map(|entry| entry.deadline.saturating_duration_since(now))
                        .max()
                        .unwrap_or_default();
                    match self.retry.next_interval(&self.client_id, &error, remaining) {
                        Some(delay) => {
                            self.retry.increment_retry_count(&self.client_id);
                            state.reconnecting = true;
                            FailurePlan::Reconnect(delay)
                        }
                        None => FailurePlan::FailAll,
                    }
                }
            }
        };

        match plan {
            FailurePlan::Ignore => {}
            FailurePlan::FailAll => self.fail_all(error),
            FailurePlan::Reconnect(delay) => {
                warn!(path = %self.path, error = %error, ?delay, "sender link lost, reconnecting");
                let weak = Weak::clone(&self.weak_self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(sender) = weak.upgrade() {
                        sender.reattach().await;
                    }
                });
            }
        }
    }

    fn fail_all(&self, error: AmqpError) {
        let completions = {
            let mut state = self.state.lock().unwrap();
            state.fresh_queue.clear();
            state.retry_queue.clear();
            state.unsettled_order.clear();
            state.tags.clear();
            state
                .pending
                .drain()
                .filter_map(|(_, mut entry)| entry.completion.take())
                .collect::<Vec<_>>()
        };
        warn!(path = %self.path, error = %error, count = completions.len(), "failing pending sends");
        for completion in completions {
            let _ = completion.send(Err(error.clone()));
        }
    }

    // ========================================================================
    // Drain
    // ========================================================================

    /// Transfer queued deliveries while credit and the link allow.
    ///
    /// Reentrancy-guarded: a caller arriving while another drain runs returns
    /// immediately, and the running drain re-checks the queues before
    /// releasing the guard.
    fn drain(self: &Arc<Self>) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.draining {
                    return;
                }
                state.draining = true;
            }
            self.drain_once();
            let mut state = self.state.lock().unwrap();
            state.draining = false;
            let more_work = state.link.is_some()
                && state.credit > 0
                && (!state.retry_queue.is_empty() || !state.fresh_queue.is_empty());
            if !more_work {
                return;
            }
        }
    }

    fn drain_once(self: &Arc<Self>) {
        enum Next {
            Transfer(Arc<dyn SenderLink>, DeliveryTag, Bytes),
            Skip,
            Done,
        }

        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                let link = match &state.link {
                    Some(link) if link.is_open() => Arc::clone(link),
                    _ => return,
                };
                if state.credit == 0 {
                    Next::Done
                } else {
                    // Re-attempted deliveries drain before first attempts
                    let id = state
                        .retry_queue
                        .pop_front()
                        .or_else(|| state.fresh_queue.pop_front());
                    match id {
                        None => Next::Done,
                        Some(id) => match state.pending.get_mut(&id) {
                            // Withdrawn by a timeout while queued
                            None => Next::Skip,
                            Some(entry) => {
                                entry.awaiting_ack = true;
                                let tag = entry.tag.clone();
                                let payload = entry.payload.clone();
                                state.credit -= 1;
                                state.unsettled_order.push_back(id);
                                Next::Transfer(link, tag, payload)
                            }
                        },
                    }
                }
            };

            match next {
                Next::Done => return,
                Next::Skip => continue,
                Next::Transfer(link, tag, payload) => {
                    if let Err(error) = link.transfer(&tag, payload) {
                        // A failed hand-off settles only this delivery; the
                        // rest of the queue keeps draining
                        let completion = {
                            let mut state = self.state.lock().unwrap();
                            state.credit = state.credit.saturating_add(1);
                            match state.tags.get(&tag).copied() {
                                Some(id) => remove_settled(&mut state, id, &tag),
                                None => None,
                            }
                        };
                        warn!(path = %self.path, %tag, error = %error, "transfer failed");
                        if let Some(completion) = completion {
                            let _ = completion.send(Err(AmqpError::cancelled(format!(
                                "transfer failed: {error}"
                            ))));
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close the sender, failing every pending send. Idempotent.
    pub async fn close(&self) {
        let (link, completions) = {
            let mut state = self.state.lock().unwrap();
            if state.phase == LinkPhase::Closed {
                return;
            }
            state.phase = LinkPhase::Closed;
            state.fresh_queue.clear();
            state.retry_queue.clear();
            state.unsettled_order.clear();
            state.tags.clear();
            let completions = state
                .pending
                .drain()
                .filter_map(|(_, mut entry)| entry.completion.take())
                .collect::<Vec<_>>();
            (state.link.take(), completions)
        };

        for completion in completions {
            let _ = completion.send(Err(AmqpError::closed("sender")));
        }
        if let Some(link) = link {
            link.close();
        }
        *self.registration.lock().unwrap() = None;
        debug!(path = %self.path, "sender closed");
    }
}

impl RegisteredLink for Sender {
    fn on_connection_error(&self, error: &AmqpError) {
        if let Some(sender) = self.weak_self.upgrade() {
            sender.handle_link_failure(error.clone());
        }
    }
}
