//! Tests for the message and session pumps.

use super::*;
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;

fn received(body: &str, lock_duration: Duration) -> ReceivedMessage {
    ReceivedMessage {
        message: Message::new(body.to_string()),
        lock_token: Some(LockToken::new(
            format!("lock-{body}"),
            Timestamp::after(lock_duration),
        )),
        sequence_number: 1,
        delivery_count: 1,
        enqueued_at: Timestamp::now(),
    }
}

struct StubReceiver {
    mode: ReceiveMode,
    lock_duration: Duration,
    queue: Mutex<VecDeque<ReceivedMessage>>,
    completed: Mutex<Vec<String>>,
    abandoned: Mutex<Vec<String>>,
    renewals: AtomicUsize,
    renew_failure: Mutex<Option<AmqpError>>,
    receive_failure: Mutex<Option<AmqpError>>,
}

impl StubReceiver {
    fn new(mode: ReceiveMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            lock_duration: Duration::from_secs(60),
            queue: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            abandoned: Mutex::new(Vec::new()),
            renewals: AtomicUsize::new(0),
            renew_failure: Mutex::new(None),
            receive_failure: Mutex::new(None),
        })
    }

    fn push(&self, body: &str) {
        self.queue
            .lock()
            .unwrap()
            .push_back(received(body, self.lock_duration));
    }

    fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    fn abandoned(&self) -> Vec<String> {
        self.abandoned.lock().unwrap().clone()
    }

    fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PumpReceiver for StubReceiver {
    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, AmqpError> {
        if let Some(error) = self.receive_failure.lock().unwrap().take() {
            return Err(error);
        }
        if let Some(message) = self.queue.lock().unwrap().pop_front() {
            return Ok(Some(message));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), AmqpError> {
        self.completed
            .lock()
            .unwrap()
            .push(lock_token.token().to_string());
        Ok(())
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), AmqpError> {
        self.abandoned
            .lock()
            .unwrap()
            .push(lock_token.token().to_string());
        Ok(())
    }

    async fn renew_lock(&self, _lock_token: &LockToken) -> Result<Timestamp, AmqpError> {
        if let Some(error) = self.renew_failure.lock().unwrap().take() {
            return Err(error);
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(Timestamp::after(self.lock_duration))
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.mode
    }
}

struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    fail: bool,
    delay: Duration,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail: false,
            delay,
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: ReceivedMessage) -> Result<(), AmqpError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let body = String::from_utf8(message.message.body.to_vec()).unwrap();
        self.seen.lock().unwrap().push(body.clone());
        if self.fail {
            return Err(AmqpError::InvalidArgument {
                field: "body".to_string(),
                message: format!("rejected {body}"),
            });
        }
        Ok(())
    }
}

type ExceptionLog = Arc<Mutex<Vec<(ExceptionPhase, String)>>>;

fn exception_log() -> (ExceptionLog, ExceptionCallback) {
    let log: ExceptionLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback: ExceptionCallback = Arc::new(move |phase, error: &AmqpError| {
        sink.lock().unwrap().push((phase, error.to_string()));
    });
    (log, callback)
}

fn phases(log: &ExceptionLog) -> Vec<ExceptionPhase> {
    log.lock().unwrap().iter().map(|(phase, _)| *phase).collect()
}

// ============================================================================
// Message pump
// ============================================================================

#[tokio::test(start_paused = true)]
async fn handler_registration_is_exactly_once() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    let pump = MessagePump::new(
        receiver as Arc<dyn PumpReceiver>,
        PumpOptions::default(),
    );
    let (_, callback) = exception_log();

    pump.register_handler(RecordingHandler::new(), Arc::clone(&callback))
        .unwrap();
    let second = pump.register_handler(RecordingHandler::new(), callback);

    assert!(matches!(second, Err(AmqpError::AlreadyRegistered)));
    pump.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn messages_flow_through_handler_and_auto_complete() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    receiver.push("a");
    receiver.push("b");
    receiver.push("c");
    let handler = RecordingHandler::new();
    let (log, callback) = exception_log();
    let options = PumpOptions {
        max_concurrent_calls: 2,
        ..PumpOptions::default()
    };
    let pump = MessagePump::new(Arc::clone(&receiver) as Arc<dyn PumpReceiver>, options);

    pump.register_handler(Arc::clone(&handler) as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pump.shutdown().await;

    let mut seen = handler.seen();
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);
    assert_eq!(receiver.completed().len(), 3);
    assert!(receiver.abandoned().is_empty());
    assert!(phases(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn handler_failure_abandons_and_reports_the_phase() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    receiver.push("bad");
    let handler = RecordingHandler::failing();
    let (log, callback) = exception_log();
    let pump = MessagePump::new(
        Arc::clone(&receiver) as Arc<dyn PumpReceiver>,
        PumpOptions::default(),
    );

    pump.register_handler(handler as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pump.shutdown().await;

    assert!(receiver.completed().is_empty());
    assert_eq!(receiver.abandoned(), vec!["lock-bad"]);
    assert_eq!(phases(&log), vec![ExceptionPhase::UserCallback]);
}

#[tokio::test(start_paused = true)]
async fn auto_complete_disabled_leaves_settlement_to_the_handler() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    receiver.push("a");
    let handler = RecordingHandler::new();
    let (_, callback) = exception_log();
    let options = PumpOptions {
        auto_complete: false,
        ..PumpOptions::default()
    };
    let pump = MessagePump::new(Arc::clone(&receiver) as Arc<dyn PumpReceiver>, options);

    pump.register_handler(Arc::clone(&handler) as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pump.shutdown().await;

    assert_eq!(handler.seen(), vec!["a"]);
    assert!(receiver.completed().is_empty());
    assert!(receiver.abandoned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn receive_and_delete_skips_settlement_and_renewal() {
    let receiver = StubReceiver::new(ReceiveMode::ReceiveAndDelete);
    receiver.push("a");
    let handler = RecordingHandler::slow(Duration::from_secs(120));
    let (_, callback) = exception_log();
    let pump = MessagePump::new(
        Arc::clone(&receiver) as Arc<dyn PumpReceiver>,
        PumpOptions::default(),
    );

    pump.register_handler(Arc::clone(&handler) as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(130)).await;
    pump.shutdown().await;

    assert_eq!(handler.seen(), vec!["a"]);
    assert!(receiver.completed().is_empty());
    assert_eq!(receiver.renewals(), 0);
}

#[tokio::test(start_paused = true)]
async fn lock_is_renewed_while_the_handler_runs() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    receiver.push("slow");
    // 60s lock, 10s buffer: renewals land roughly every 50s
    let handler = RecordingHandler::slow(Duration::from_secs(120));
    let (log, callback) = exception_log();
    let pump = MessagePump::new(
        Arc::clone(&receiver) as Arc<dyn PumpReceiver>,
        PumpOptions::default(),
    );

    pump.register_handler(handler as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(130)).await;
    pump.shutdown().await;

    assert_eq!(receiver.renewals(), 2);
    assert_eq!(receiver.completed().len(), 1);
    assert!(phases(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn renewal_stops_at_the_max_auto_renew_duration() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    receiver.push("slow");
    let handler = RecordingHandler::slow(Duration::from_secs(200));
    let (_, callback) = exception_log();
    let options = PumpOptions {
        max_auto_renew_duration: Duration::from_secs(90),
        ..PumpOptions::default()
    };
    let pump = MessagePump::new(Arc::clone(&receiver) as Arc<dyn PumpReceiver>, options);

    pump.register_handler(handler as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(210)).await;
    pump.shutdown().await;

    // The first renewal lands at 50s; the renewed lock then reaches past
    // the 90s cutoff and the loop stops even though the handler keeps
    // running.
    assert_eq!(receiver.renewals(), 1);
}

#[tokio::test(start_paused = true)]
async fn lock_reaching_past_the_cutoff_is_never_renewed() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    receiver.push("slow");
    let handler = RecordingHandler::slow(Duration::from_secs(120));
    let (_, callback) = exception_log();
    // The 60s lock already outlives the 55s window; renewing it would
    // extend the hold past the cutoff.
    let options = PumpOptions {
        max_auto_renew_duration: Duration::from_secs(55),
        ..PumpOptions::default()
    };
    let pump = MessagePump::new(Arc::clone(&receiver) as Arc<dyn PumpReceiver>, options);

    pump.register_handler(handler as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(130)).await;
    pump.shutdown().await;

    assert_eq!(receiver.renewals(), 0);
    assert_eq!(receiver.completed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_renewal_error_stops_the_renewal_loop() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    receiver.push("slow");
    *receiver.renew_failure.lock().unwrap() = Some(AmqpError::MessageLockLost {
        lock_token: "lock-slow".to_string(),
    });
    let handler = RecordingHandler::slow(Duration::from_secs(200));
    let (log, callback) = exception_log();
    let pump = MessagePump::new(
        Arc::clone(&receiver) as Arc<dyn PumpReceiver>,
        PumpOptions::default(),
    );

    pump.register_handler(handler as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(210)).await;
    pump.shutdown().await;

    assert_eq!(receiver.renewals(), 0);
    assert_eq!(phases(&log), vec![ExceptionPhase::RenewLock]);
}

#[tokio::test(start_paused = true)]
async fn receive_failure_is_reported_and_the_loop_recovers() {
    let receiver = StubReceiver::new(ReceiveMode::PeekLock);
    *receiver.receive_failure.lock().unwrap() = Some(AmqpError::ServerBusy {
        message: "throttled".to_string(),
    });
    receiver.push("after-error");
    let handler = RecordingHandler::new();
    let (log, callback) = exception_log();
    let pump = MessagePump::new(
        Arc::clone(&receiver) as Arc<dyn PumpReceiver>,
        PumpOptions::default(),
    );

    pump.register_handler(Arc::clone(&handler) as Arc<dyn MessageHandler>, callback)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    pump.shutdown().await;

    assert_eq!(phases(&log), vec![ExceptionPhase::Receive]);
    assert_eq!(handler.seen(), vec!["after-error"]);
}

// ============================================================================
// Session pump
// ============================================================================

struct StubSession {
    id: SessionId,
    inner: Arc<StubReceiver>,
    closed: AtomicBool,
    session_renewals: AtomicUsize,
}

#[async_trait]
impl PumpReceiver for StubSession {
    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, AmqpError> {
        self.inner.receive(timeout).await
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), AmqpError> {
        self.inner.complete(lock_token).await
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), AmqpError> {
        self.inner.abandon(lock_token).await
    }

    async fn renew_lock(&self, lock_token: &LockToken) -> Result<Timestamp, AmqpError> {
        self.inner.renew_lock(lock_token).await
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.inner.receive_mode()
    }
}

#[async_trait]
impl SessionReceiver for StubSession {
    fn session_id(&self) -> &SessionId {
        &self.id
    }

    fn session_locked_until(&self) -> Timestamp {
        Timestamp::after(Duration::from_secs(60))
    }

    async fn renew_session_lock(&self) -> Result<Timestamp, AmqpError> {
        self.session_renewals.fetch_add(1, Ordering::SeqCst);
        Ok(Timestamp::after(Duration::from_secs(60)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct StubSource {
    sessions: Mutex<VecDeque<Arc<StubSession>>>,
}

#[async_trait]
impl SessionSource for StubSource {
    async fn accept_next_session(
        &self,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn SessionReceiver>>, AmqpError> {
        if let Some(session) = self.sessions.lock().unwrap().pop_front() {
            return Ok(Some(session as Arc<dyn SessionReceiver>));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }
}

struct SessionRecordingHandler {
    seen: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SessionMessageHandler for SessionRecordingHandler {
    async fn handle(
        &self,
        session_id: &SessionId,
        message: ReceivedMessage,
    ) -> Result<(), AmqpError> {
        let body = String::from_utf8(message.message.body.to_vec()).unwrap();
        self.seen
            .lock()
            .unwrap()
            .push((session_id.to_string(), body));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn session_pump_drains_a_session_then_releases_it() {
    let inner = StubReceiver::new(ReceiveMode::PeekLock);
    inner.push("s1-a");
    inner.push("s1-b");
    let session = Arc::new(StubSession {
        id: SessionId::new("s1").unwrap(),
        inner: Arc::clone(&inner),
        closed: AtomicBool::new(false),
        session_renewals: AtomicUsize::new(0),
    });
    let source = Arc::new(StubSource {
        sessions: Mutex::new(VecDeque::from([Arc::clone(&session)])),
    });
    let handler = Arc::new(SessionRecordingHandler {
        seen: Mutex::new(Vec::new()),
    });
    let (log, callback) = exception_log();
    let options = SessionPumpOptions {
        session_idle_timeout: Duration::from_secs(1),
        ..SessionPumpOptions::default()
    };
    let pump = SessionPump::new(source as Arc<dyn SessionSource>, options);

    pump.register_handler(
        Arc::clone(&handler) as Arc<dyn SessionMessageHandler>,
        callback,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    pump.shutdown().await;

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("s1".to_string(), "s1-a".to_string()),
            ("s1".to_string(), "s1-b".to_string()),
        ]
    );
    assert_eq!(inner.completed().len(), 2);
    assert!(session.closed.load(Ordering::SeqCst));
    assert!(phases(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn session_handler_registration_is_exactly_once() {
    let source = Arc::new(StubSource {
        sessions: Mutex::new(VecDeque::new()),
    });
    let pump = SessionPump::new(
        source as Arc<dyn SessionSource>,
        SessionPumpOptions::default(),
    );
    let handler = Arc::new(SessionRecordingHandler {
        seen: Mutex::new(Vec::new()),
    });
    let (_, callback) = exception_log();

    pump.register_handler(
        Arc::clone(&handler) as Arc<dyn SessionMessageHandler>,
        Arc::clone(&callback),
    )
    .unwrap();
    let second = pump.register_handler(handler as Arc<dyn SessionMessageHandler>, callback);

    assert!(matches!(second, Err(AmqpError::AlreadyRegistered)));
    pump.shutdown().await;
}
