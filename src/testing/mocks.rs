//! Mock transports for testing
//!
//! [`MockConnector`] replays a scripted sequence of handshake outcomes and
//! [`MockSession`] counts sends, fails on demand and records how many sends
//! overlapped. Both are cheap to clone; clones share state so a test can keep
//! an observer after handing the original to the code under test.

use crate::transport::{
    BrokerEndpoint, Connector, Established, Handshake, HandshakeError, PublishFrame, SendError,
    Session, TransportKind,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct SessionState {
    delay: Option<Duration>,
    open: AtomicBool,
    closed: AtomicBool,
    fail_all: AtomicBool,
    fail_remaining: AtomicUsize,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    in_flight_at_start: Mutex<Vec<usize>>,
    delivered: Mutex<Vec<PublishFrame>>,
}

/// Mock session for testing
#[derive(Debug, Clone)]
pub struct MockSession {
    state: Arc<SessionState>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Every send waits `delay` before confirming
    pub fn with_delay(delay: Duration) -> Self {
        Self::build(Some(delay))
    }

    /// Every send fails
    pub fn failing() -> Self {
        let session = Self::new();
        session.state.fail_all.store(true, Ordering::SeqCst);
        session
    }

    fn build(delay: Option<Duration>) -> Self {
        let state = SessionState {
            delay,
            open: AtomicBool::new(true),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Fail the next `count` sends with an I/O error
    pub fn fail_next(&self, count: usize) {
        self.state.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Simulate the network dropping the link
    pub fn drop_link(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }

    pub fn was_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Send attempts, successful or not
    pub fn send_count(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of sends in flight at the same time
    pub fn max_concurrency(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// For each send, how many others were already in flight when it started
    pub fn in_flight_at_start(&self) -> Vec<usize> {
        self.state
            .in_flight_at_start
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn delivered_topics(&self) -> Vec<String> {
        self.state
            .delivered
            .lock()
            .map(|frames| frames.iter().map(|f| f.topic.clone()).collect())
            .unwrap_or_default()
    }

    fn take_scripted_failure(&self) -> bool {
        self.state.fail_all.load(Ordering::SeqCst)
            || self
                .state
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn publish(&self, frame: &PublishFrame) -> Result<(), SendError> {
        let state = &self.state;
        state.attempts.fetch_add(1, Ordering::SeqCst);

        if !state.open.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }

        let already = state.in_flight.fetch_add(1, Ordering::SeqCst);
        state.max_in_flight.fetch_max(already + 1, Ordering::SeqCst);
        if let Ok(mut starts) = state.in_flight_at_start.lock() {
            starts.push(already);
        }

        if let Some(delay) = state.delay {
            tokio::time::sleep(delay).await;
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.take_scripted_failure() {
            return Err(SendError::Io("scripted send failure".to_string()));
        }

        if let Ok(mut delivered) = state.delivered.lock() {
            delivered.push(frame.clone());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst) && !self.state.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Scripted result of one `open` call
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Accept { token: Option<Vec<u8>> },
    Reject { code: u8 },
    Unreachable,
    /// Never answers; only a timeout ends it
    Hang,
}

impl ConnectOutcome {
    pub fn accept() -> Self {
        ConnectOutcome::Accept { token: None }
    }

    pub fn accept_with_token(token: &[u8]) -> Self {
        ConnectOutcome::Accept {
            token: Some(token.to_vec()),
        }
    }
}

#[derive(Debug)]
struct ConnectorState {
    script: Mutex<VecDeque<ConnectOutcome>>,
    fallback: ConnectOutcome,
    session_delay: Option<Duration>,
    opens: AtomicUsize,
    handshakes: Mutex<Vec<Handshake>>,
    sessions: Mutex<Vec<MockSession>>,
}

/// Mock connector for testing
#[derive(Debug, Clone)]
pub struct MockConnector {
    kind: TransportKind,
    endpoint: BrokerEndpoint,
    state: Arc<ConnectorState>,
}

impl MockConnector {
    /// Connector that answers every open with `outcome`
    pub fn new(kind: TransportKind, outcome: ConnectOutcome) -> Self {
        Self::scripted(kind, Vec::new(), outcome)
    }

    /// Connector that plays `script` in order, then `fallback` forever
    pub fn scripted(kind: TransportKind, script: Vec<ConnectOutcome>, fallback: ConnectOutcome) -> Self {
        let port = match kind {
            TransportKind::Primary => 14567,
            TransportKind::Secondary => 8884,
        };
        Self {
            kind,
            endpoint: BrokerEndpoint::new("mock.broker", port),
            state: Arc::new(ConnectorState {
                script: Mutex::new(script.into()),
                fallback,
                session_delay: None,
                opens: AtomicUsize::new(0),
                handshakes: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn accepting(kind: TransportKind) -> Self {
        Self::new(kind, ConnectOutcome::accept())
    }

    /// Sessions handed out by this connector delay every send
    pub fn with_session_delay(self, delay: Duration) -> Self {
        let state = ConnectorState {
            script: Mutex::new(self.state.script.lock().map(|s| s.clone()).unwrap_or_default()),
            fallback: self.state.fallback.clone(),
            session_delay: Some(delay),
            opens: AtomicUsize::new(0),
            handshakes: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        };
        Self {
            kind: self.kind,
            endpoint: self.endpoint,
            state: Arc::new(state),
        }
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.state
            .handshakes
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Most recently established session
    pub fn last_session(&self) -> Option<MockSession> {
        self.state
            .sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.last().cloned())
    }

    fn next_outcome(&self) -> ConnectOutcome {
        self.state
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.state.fallback.clone())
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    async fn open(&self, handshake: &Handshake) -> Result<Established, HandshakeError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut handshakes) = self.state.handshakes.lock() {
            handshakes.push(handshake.clone());
        }

        match self.next_outcome() {
            ConnectOutcome::Accept { token } => {
                let session = match self.state.session_delay {
                    Some(delay) => MockSession::with_delay(delay),
                    None => MockSession::new(),
                };
                if let Ok(mut sessions) = self.state.sessions.lock() {
                    sessions.push(session.clone());
                }
                Ok(Established {
                    session: Box::new(session),
                    resumption_token: token,
                })
            }
            ConnectOutcome::Reject { code } => Err(HandshakeError::Rejected { code }),
            ConnectOutcome::Unreachable => Err(HandshakeError::Unreachable(
                "mock connection refused".to_string(),
            )),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }
}
