//! Scripted in-memory transport for exercising the connection client without
//! a network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use url::Url;

use crate::error::ConnectionError;
use crate::transport::{Connector, PushTransport};

#[derive(Default)]
struct ScriptState {
    outcomes: VecDeque<Result<(), ConnectionError>>,
    hold_open: bool,
    attempts: Vec<Url>,
    links: Vec<ScriptedLink>,
}

/// Each `connect` consumes the next scripted outcome; an empty script succeeds.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: Result<(), ConnectionError>) {
        self.state.lock().unwrap().outcomes.push_back(outcome);
    }

    pub fn fail_next(&self, times: usize) {
        for _ in 0..times {
            self.push_outcome(Err(ConnectionError::TransportError(
                "connection refused".to_string(),
            )));
        }
    }

    /// While set, `connect` never resolves, leaving the client in Connecting.
    pub fn set_hold_open(&self, hold: bool) {
        self.state.lock().unwrap().hold_open = hold;
    }

    pub fn attempts(&self) -> Vec<Url> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.state.lock().unwrap().attempts.len()
    }

    /// The most recently opened link.
    pub fn link(&self) -> ScriptedLink {
        self.state
            .lock()
            .unwrap()
            .links
            .last()
            .cloned()
            .expect("no link has been opened")
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().unwrap().links.len()
    }
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, url: &Url) -> Result<ScriptedTransport, ConnectionError> {
        let (outcome, hold) = {
            let mut state = self.state.lock().unwrap();
            state.attempts.push(url.clone());
            (state.outcomes.pop_front().unwrap_or(Ok(())), state.hold_open)
        };
        if hold {
            std::future::pending::<()>().await;
        }
        outcome?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let link = ScriptedLink {
            inbound: inbound_tx,
            sent: Arc::default(),
            closed: Arc::default(),
        };
        let transport = ScriptedTransport {
            inbound: inbound_rx,
            sent: Arc::clone(&link.sent),
            closed: Arc::clone(&link.closed),
        };
        self.state.lock().unwrap().links.push(link);
        Ok(transport)
    }
}

/// Test-side handle to one opened transport.
#[derive(Clone)]
pub struct ScriptedLink {
    inbound: mpsc::UnboundedSender<Option<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl ScriptedLink {
    pub fn push_frame(&self, frame: impl Into<String>) {
        let _ = self.inbound.send(Some(frame.into()));
    }

    /// Simulates the peer dropping the connection.
    pub fn drop_connection(&self) {
        let _ = self.inbound.send(None);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

pub struct ScriptedTransport {
    inbound: mpsc::UnboundedReceiver<Option<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl PushTransport for ScriptedTransport {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
        Ok(self.inbound.recv().await.flatten())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}
