//! Peer Link
//!
//! One negotiation plus its data channel, behind a [`PeerBackend`]. The
//! backend reports [`PeerEvent`]s tagged with the link id into the controller
//! inbox; events carrying the id of a destroyed link are stale.

use std::collections::VecDeque;
use serde_json::Value;
use tracing::{debug, warn};

use super::message::PeerMessage;
use super::Inbox;

/// Identifies one link instance within a controller.
pub type LinkId = u64;

/// Error texts raised by a deliberate close rather than a real failure.
const BENIGN_ERRORS: [&str; 3] = ["User-Initiated Abort", "Close called", "OperationError"];

/// What a backend reports about its negotiation and channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local description to hand to the counterpart through the relay.
    Signal(Value),
    /// The data channel is open.
    Open,
    /// Text frame from the counterpart.
    Frame(String),
    /// Negotiation or channel failure.
    Error(String),
    /// The channel closed.
    Closed,
}

/// One negotiation/data-channel pair.
pub trait PeerBackend: Send {
    /// Apply a description received from the counterpart.
    fn apply_signal(&mut self, signal: Value);

    /// Send a text frame. Returns false if the channel cannot take it.
    fn send_text(&mut self, text: String) -> bool;

    /// Tear the connection down.
    fn close(&mut self);
}

/// Creates backends.
pub trait PeerConnector: Send {
    /// Begin a negotiation. The initiator creates the data channel and the offer.
    fn open(&mut self, link: LinkId, initiator: bool, inbox: Inbox) -> Box<dyn PeerBackend>;
}

/// Whether an error text comes from a deliberate close.
pub fn is_benign_error(message: &str) -> bool {
    BENIGN_ERRORS.iter().any(|pattern| message.contains(pattern))
}

/// Inbound signals that arrived before the link existed.
#[derive(Debug, Default)]
pub struct SignalBuffer {
    signals: VecDeque<Value>,
}

impl SignalBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold a signal for later.
    pub fn push(&mut self, signal: Value) {
        self.signals.push_back(signal);
    }

    /// Number of held signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.signals.clear();
    }
}

/// A live peer link.
pub struct PeerLink {
    id: LinkId,
    initiator: bool,
    open: bool,
    backend: Option<Box<dyn PeerBackend>>,
}

impl PeerLink {
    /// Open a link and replay every buffered signal into it, in order.
    pub fn establish(
        connector: &mut dyn PeerConnector,
        id: LinkId,
        initiator: bool,
        inbox: Inbox,
        buffered: &mut SignalBuffer,
    ) -> Self {
        let mut backend = connector.open(id, initiator, inbox);
        if !buffered.is_empty() {
            debug!("Replaying {} buffered signal(s) into link {}", buffered.len(), id);
        }
        for signal in buffered.signals.drain(..) {
            backend.apply_signal(signal);
        }

        Self {
            id,
            initiator,
            open: false,
            backend: Some(backend),
        }
    }

    /// Link id.
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Whether this side made the offer.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Whether the data channel is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Record that the data channel opened.
    pub fn mark_open(&mut self) {
        self.open = true;
    }

    /// Hand a counterpart description to the backend.
    pub fn apply_signal(&mut self, signal: Value) {
        match self.backend.as_mut() {
            Some(backend) => backend.apply_signal(signal),
            None => debug!("Dropping signal for destroyed link {}", self.id),
        }
    }

    /// Send a message over the data channel. Returns whether it was handed off.
    pub fn send(&mut self, message: &PeerMessage) -> bool {
        if !self.open {
            debug!("Link {} not open, dropping {:?}", self.id, message);
            return false;
        }
        let Some(backend) = self.backend.as_mut() else {
            return false;
        };
        match message.encode() {
            Ok(text) => backend.send_text(text),
            Err(e) => {
                warn!("Failed to encode {:?}: {}", message, e);
                false
            }
        }
    }

    /// Close the backend. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            debug!("Destroying link {}", self.id);
            backend.close();
        }
        self.open = false;
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Test double for [`PeerConnector`], not a network transport.
pub mod loopback {
    //! In-process backend for tests and headless demos: two connectors sharing
    //! a hub stand in for two browsers. Offers and answers are still carried
    //! by whatever relays signals between the controllers, but frames never
    //! leave the process. Production links use [`crate::session::rtc`].

    use std::sync::{Arc, Mutex};
    use serde_json::{json, Value};
    use tracing::debug;

    use super::{LinkId, PeerBackend, PeerConnector, PeerEvent};
    use crate::session::{Inbox, SessionInput};

    #[derive(Clone)]
    struct Endpoint {
        link: LinkId,
        inbox: Inbox,
    }

    impl Endpoint {
        fn report(&self, event: PeerEvent) {
            let _ = self.inbox.send(SessionInput::Peer { link: self.link, event });
        }
    }

    #[derive(Default)]
    struct HubState {
        initiator: Option<Endpoint>,
        responder: Option<Endpoint>,
    }

    /// Shared medium for one pair of loopback connectors.
    #[derive(Clone, Default)]
    pub struct LoopbackHub {
        state: Arc<Mutex<HubState>>,
    }

    impl LoopbackHub {
        /// Create a hub.
        pub fn new() -> Self {
            Self::default()
        }

        /// A connector attached to this hub.
        pub fn connector(&self) -> LoopbackConnector {
            LoopbackConnector { hub: self.clone() }
        }
    }

    /// Connector producing loopback backends.
    pub struct LoopbackConnector {
        hub: LoopbackHub,
    }

    impl PeerConnector for LoopbackConnector {
        fn open(&mut self, link: LinkId, initiator: bool, inbox: Inbox) -> Box<dyn PeerBackend> {
            let endpoint = Endpoint { link, inbox };
            if initiator {
                endpoint.report(PeerEvent::Signal(json!({"type": "offer", "sdp": "loopback"})));
            }
            Box::new(LoopbackBackend {
                hub: self.hub.clone(),
                endpoint,
                initiator,
            })
        }
    }

    struct LoopbackBackend {
        hub: LoopbackHub,
        endpoint: Endpoint,
        initiator: bool,
    }

    impl LoopbackBackend {
        fn with_state<R>(&self, f: impl FnOnce(&mut HubState) -> R) -> Option<R> {
            self.hub.state.lock().ok().map(|mut state| f(&mut state))
        }
    }

    impl PeerBackend for LoopbackBackend {
        fn apply_signal(&mut self, signal: Value) {
            let kind = signal.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
            match (self.initiator, kind.as_str()) {
                (false, "offer") => {
                    let endpoint = self.endpoint.clone();
                    self.with_state(|state| state.responder = Some(endpoint));
                    self.endpoint.report(PeerEvent::Signal(json!({"type": "answer", "sdp": "loopback"})));
                }
                (true, "answer") => {
                    let endpoint = self.endpoint.clone();
                    let responder = self.with_state(|state| {
                        state.initiator = Some(endpoint);
                        state.responder.clone()
                    });
                    if let Some(Some(responder)) = responder {
                        self.endpoint.report(PeerEvent::Open);
                        responder.report(PeerEvent::Open);
                    }
                }
                _ => debug!("Loopback link {} ignoring {} signal", self.endpoint.link, kind),
            }
        }

        fn send_text(&mut self, text: String) -> bool {
            let initiator = self.initiator;
            let target = self.with_state(|state| {
                if initiator {
                    state.responder.clone()
                } else {
                    state.initiator.clone()
                }
            });
            match target.flatten() {
                Some(target) => {
                    target.report(PeerEvent::Frame(text));
                    true
                }
                _ => false,
            }
        }

        fn close(&mut self) {
            let initiator = self.initiator;
            let target = self.with_state(|state| {
                let (own, other) = if initiator {
                    (&mut state.initiator, &state.responder)
                } else {
                    (&mut state.responder, &state.initiator)
                };
                *own = None;
                other.clone()
            });
            if let Some(Some(target)) = target {
                target.report(PeerEvent::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionInput;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Journal {
        applied: Vec<Value>,
        sent: Vec<String>,
        closes: usize,
    }

    struct RecordingBackend(Arc<Mutex<Journal>>);

    impl PeerBackend for RecordingBackend {
        fn apply_signal(&mut self, signal: Value) {
            self.0.lock().unwrap().applied.push(signal);
        }
        fn send_text(&mut self, text: String) -> bool {
            self.0.lock().unwrap().sent.push(text);
            true
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    struct RecordingConnector(Arc<Mutex<Journal>>);

    impl PeerConnector for RecordingConnector {
        fn open(&mut self, _link: LinkId, _initiator: bool, _inbox: Inbox) -> Box<dyn PeerBackend> {
            Box::new(RecordingBackend(self.0.clone()))
        }
    }

    fn link_with(journal: &Arc<Mutex<Journal>>, buffered: &mut SignalBuffer) -> PeerLink {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connector = RecordingConnector(journal.clone());
        PeerLink::establish(&mut connector, 1, false, tx, buffered)
    }

    #[test]
    fn test_buffered_signals_replayed_once_in_order() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut buffered = SignalBuffer::new();
        buffered.push(json!({"type": "offer", "n": 1}));
        buffered.push(json!({"candidate": "a", "n": 2}));

        let mut link = link_with(&journal, &mut buffered);
        assert!(buffered.is_empty());
        link.apply_signal(json!({"n": 3}));

        let applied = journal.lock().unwrap().applied.clone();
        let order: Vec<_> = applied.iter().map(|s| s["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_send_requires_open_channel() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut link = link_with(&journal, &mut SignalBuffer::new());

        assert!(!link.send(&PeerMessage::Start));
        link.mark_open();
        assert!(link.send(&PeerMessage::ScoreDelta { delta: 1 }));
        assert_eq!(journal.lock().unwrap().sent, vec![r#"{"type":"score","delta":1}"#.to_string()]);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut link = link_with(&journal, &mut SignalBuffer::new());
        link.mark_open();

        link.destroy();
        link.destroy();
        assert!(!link.is_open());
        assert!(!link.send(&PeerMessage::End));
        drop(link);

        assert_eq!(journal.lock().unwrap().closes, 1);
    }

    #[test]
    fn test_benign_errors() {
        assert!(is_benign_error("OperationError: User-Initiated Abort, reason=Close called"));
        assert!(!is_benign_error("ICE failed"));
    }

    #[test]
    fn test_loopback_handshake_and_frames() {
        let hub = loopback::LoopbackHub::new();
        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();

        let mut host = PeerLink::establish(&mut hub.connector(), 1, true, host_tx, &mut SignalBuffer::new());
        let offer = match host_rx.try_recv() {
            Ok(SessionInput::Peer { link: 1, event: PeerEvent::Signal(s) }) => s,
            other => panic!("Expected offer, got {:?}", other),
        };

        let mut buffered = SignalBuffer::new();
        buffered.push(offer);
        let mut client = PeerLink::establish(&mut hub.connector(), 9, false, client_tx, &mut buffered);
        let answer = match client_rx.try_recv() {
            Ok(SessionInput::Peer { link: 9, event: PeerEvent::Signal(s) }) => s,
            other => panic!("Expected answer, got {:?}", other),
        };

        host.apply_signal(answer);
        assert!(matches!(host_rx.try_recv(), Ok(SessionInput::Peer { event: PeerEvent::Open, .. })));
        assert!(matches!(client_rx.try_recv(), Ok(SessionInput::Peer { event: PeerEvent::Open, .. })));

        host.mark_open();
        client.mark_open();
        assert!(host.send(&PeerMessage::Start));
        match client_rx.try_recv() {
            Ok(SessionInput::Peer { link: 9, event: PeerEvent::Frame(text) }) => {
                assert_eq!(PeerMessage::decode(&text).unwrap(), Some(PeerMessage::Start));
            }
            other => panic!("Expected frame, got {:?}", other),
        }

        client.destroy();
        assert!(matches!(host_rx.try_recv(), Ok(SessionInput::Peer { event: PeerEvent::Closed, .. })));
        assert!(!host.send(&PeerMessage::End));
    }
}
