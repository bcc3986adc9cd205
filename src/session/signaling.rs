//! Relay connection, client side.
//!
//! [`SignalingClient`] owns one WebSocket to the relay. A background task
//! reports `Connected`, every decoded server event and exactly one
//! `Disconnected` into the controller inbox; outbound envelopes go through an
//! mpsc writer.

use std::collections::VecDeque;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{Inbox, SessionInput};
use crate::network::protocol::{ClientEnvelope, ServerEvent};

/// What the relay connection reports to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Transport is open; queued envelopes may be flushed.
    Connected,
    /// Event from the relay.
    Server(ServerEvent),
    /// Transport is gone, with a reason.
    Disconnected(String),
}

/// Outbound half of a relay connection.
pub trait SignalingSink: Send {
    /// Queue an envelope for the relay. Returns false if the transport is gone.
    fn send(&mut self, envelope: ClientEnvelope) -> bool;

    /// Close the connection after anything already queued.
    fn close(&mut self);
}

/// Opens relay connections.
pub trait SignalingConnector: Send {
    /// Start connecting; events are tagged with `generation`.
    fn connect(&mut self, generation: u64, inbox: Inbox) -> Box<dyn SignalingSink>;
}

/// Outbound events held back while the transport is not open yet.
#[derive(Debug, Default)]
pub struct PendingEventQueue {
    queue: VecDeque<ClientEnvelope>,
}

impl PendingEventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope.
    pub fn push(&mut self, envelope: ClientEnvelope) {
        self.queue.push_back(envelope);
    }

    /// Take everything in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = ClientEnvelope> + '_ {
        self.queue.drain(..)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// WebSocket connection to the relay.
pub struct SignalingClient {
    outgoing: Option<mpsc::UnboundedSender<ClientEnvelope>>,
}

impl SignalingClient {
    /// Spawn the connection task for `url`.
    pub fn spawn(url: String, generation: u64, inbox: Inbox) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(url, generation, inbox, outgoing_rx));
        Self {
            outgoing: Some(outgoing_tx),
        }
    }
}

impl SignalingSink for SignalingClient {
    fn send(&mut self, envelope: ClientEnvelope) -> bool {
        match &self.outgoing {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    fn close(&mut self) {
        // Dropping the sender lets the writer drain, then close the socket.
        self.outgoing = None;
    }
}

async fn run_connection(
    url: String,
    generation: u64,
    inbox: Inbox,
    mut outgoing_rx: mpsc::UnboundedReceiver<ClientEnvelope>,
) {
    let report = |event: SignalingEvent| {
        let _ = inbox.send(SessionInput::Signaling { generation, event });
    };

    info!("Connecting to relay {}...", url);
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("Failed to connect to relay: {}", e);
            report(SignalingEvent::Disconnected(e.to_string()));
            return;
        }
    };
    info!("Relay connected");
    report(SignalingEvent::Connected);

    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(envelope) => {
                        let json = match envelope.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize {}: {}", envelope.event.name(), e);
                                continue;
                            }
                        };
                        debug!("Sending: {}", json);
                        if let Err(e) = write.send(Message::Text(json)).await {
                            break e.to_string();
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        break "closed locally".to_string();
                    }
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            debug!("Received: {:?}", event);
                            report(SignalingEvent::Server(event));
                        }
                        Err(e) => {
                            warn!("Failed to parse relay message: {} - {}", e, text);
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        break "relay closed connection".to_string();
                    }
                    Some(Err(e)) => {
                        break e.to_string();
                    }
                    _ => {}
                }
            }
        }
    };

    info!("Relay connection ended: {}", reason);
    report(SignalingEvent::Disconnected(reason));
}

/// Connects to a relay WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connector for `url` (e.g. `ws://127.0.0.1:3000`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl SignalingConnector for WsConnector {
    fn connect(&mut self, generation: u64, inbox: Inbox) -> Box<dyn SignalingSink> {
        Box::new(SignalingClient::spawn(self.url.clone(), generation, inbox))
    }
}
