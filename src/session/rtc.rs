//! WebRTC backend.
//!
//! Each link runs on its own task owning an `RTCPeerConnection`; the
//! controller talks to it through a command channel. ICE gathering is not
//! trickled: a description is only emitted once gathering has completed, so
//! every side sends exactly one signal.

use std::sync::Arc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::peer::{LinkId, PeerBackend, PeerConnector, PeerEvent};
use super::{Inbox, SessionInput};

/// Label of the single gameplay data channel.
pub const DATA_CHANNEL_LABEL: &str = "aimlink";

/// Backend errors, reported to the controller as `PeerEvent::Error`.
#[derive(Debug, thiserror::Error)]
pub enum RtcError {
    /// WebRTC stack error.
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// Counterpart sent something that is not a session description.
    #[error("Invalid session description: {0}")]
    Description(#[from] serde_json::Error),
}

enum RtcCommand {
    Signal(Value),
    Send(String),
}

#[derive(Clone)]
struct Reporter {
    link: LinkId,
    inbox: Inbox,
}

impl Reporter {
    fn report(&self, event: PeerEvent) {
        let _ = self.inbox.send(SessionInput::Peer { link: self.link, event });
    }
}

/// Opens webrtc-rs peer connections.
#[derive(Debug, Clone)]
pub struct RtcConnector {
    stun_servers: Vec<String>,
}

impl RtcConnector {
    /// Connector using the given STUN server URLs.
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

impl PeerConnector for RtcConnector {
    fn open(&mut self, link: LinkId, initiator: bool, inbox: Inbox) -> Box<dyn PeerBackend> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let reporter = Reporter { link, inbox };
        let servers = self.stun_servers.clone();

        tokio::spawn(async move {
            if let Err(e) = drive(initiator, servers, reporter.clone(), commands_rx).await {
                warn!("Link {} failed: {}", link, e);
                reporter.report(PeerEvent::Error(e.to_string()));
            }
        });

        Box::new(RtcBackend {
            commands: Some(commands_tx),
        })
    }
}

/// Handle to a running peer connection task.
struct RtcBackend {
    commands: Option<mpsc::UnboundedSender<RtcCommand>>,
}

impl PeerBackend for RtcBackend {
    fn apply_signal(&mut self, signal: Value) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(RtcCommand::Signal(signal));
        }
    }

    fn send_text(&mut self, text: String) -> bool {
        match &self.commands {
            Some(tx) => tx.send(RtcCommand::Send(text)).is_ok(),
            None => false,
        }
    }

    fn close(&mut self) {
        // The task closes the connection once its command channel ends.
        self.commands = None;
    }
}

async fn drive(
    initiator: bool,
    stun_servers: Vec<String>,
    reporter: Reporter,
    mut commands: mpsc::UnboundedReceiver<RtcCommand>,
) -> Result<(), RtcError> {
    let api = APIBuilder::new().build();
    let ice_servers = if stun_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: stun_servers,
            ..Default::default()
        }]
    };
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(config).await?);
    let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

    let state_reporter = reporter.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let reporter = state_reporter.clone();
        Box::pin(async move {
            debug!("Link {} connection state: {}", reporter.link, state);
            if state == RTCPeerConnectionState::Failed {
                reporter.report(PeerEvent::Error("peer connection failed".to_string()));
            }
        })
    }));

    let outcome = async {
        if initiator {
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
            wire_channel(&dc, reporter.clone());
            *channel.lock().await = Some(dc);

            let offer = pc.create_offer(None).await?;
            publish_local_description(&pc, offer, &reporter).await?;
        } else {
            let slot = channel.clone();
            let channel_reporter = reporter.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let reporter = channel_reporter.clone();
                Box::pin(async move {
                    debug!("Link {} received data channel '{}'", reporter.link, dc.label());
                    wire_channel(&dc, reporter);
                    *slot.lock().await = Some(dc);
                })
            }));
        }

        while let Some(command) = commands.recv().await {
            match command {
                RtcCommand::Signal(value) => {
                    let description: RTCSessionDescription = serde_json::from_value(value)?;
                    match description.sdp_type {
                        RTCSdpType::Offer if !initiator => {
                            pc.set_remote_description(description).await?;
                            let answer = pc.create_answer(None).await?;
                            publish_local_description(&pc, answer, &reporter).await?;
                        }
                        RTCSdpType::Answer if initiator => {
                            pc.set_remote_description(description).await?;
                        }
                        other => debug!("Link {} ignoring {} description", reporter.link, other),
                    }
                }
                RtcCommand::Send(text) => {
                    let dc = channel.lock().await.clone();
                    match dc {
                        Some(dc) => {
                            if let Err(e) = dc.send_text(text).await {
                                warn!("Link {} send failed: {}", reporter.link, e);
                            }
                        }
                        None => debug!("Link {} has no data channel yet", reporter.link),
                    }
                }
            }
        }
        Ok::<(), RtcError>(())
    }
    .await;

    // Closed on every exit path, errors included.
    info!("Closing link {}", reporter.link);
    let closed = pc.close().await;
    outcome?;
    closed?;
    Ok(())
}

/// Set the local description, wait for ICE gathering, then emit it whole.
async fn publish_local_description(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
    reporter: &Reporter,
) -> Result<(), RtcError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description).await?;
    let _ = gathered.recv().await;

    if let Some(local) = pc.local_description().await {
        reporter.report(PeerEvent::Signal(serde_json::to_value(&local)?));
    }
    Ok(())
}

fn wire_channel(dc: &Arc<RTCDataChannel>, reporter: Reporter) {
    let on_open = reporter.clone();
    dc.on_open(Box::new(move || {
        on_open.report(PeerEvent::Open);
        Box::pin(async {})
    }));

    let on_message = reporter.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        on_message.report(PeerEvent::Frame(text));
        Box::pin(async {})
    }));

    let on_close = reporter.clone();
    dc.on_close(Box::new(move || {
        on_close.report(PeerEvent::Closed);
        Box::pin(async {})
    }));

    dc.on_error(Box::new(move |err: webrtc::Error| {
        reporter.report(PeerEvent::Error(err.to_string()));
        Box::pin(async {})
    }));
}
