//! Session Controller
//!
//! Owns the duel state machine:
//!
//! ```text
//! Idle -> Connecting -> InLobby -> Negotiating -> Connected -> (3-2-1) -> Playing -> Ended
//!   ^                                                                                 |
//!   +------------------------------- dismiss / leave / error --------------------------+
//! ```
//!
//! The controller is driven by a single task consuming [`SessionInput`]s in
//! order. It publishes a [`SessionView`] snapshot after every input and emits
//! [`Cue`]s for the renderer.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::message::PeerMessage;
use super::peer::{is_benign_error, LinkId, PeerConnector, PeerEvent, PeerLink, SignalBuffer};
use super::signaling::{PendingEventQueue, SignalingConnector, SignalingEvent, SignalingSink};
use super::timer::{TickKind, Ticker};
use super::{Inbox, SessionInput};
use crate::network::protocol::{AckId, AckReply, ClientEnvelope, ClientEvent, LobbyCode, ServerEvent};
use crate::network::registry::{LobbyError, Role};

/// Nick shown for the counterpart until it announces itself.
pub const REMOTE_PLACEHOLDER: &str = "Connecting...";

// =============================================================================
// CONFIG
// =============================================================================

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Local display name.
    pub nick: String,
    /// Initial target size.
    pub target_size: f64,
    /// Initial round length in seconds.
    pub game_duration: f64,
    /// Countdown length in ticks.
    pub countdown: u32,
    /// Countdown tick period.
    pub countdown_period: Duration,
    /// In-round clock tick period.
    pub clock_period: Duration,
    /// STUN server URLs for the peer connection.
    pub stun_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: format!("ws://127.0.0.1:{}", crate::DEFAULT_RELAY_PORT),
            nick: "Player".to_string(),
            target_size: 1.5,
            game_duration: 30.0,
            countdown: crate::COUNTDOWN_SECONDS,
            countdown_period: Duration::from_secs(1),
            clock_period: Duration::from_millis(100),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl SessionConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relay_url: std::env::var("AIMLINK_RELAY_URL").unwrap_or(defaults.relay_url),
            nick: std::env::var("AIMLINK_NICK").unwrap_or(defaults.nick),
            stun_servers: std::env::var("AIMLINK_STUN")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.stun_servers),
            ..defaults
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No lobby.
    Idle,
    /// Create or join sent, waiting for the relay.
    Connecting,
    /// In a lobby, no peer link yet.
    InLobby,
    /// Peer link negotiating.
    Negotiating,
    /// Data channel open. The countdown runs in this state.
    Connected,
    /// Round running.
    Playing,
    /// Round over, results available.
    Ended,
}

/// Session errors surfaced to the collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Join to an unknown code.
    #[error("Lobby not found")]
    NotFound,

    /// Join to a lobby that already has a client.
    #[error("Lobby full")]
    Full,

    /// Relay connection failed or dropped.
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// Peer connection failed.
    #[error("Peer negotiation failed: {0}")]
    Negotiation(String),

    /// Unusable message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Intent not valid in the current state.
    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        /// Rejected action.
        action: &'static str,
        /// State at the time.
        state: SessionState,
    },

    /// Setting must be positive and finite.
    #[error("Invalid setting value: {0}")]
    InvalidSetting(f64),

    /// Only the host may do this.
    #[error("Only the host can do that")]
    NotHost,
}

/// Local request from the collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionIntent {
    /// Open a new lobby as host.
    Create,
    /// Join a lobby as client.
    Join(LobbyCode),
    /// Start the round (host).
    Start,
    /// End the round early.
    Stop,
    /// Local hit.
    Hit,
    /// Local miss.
    Miss,
    /// Leave the session from any state.
    Leave,
    /// Dismiss the results screen.
    Dismiss,
    /// Change the local display name.
    SetNick(String),
    /// Change the target size (host).
    SetTargetSize(f64),
    /// Change the round length in seconds (host).
    SetGameDuration(f64),
}

/// One-shot notifications for the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Recenter the camera and clear targets.
    ResetView,
    /// Countdown finished, round is live.
    RoundStarted,
    /// Round is over.
    RoundStopped,
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSlot {
    /// Display name.
    pub nick: String,
    /// Current score.
    pub score: i32,
    /// Whether this is the local player.
    pub is_local: bool,
}

impl PlayerSlot {
    fn local(nick: String) -> Self {
        Self { nick, score: 0, is_local: true }
    }

    fn remote_placeholder() -> Self {
        Self {
            nick: REMOTE_PLACEHOLDER.to_string(),
            score: 0,
            is_local: false,
        }
    }
}

/// Both players, local first.
#[derive(Debug, Clone, PartialEq)]
pub struct Roster {
    /// Local player.
    pub local: PlayerSlot,
    /// Counterpart, once a peer link exists.
    pub remote: Option<PlayerSlot>,
}

impl Roster {
    /// Players in display order.
    pub fn players(&self) -> impl Iterator<Item = &PlayerSlot> {
        std::iter::once(&self.local).chain(self.remote.iter())
    }

    fn reset_scores(&mut self) {
        self.local.score = 0;
        if let Some(remote) = self.remote.as_mut() {
            remote.score = 0;
        }
    }
}

/// Who won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nick of the higher score.
    Winner(String),
    /// Equal scores.
    Tie,
}

/// Final scores of a round.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResults {
    /// `(nick, score)` in roster order.
    pub scores: Vec<(String, i32)>,
    /// Outcome.
    pub outcome: Outcome,
}

impl MatchResults {
    /// Snapshot the roster.
    pub fn from_roster(roster: &Roster) -> Self {
        let scores: Vec<_> = roster.players().map(|p| (p.nick.clone(), p.score)).collect();
        let remote_score = roster.remote.as_ref().map(|r| r.score).unwrap_or(0);

        let outcome = match roster.local.score.cmp(&remote_score) {
            std::cmp::Ordering::Greater => Outcome::Winner(roster.local.nick.clone()),
            std::cmp::Ordering::Less => Outcome::Winner(
                roster
                    .remote
                    .as_ref()
                    .map(|r| r.nick.clone())
                    .unwrap_or_default(),
            ),
            std::cmp::Ordering::Equal => Outcome::Tie,
        };

        Self { scores, outcome }
    }
}

/// Snapshot published to the collaborator after every input.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    /// Lifecycle state.
    pub state: SessionState,
    /// Role, fixed once a lobby is requested.
    pub role: Option<Role>,
    /// Lobby code.
    pub code: Option<LobbyCode>,
    /// Players and scores.
    pub roster: Roster,
    /// Countdown value while counting down.
    pub countdown: Option<u32>,
    /// Seconds left while playing.
    pub time_left: Option<f64>,
    /// Results once the round ended.
    pub results: Option<MatchResults>,
    /// Last error.
    pub error: Option<SessionError>,
    /// Target size in effect.
    pub target_size: f64,
    /// Round length in effect, seconds.
    pub game_duration: f64,
}

impl SessionView {
    fn new(config: &SessionConfig) -> Self {
        Self {
            state: SessionState::Idle,
            role: None,
            code: None,
            roster: Roster {
                local: PlayerSlot::local(config.nick.clone()),
                remote: None,
            },
            countdown: None,
            time_left: None,
            results: None,
            error: None,
            target_size: config.target_size,
            game_duration: config.game_duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Create,
    Join,
}

#[derive(Debug, Clone, Copy)]
enum Setting {
    TargetSize,
    GameDuration,
}

// =============================================================================
// HANDLE
// =============================================================================

/// What the collaborator holds: an intent sender, the view and the cue stream.
pub struct SessionHandle {
    inbox: Inbox,
    view: watch::Receiver<SessionView>,
    cues: mpsc::UnboundedReceiver<Cue>,
}

impl SessionHandle {
    /// Raise an intent. Returns false if the controller is gone.
    pub fn send(&self, intent: SessionIntent) -> bool {
        self.inbox.send(SessionInput::Intent(intent)).is_ok()
    }

    /// Current view.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Another receiver for the view.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Wait for the next view change.
    pub async fn changed(&mut self) -> Option<SessionView> {
        self.view.changed().await.ok()?;
        Some(self.view.borrow_and_update().clone())
    }

    /// Wait for the next cue.
    pub async fn next_cue(&mut self) -> Option<Cue> {
        self.cues.recv().await
    }

    /// Next cue if one is ready.
    pub fn try_cue(&mut self) -> Option<Cue> {
        self.cues.try_recv().ok()
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// The session state machine.
pub struct SessionController {
    config: SessionConfig,
    inbox: Inbox,
    inputs: mpsc::UnboundedReceiver<SessionInput>,

    signaling_connector: Box<dyn SignalingConnector>,
    signaling: Option<Box<dyn SignalingSink>>,
    signaling_open: bool,
    generation: u64,
    pending: PendingEventQueue,
    acks: HashMap<AckId, AckKind>,
    next_ack: AckId,

    peer_connector: Box<dyn PeerConnector>,
    link: Option<PeerLink>,
    next_link: LinkId,
    early_signals: SignalBuffer,

    /// Set once a start handshake is in flight.
    keep_alive: bool,
    end_sent: bool,
    epoch: u64,
    countdown_timer: Option<Ticker>,
    clock_timer: Option<Ticker>,
    round_started: Option<Instant>,

    view: SessionView,
    view_tx: watch::Sender<SessionView>,
    cue_tx: mpsc::UnboundedSender<Cue>,
}

impl SessionController {
    /// Create a controller and the handle its collaborator uses.
    pub fn new(
        config: SessionConfig,
        signaling_connector: impl SignalingConnector + 'static,
        peer_connector: impl PeerConnector + 'static,
    ) -> (Self, SessionHandle) {
        let (inbox, inputs) = mpsc::unbounded_channel();
        let view = SessionView::new(&config);
        let (view_tx, view_rx) = watch::channel(view.clone());
        let (cue_tx, cue_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            inbox: inbox.clone(),
            view: view_rx,
            cues: cue_rx,
        };

        let controller = Self {
            config,
            inbox,
            inputs,
            signaling_connector: Box::new(signaling_connector),
            signaling: None,
            signaling_open: false,
            generation: 0,
            pending: PendingEventQueue::new(),
            acks: HashMap::new(),
            next_ack: 0,
            peer_connector: Box::new(peer_connector),
            link: None,
            next_link: 0,
            early_signals: SignalBuffer::new(),
            keep_alive: false,
            end_sent: false,
            epoch: 0,
            countdown_timer: None,
            clock_timer: None,
            round_started: None,
            view,
            view_tx,
            cue_tx,
        };

        (controller, handle)
    }

    /// Process inputs until every view receiver is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
                _ = self.view_tx.closed() => break,
            }
        }
        self.teardown();
        info!("Session controller stopped");
    }

    /// Process every input that is already queued. Returns how many ran.
    pub fn drain_ready(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inputs.try_recv() {
            self.handle(input);
            handled += 1;
        }
        handled
    }

    /// Current view.
    pub fn view(&self) -> &SessionView {
        &self.view
    }

    /// Current timer epoch.
    pub fn timer_epoch(&self) -> u64 {
        self.epoch
    }

    /// Id of the live peer link.
    pub fn link_id(&self) -> Option<LinkId> {
        self.link.as_ref().map(PeerLink::id)
    }

    /// Apply one input and publish the resulting view.
    pub fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Intent(intent) => {
                debug!("Intent {:?} in {:?}", intent, self.view.state);
                if let Err(e) = self.on_intent(intent) {
                    warn!("Intent rejected: {}", e);
                    self.view.error = Some(e);
                }
            }
            SessionInput::Signaling { generation, event } => {
                if generation == self.generation && self.signaling.is_some() {
                    self.on_signaling(event);
                } else {
                    debug!("Ignoring stale signaling event {:?}", event);
                }
            }
            SessionInput::Peer { link, event } => {
                if self.link_id() == Some(link) {
                    self.on_peer(event);
                } else {
                    debug!("Ignoring event from stale link {}", link);
                }
            }
            SessionInput::Tick { epoch, kind, at } => {
                if epoch != self.epoch {
                    debug!("Ignoring stale {:?} tick", kind);
                } else {
                    match kind {
                        TickKind::Countdown => self.on_countdown_tick(at),
                        TickKind::Clock => self.on_clock_tick(at),
                    }
                }
            }
        }
        self.view_tx.send_replace(self.view.clone());
    }

    // -------------------------------------------------------------------------
    // Intents
    // -------------------------------------------------------------------------

    fn on_intent(&mut self, intent: SessionIntent) -> Result<(), SessionError> {
        match intent {
            SessionIntent::Create => self.open_lobby(None),
            SessionIntent::Join(code) => self.open_lobby(Some(code)),
            SessionIntent::Start => self.local_start(),
            SessionIntent::Stop => {
                self.require(SessionState::Playing, "stop")?;
                self.finalize();
                Ok(())
            }
            SessionIntent::Hit => {
                self.score_local(1);
                Ok(())
            }
            SessionIntent::Miss => {
                self.score_local(-1);
                Ok(())
            }
            SessionIntent::Leave => {
                if self.view.state != SessionState::Idle {
                    info!("Leaving session");
                    self.teardown();
                }
                Ok(())
            }
            SessionIntent::Dismiss => match self.view.state {
                SessionState::Ended => {
                    self.teardown();
                    Ok(())
                }
                SessionState::Idle => Ok(()),
                state => Err(SessionError::InvalidState { action: "dismiss", state }),
            },
            SessionIntent::SetNick(nick) => match self.view.state {
                SessionState::Idle | SessionState::Connecting | SessionState::InLobby => {
                    self.view.roster.local.nick = nick;
                    Ok(())
                }
                state => Err(SessionError::InvalidState { action: "change nick", state }),
            },
            SessionIntent::SetTargetSize(value) => self.change_setting(Setting::TargetSize, value),
            SessionIntent::SetGameDuration(value) => self.change_setting(Setting::GameDuration, value),
        }
    }

    fn require(&self, state: SessionState, action: &'static str) -> Result<(), SessionError> {
        if self.view.state == state {
            Ok(())
        } else {
            Err(SessionError::InvalidState { action, state: self.view.state })
        }
    }

    #[instrument(skip(self))]
    fn open_lobby(&mut self, code: Option<LobbyCode>) -> Result<(), SessionError> {
        let (role, kind, action) = match code {
            None => (Role::Host, AckKind::Create, "create a lobby"),
            Some(_) => (Role::Client, AckKind::Join, "join a lobby"),
        };
        self.require(SessionState::Idle, action)?;

        self.view.error = None;
        self.view.results = None;
        self.view.role = Some(role);
        self.view.code = code.clone();
        self.view.state = SessionState::Connecting;

        self.ensure_signaling();
        self.next_ack += 1;
        let ack = self.next_ack;
        self.acks.insert(ack, kind);

        let event = match code {
            None => ClientEvent::Create,
            Some(code) => ClientEvent::Join { code },
        };
        self.emit(ClientEnvelope::acked(ack, event));
        Ok(())
    }

    fn local_start(&mut self) -> Result<(), SessionError> {
        if self.view.role != Some(Role::Host) {
            return Err(SessionError::NotHost);
        }
        self.require(SessionState::Connected, "start")?;
        if self.view.countdown.is_some() {
            debug!("Countdown already running");
            return Ok(());
        }
        self.begin_round(true);
        Ok(())
    }

    fn change_setting(&mut self, setting: Setting, value: f64) -> Result<(), SessionError> {
        if !(value.is_finite() && value > 0.0) {
            return Err(SessionError::InvalidSetting(value));
        }
        if self.view.role == Some(Role::Client) {
            return Err(SessionError::NotHost);
        }
        if self.view.state == SessionState::Playing || self.view.countdown.is_some() {
            return Err(SessionError::InvalidState {
                action: "change settings",
                state: self.view.state,
            });
        }

        let message = match setting {
            Setting::TargetSize => {
                self.view.target_size = value;
                PeerMessage::TargetSize { value }
            }
            Setting::GameDuration => {
                self.view.game_duration = value;
                PeerMessage::GameDuration { value }
            }
        };
        if self.view.state == SessionState::Connected {
            self.send_peer(&message);
        }
        Ok(())
    }

    fn score_local(&mut self, delta: i32) {
        if self.view.state != SessionState::Playing {
            debug!("Ignoring score change outside a round");
            return;
        }
        self.view.roster.local.score = self.view.roster.local.score.saturating_add(delta);
        self.send_peer(&PeerMessage::ScoreDelta { delta });
    }

    // -------------------------------------------------------------------------
    // Relay
    // -------------------------------------------------------------------------

    fn ensure_signaling(&mut self) {
        if self.signaling.is_none() {
            self.generation += 1;
            self.signaling_open = false;
            self.signaling = Some(self.signaling_connector.connect(self.generation, self.inbox.clone()));
        }
    }

    /// Send now if the transport is open, queue otherwise.
    fn emit(&mut self, envelope: ClientEnvelope) {
        match self.signaling.as_mut() {
            Some(sink) if self.signaling_open => {
                if !sink.send(envelope) {
                    warn!("Relay connection gone, event dropped");
                }
            }
            _ => self.pending.push(envelope),
        }
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                self.signaling_open = true;
                let queued: Vec<_> = self.pending.drain().collect();
                debug!("Relay open, flushing {} queued event(s)", queued.len());
                for envelope in queued {
                    self.emit(envelope);
                }
            }
            SignalingEvent::Disconnected(reason) => {
                self.signaling = None;
                self.signaling_open = false;
                if self.keep_alive {
                    info!("Relay disconnected during start hand-off, ignored: {}", reason);
                } else if self.view.state != SessionState::Idle {
                    self.fail(SessionError::Transport(reason));
                }
            }
            SignalingEvent::Server(event) => self.on_server(event),
        }
    }

    fn on_server(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Ack { id, reply } => match self.acks.remove(&id) {
                Some(kind) => match reply {
                    AckReply::Done { code } => self.lobby_confirmed(kind, code),
                    AckReply::Failed { error } => self.lobby_refused(&error),
                },
                None => debug!("Ack {} needs no action", id),
            },
            ServerEvent::Created { code } => {
                if self.view.role == Some(Role::Host) {
                    self.lobby_confirmed(AckKind::Create, Some(code));
                }
            }
            ServerEvent::Joined { code } => {
                if self.view.role == Some(Role::Client) {
                    self.lobby_confirmed(AckKind::Join, Some(code));
                }
            }
            ServerEvent::Error { message } => {
                if self.view.state == SessionState::Connecting {
                    self.lobby_refused(&message);
                } else {
                    warn!("Relay error: {}", message);
                }
            }
            ServerEvent::PeerJoined => {
                if self.view.role == Some(Role::Host) && self.view.state == SessionState::InLobby {
                    info!("Peer joined, negotiating");
                    self.begin_negotiation(true);
                } else {
                    debug!("Ignoring peer-joined in {:?}", self.view.state);
                }
            }
            ServerEvent::Signal { signal } => self.inbound_signal(signal),
            ServerEvent::Start => self.begin_round(false),
            ServerEvent::PeerLeft => self.peer_left(),
            ServerEvent::Closed => self.lobby_closed(),
        }
    }

    fn lobby_confirmed(&mut self, kind: AckKind, code: Option<LobbyCode>) {
        if self.view.state != SessionState::Connecting {
            debug!("Duplicate lobby confirmation ignored");
            return;
        }
        if let Some(code) = code {
            self.view.code = Some(code);
        }
        let Some(code) = self.view.code.clone() else {
            self.fail(SessionError::Protocol("lobby confirmed without a code".to_string()));
            return;
        };

        self.view.state = SessionState::InLobby;
        info!("In lobby {} as {:?}", code, self.view.role);

        if kind == AckKind::Join {
            self.begin_negotiation(false);
        }
    }

    fn lobby_refused(&mut self, message: &str) {
        if self.view.state != SessionState::Connecting {
            debug!("Late lobby refusal ignored: {}", message);
            return;
        }
        let error = if message == LobbyError::NotFound.to_string() {
            SessionError::NotFound
        } else if message == LobbyError::Full.to_string() {
            SessionError::Full
        } else {
            SessionError::Transport(message.to_string())
        };
        self.fail(error);
    }

    fn inbound_signal(&mut self, signal: serde_json::Value) {
        match (self.link.as_mut(), self.view.state) {
            (Some(link), _) => link.apply_signal(signal),
            (None, SessionState::Connecting | SessionState::InLobby | SessionState::Negotiating) => {
                debug!("No link yet, buffering signal");
                self.early_signals.push(signal);
            }
            (None, state) => debug!("Dropping signal in {:?}", state),
        }
    }

    fn peer_left(&mut self) {
        if self.view.role != Some(Role::Host) {
            return;
        }
        if self.keep_alive {
            debug!("peer-left during start hand-off ignored");
            return;
        }
        match self.view.state {
            SessionState::InLobby | SessionState::Negotiating | SessionState::Connected => {
                info!("Peer left, lobby open again");
                self.drop_peer();
            }
            state => debug!("Ignoring peer-left in {:?}", state),
        }
    }

    fn lobby_closed(&mut self) {
        if self.view.role != Some(Role::Client) {
            return;
        }
        if self.keep_alive {
            debug!("Lobby close during start hand-off ignored");
            return;
        }
        if self.view.state != SessionState::Idle {
            self.fail(SessionError::Transport("lobby closed by host".to_string()));
        }
    }

    // -------------------------------------------------------------------------
    // Peer
    // -------------------------------------------------------------------------

    fn begin_negotiation(&mut self, initiator: bool) {
        self.view.state = SessionState::Negotiating;
        self.next_link += 1;
        let link = PeerLink::establish(
            self.peer_connector.as_mut(),
            self.next_link,
            initiator,
            self.inbox.clone(),
            &mut self.early_signals,
        );
        self.link = Some(link);
        self.view.roster.remote = Some(PlayerSlot::remote_placeholder());
    }

    fn drop_peer(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.destroy();
        }
        self.early_signals.clear();
        self.stop_timers();
        self.keep_alive = false;
        self.view.countdown = None;
        self.view.roster.remote = None;
        self.view.state = SessionState::InLobby;
    }

    fn send_peer(&mut self, message: &PeerMessage) {
        if let Some(link) = self.link.as_mut() {
            if !link.send(message) {
                debug!("Peer message {:?} not delivered", message);
            }
        }
    }

    fn on_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Signal(signal) => match self.view.code.clone() {
                Some(code) => self.emit(ClientEnvelope::fire(ClientEvent::Signal { code, signal })),
                None => debug!("No lobby code, dropping local signal"),
            },
            PeerEvent::Open => self.channel_open(),
            PeerEvent::Frame(text) => match PeerMessage::decode(&text) {
                Ok(Some(message)) => self.on_message(message),
                Ok(None) => debug!("Ignoring unknown peer message: {}", text),
                Err(e) => warn!("{}, frame dropped", e),
            },
            PeerEvent::Error(message) => {
                if is_benign_error(&message) {
                    debug!("Peer closed: {}", message);
                } else {
                    warn!("Peer error: {}", message);
                    self.view.error = Some(SessionError::Negotiation(message));
                }
            }
            PeerEvent::Closed => self.channel_closed(),
        }
    }

    fn channel_open(&mut self) {
        if self.view.state != SessionState::Negotiating {
            debug!("Data channel open in {:?}", self.view.state);
            return;
        }
        if let Some(link) = self.link.as_mut() {
            link.mark_open();
        }
        self.view.state = SessionState::Connected;
        info!("Data channel open");

        let mut greeting = vec![PeerMessage::Nick {
            nick: self.view.roster.local.nick.clone(),
        }];
        if self.view.role == Some(Role::Host) {
            greeting.push(PeerMessage::TargetSize { value: self.view.target_size });
            greeting.push(PeerMessage::GameDuration { value: self.view.game_duration });
        }
        for message in &greeting {
            self.send_peer(message);
        }
    }

    fn channel_closed(&mut self) {
        match self.view.state {
            SessionState::Playing => {
                info!("Data channel closed mid-round");
                self.finalize();
            }
            SessionState::Negotiating | SessionState::Connected => {
                if self.view.role == Some(Role::Host) {
                    info!("Data channel closed, waiting for a new peer");
                    self.drop_peer();
                } else {
                    self.fail(SessionError::Negotiation("data channel closed".to_string()));
                }
            }
            state => debug!("Data channel closed in {:?}", state),
        }
    }

    fn on_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::Nick { nick } => {
                if let Some(remote) = self.view.roster.remote.as_mut() {
                    remote.nick = nick;
                }
            }
            PeerMessage::Start => self.begin_round(false),
            PeerMessage::ScoreDelta { delta } => {
                match (self.view.state, self.view.roster.remote.as_mut()) {
                    (SessionState::Playing, Some(remote)) => remote.score = remote.score.saturating_add(delta),
                    (state, _) => debug!("Ignoring score delta in {:?}", state),
                }
            }
            PeerMessage::End => {
                if self.view.state == SessionState::Playing {
                    info!("Peer ended the round");
                    self.finalize();
                } else {
                    debug!("Ignoring end in {:?}", self.view.state);
                }
            }
            PeerMessage::TargetSize { value } => {
                if self.view.role == Some(Role::Client) {
                    self.view.target_size = value;
                }
            }
            PeerMessage::GameDuration { value } => {
                if self.view.role == Some(Role::Client) {
                    self.view.game_duration = value;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Round
    // -------------------------------------------------------------------------

    fn begin_round(&mut self, announce: bool) {
        if self.view.state != SessionState::Connected || self.view.countdown.is_some() {
            debug!("Start ignored in {:?}", self.view.state);
            return;
        }
        self.keep_alive = true;

        if announce {
            self.send_peer(&PeerMessage::Start);
            if let Some(code) = self.view.code.clone() {
                self.emit(ClientEnvelope::fire(ClientEvent::Start { code }));
            }
        }

        self.cue(Cue::ResetView);
        self.view.roster.reset_scores();
        self.view.results = None;
        self.end_sent = false;

        self.stop_timers();
        if self.config.countdown == 0 {
            self.enter_playing(Instant::now());
            return;
        }
        info!("Round starting in {}", self.config.countdown);
        self.view.countdown = Some(self.config.countdown);
        self.countdown_timer = Some(Ticker::spawn(
            self.config.countdown_period,
            self.epoch,
            TickKind::Countdown,
            self.inbox.clone(),
        ));
    }

    fn on_countdown_tick(&mut self, at: Instant) {
        let Some(remaining) = self.view.countdown else {
            return;
        };
        let remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            self.enter_playing(at);
        } else {
            self.view.countdown = Some(remaining);
        }
    }

    fn enter_playing(&mut self, at: Instant) {
        self.countdown_timer = None;
        self.view.countdown = None;
        self.view.state = SessionState::Playing;
        self.view.time_left = Some(self.view.game_duration);
        self.round_started = Some(at);
        self.clock_timer = Some(Ticker::spawn(
            self.config.clock_period,
            self.epoch,
            TickKind::Clock,
            self.inbox.clone(),
        ));
        info!("Round live for {}s", self.view.game_duration);
        self.cue(Cue::RoundStarted);
    }

    fn on_clock_tick(&mut self, at: Instant) {
        if self.view.state != SessionState::Playing {
            return;
        }
        let Some(started) = self.round_started else {
            return;
        };
        let elapsed = at.saturating_duration_since(started).as_secs_f64();
        let remaining = (self.view.game_duration - elapsed).max(0.0);
        self.view.time_left = Some(remaining);
        if remaining <= 0.0 {
            info!("Round timer elapsed");
            self.finalize();
        }
    }

    /// End the round. Runs once per round; `End` goes out at most once.
    fn finalize(&mut self) {
        if self.view.state != SessionState::Playing {
            debug!("Round already finalized");
            return;
        }
        self.stop_timers();
        self.round_started = None;

        if !self.end_sent {
            self.end_sent = true;
            self.send_peer(&PeerMessage::End);
        }

        let results = MatchResults::from_roster(&self.view.roster);
        info!("Round over: {:?} {:?}", results.scores, results.outcome);
        self.view.results = Some(results);
        self.view.state = SessionState::Ended;
        self.cue(Cue::RoundStopped);
    }

    fn stop_timers(&mut self) {
        self.countdown_timer = None;
        self.clock_timer = None;
        self.epoch += 1;
    }

    fn cue(&self, cue: Cue) {
        let _ = self.cue_tx.send(cue);
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    fn fail(&mut self, error: SessionError) {
        warn!("Session failed: {}", error);
        self.teardown();
        self.view.error = Some(error);
    }

    /// Back to `Idle`: leave the lobby, close everything, forget everything.
    fn teardown(&mut self) {
        if let (Some(code), true) = (self.view.code.clone(), self.signaling_open) {
            if let Some(sink) = self.signaling.as_mut() {
                sink.send(ClientEnvelope::fire(ClientEvent::Leave { code }));
            }
        }
        if let Some(mut sink) = self.signaling.take() {
            sink.close();
        }
        self.signaling_open = false;
        self.generation += 1;
        self.pending.clear();
        self.acks.clear();

        if let Some(mut link) = self.link.take() {
            link.destroy();
        }
        self.early_signals.clear();
        self.keep_alive = false;
        self.end_sent = false;
        self.stop_timers();
        self.round_started = None;

        let nick = std::mem::take(&mut self.view.roster.local.nick);
        self.view = SessionView {
            target_size: self.view.target_size,
            game_duration: self.view.game_duration,
            ..SessionView::new(&self.config)
        };
        self.view.roster.local.nick = nick;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use crate::session::peer::PeerBackend;

    #[derive(Default)]
    struct Wire {
        sent: Vec<ClientEnvelope>,
        connects: usize,
        closes: usize,
    }

    struct FakeSink(Arc<Mutex<Wire>>);

    impl SignalingSink for FakeSink {
        fn send(&mut self, envelope: ClientEnvelope) -> bool {
            self.0.lock().unwrap().sent.push(envelope);
            true
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    struct FakeRelay(Arc<Mutex<Wire>>);

    impl SignalingConnector for FakeRelay {
        fn connect(&mut self, _generation: u64, _inbox: Inbox) -> Box<dyn SignalingSink> {
            self.0.lock().unwrap().connects += 1;
            Box::new(FakeSink(self.0.clone()))
        }
    }

    #[derive(Default)]
    struct Channel {
        applied: Vec<Value>,
        frames: Vec<PeerMessage>,
        closes: usize,
    }

    struct FakeBackend(Arc<Mutex<Channel>>);

    impl PeerBackend for FakeBackend {
        fn apply_signal(&mut self, signal: Value) {
            self.0.lock().unwrap().applied.push(signal);
        }
        fn send_text(&mut self, text: String) -> bool {
            let message = PeerMessage::decode(&text).unwrap().unwrap();
            self.0.lock().unwrap().frames.push(message);
            true
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    struct FakePeers(Arc<Mutex<Channel>>);

    impl PeerConnector for FakePeers {
        fn open(&mut self, _link: LinkId, _initiator: bool, _inbox: Inbox) -> Box<dyn PeerBackend> {
            Box::new(FakeBackend(self.0.clone()))
        }
    }

    struct Rig {
        controller: SessionController,
        handle: SessionHandle,
        wire: Arc<Mutex<Wire>>,
        channel: Arc<Mutex<Channel>>,
    }

    impl Rig {
        fn new() -> Self {
            let wire = Arc::new(Mutex::new(Wire::default()));
            let channel = Arc::new(Mutex::new(Channel::default()));
            let config = SessionConfig {
                nick: "me".to_string(),
                // Tickers never fire on their own; tests feed ticks by hand.
                countdown_period: Duration::from_secs(3600),
                clock_period: Duration::from_secs(3600),
                ..Default::default()
            };
            let (controller, handle) =
                SessionController::new(config, FakeRelay(wire.clone()), FakePeers(channel.clone()));
            Self { controller, handle, wire, channel }
        }

        fn intent(&mut self, intent: SessionIntent) {
            self.controller.handle(SessionInput::Intent(intent));
        }

        fn relay(&mut self, event: SignalingEvent) {
            let generation = self.controller.generation;
            self.controller.handle(SessionInput::Signaling { generation, event });
        }

        fn server(&mut self, event: ServerEvent) {
            self.relay(SignalingEvent::Server(event));
        }

        fn peer(&mut self, event: PeerEvent) {
            let link = self.controller.link_id().expect("no link");
            self.controller.handle(SessionInput::Peer { link, event });
        }

        fn frame(&mut self, message: PeerMessage) {
            self.peer(PeerEvent::Frame(message.encode().unwrap()));
        }

        fn tick(&mut self, kind: TickKind, at: Instant) {
            let epoch = self.controller.timer_epoch();
            self.controller.handle(SessionInput::Tick { epoch, kind, at });
        }

        fn state(&self) -> SessionState {
            self.controller.view().state
        }

        fn sent_events(&self) -> Vec<ClientEvent> {
            self.wire.lock().unwrap().sent.iter().map(|e| e.event.clone()).collect()
        }

        fn frames(&self) -> Vec<PeerMessage> {
            self.channel.lock().unwrap().frames.clone()
        }

        fn last_ack(&self) -> AckId {
            self.wire.lock().unwrap().sent.iter().rev().find_map(|e| e.ack).unwrap()
        }

        fn cues(&mut self) -> Vec<Cue> {
            std::iter::from_fn(|| self.handle.try_cue()).collect()
        }

        /// Host connected to a peer with an open channel.
        fn connected_host() -> Self {
            let mut rig = Rig::new();
            rig.intent(SessionIntent::Create);
            rig.relay(SignalingEvent::Connected);
            let ack = rig.last_ack();
            rig.server(ServerEvent::Ack { id: ack, reply: AckReply::with_code(LobbyCode::new("ab12cd")) });
            rig.server(ServerEvent::PeerJoined);
            rig.peer(PeerEvent::Open);
            rig
        }

        /// Client with an open channel that just received the host's start.
        fn starting_client() -> Self {
            let mut rig = Rig::new();
            rig.intent(SessionIntent::Join(code()));
            rig.relay(SignalingEvent::Connected);
            let ack = rig.last_ack();
            rig.server(ServerEvent::Ack { id: ack, reply: AckReply::with_code(code()) });
            rig.peer(PeerEvent::Open);
            rig.frame(PeerMessage::Start);
            rig
        }

        /// Host in the middle of a round that started at `t0`.
        fn playing_host(t0: Instant) -> Self {
            let mut rig = Rig::connected_host();
            rig.intent(SessionIntent::Start);
            for _ in 0..3 {
                rig.tick(TickKind::Countdown, t0);
            }
            rig
        }
    }

    fn code() -> LobbyCode {
        LobbyCode::new("ab12cd")
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.target_size, 1.5);
        assert_eq!(config.game_duration, 30.0);
        assert_eq!(config.countdown, 3);
        assert_eq!(config.clock_period, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_host_sequence_reaches_playing() {
        let mut rig = Rig::new();
        assert_eq!(rig.state(), SessionState::Idle);

        rig.intent(SessionIntent::Create);
        assert_eq!(rig.state(), SessionState::Connecting);
        assert!(rig.sent_events().is_empty(), "nothing sent before the transport opens");

        rig.relay(SignalingEvent::Connected);
        assert_eq!(rig.sent_events(), vec![ClientEvent::Create]);

        let ack = rig.last_ack();
        rig.server(ServerEvent::Ack { id: ack, reply: AckReply::with_code(code()) });
        assert_eq!(rig.state(), SessionState::InLobby);
        assert_eq!(rig.controller.view().code, Some(code()));
        assert_eq!(rig.controller.view().role, Some(Role::Host));

        // Duplicate confirmation is a no-op.
        rig.server(ServerEvent::Created { code: code() });
        assert_eq!(rig.state(), SessionState::InLobby);

        rig.server(ServerEvent::PeerJoined);
        assert_eq!(rig.state(), SessionState::Negotiating);
        assert_eq!(rig.controller.view().roster.remote.as_ref().unwrap().nick, REMOTE_PLACEHOLDER);

        rig.peer(PeerEvent::Signal(json!({"type": "offer", "sdp": "x"})));
        assert_eq!(
            rig.sent_events().last(),
            Some(&ClientEvent::Signal { code: code(), signal: json!({"type": "offer", "sdp": "x"}) })
        );

        rig.peer(PeerEvent::Open);
        assert_eq!(rig.state(), SessionState::Connected);
        assert_eq!(
            rig.frames(),
            vec![
                PeerMessage::Nick { nick: "me".into() },
                PeerMessage::TargetSize { value: 1.5 },
                PeerMessage::GameDuration { value: 30.0 },
            ]
        );

        rig.intent(SessionIntent::Start);
        assert_eq!(rig.state(), SessionState::Connected);
        assert_eq!(rig.controller.view().countdown, Some(3));
        assert_eq!(rig.frames().last(), Some(&PeerMessage::Start));
        assert_eq!(rig.sent_events().last(), Some(&ClientEvent::Start { code: code() }));

        let t0 = Instant::now();
        rig.tick(TickKind::Countdown, t0);
        assert_eq!(rig.controller.view().countdown, Some(2));
        rig.tick(TickKind::Countdown, t0);
        assert_eq!(rig.controller.view().countdown, Some(1));
        rig.tick(TickKind::Countdown, t0);
        assert_eq!(rig.state(), SessionState::Playing);
        assert_eq!(rig.controller.view().countdown, None);
        assert_eq!(rig.controller.view().time_left, Some(30.0));
        assert_eq!(rig.cues(), vec![Cue::ResetView, Cue::RoundStarted]);
    }

    #[tokio::test]
    async fn test_client_sequence_with_buffered_signal() {
        let mut rig = Rig::new();
        rig.intent(SessionIntent::Join(code()));
        assert_eq!(rig.state(), SessionState::Connecting);
        rig.relay(SignalingEvent::Connected);
        assert_eq!(rig.sent_events(), vec![ClientEvent::Join { code: code() }]);

        // Offer overtakes the join acknowledgement.
        rig.server(ServerEvent::Signal { signal: json!({"type": "offer", "n": 1}) });
        assert!(rig.channel.lock().unwrap().applied.is_empty());

        let ack = rig.last_ack();
        rig.server(ServerEvent::Ack { id: ack, reply: AckReply::with_code(code()) });
        assert_eq!(rig.state(), SessionState::Negotiating);
        assert_eq!(rig.channel.lock().unwrap().applied, vec![json!({"type": "offer", "n": 1})]);

        rig.server(ServerEvent::Joined { code: code() });
        assert_eq!(rig.state(), SessionState::Negotiating);
        assert_eq!(rig.channel.lock().unwrap().applied.len(), 1);

        rig.peer(PeerEvent::Open);
        assert_eq!(rig.state(), SessionState::Connected);
        assert_eq!(rig.frames(), vec![PeerMessage::Nick { nick: "me".into() }]);

        rig.frame(PeerMessage::Nick { nick: "host".into() });
        rig.frame(PeerMessage::GameDuration { value: 45.0 });
        assert_eq!(rig.controller.view().game_duration, 45.0);
        assert_eq!(rig.controller.view().roster.remote.as_ref().unwrap().nick, "host");

        rig.frame(PeerMessage::Start);
        assert_eq!(rig.controller.view().countdown, Some(3));
        // Relay start arriving second does not restart the countdown.
        rig.tick(TickKind::Countdown, Instant::now());
        rig.server(ServerEvent::Start);
        assert_eq!(rig.controller.view().countdown, Some(2));

        rig.tick(TickKind::Countdown, Instant::now());
        rig.tick(TickKind::Countdown, Instant::now());
        assert_eq!(rig.state(), SessionState::Playing);
        assert_eq!(rig.controller.view().time_left, Some(45.0));
    }

    #[tokio::test]
    async fn test_join_refused_rolls_back() {
        let mut rig = Rig::new();
        rig.intent(SessionIntent::Join(code()));
        rig.relay(SignalingEvent::Connected);
        let ack = rig.last_ack();

        rig.server(ServerEvent::Error { message: "Lobby full".into() });
        assert_eq!(rig.state(), SessionState::Idle);
        assert_eq!(rig.controller.view().error, Some(SessionError::Full));
        assert_eq!(rig.wire.lock().unwrap().closes, 1);

        // The matching ack arrives after the rollback and changes nothing.
        rig.server(ServerEvent::Ack { id: ack, reply: AckReply::failed("Lobby full") });
        assert_eq!(rig.controller.view().error, Some(SessionError::Full));

        rig.intent(SessionIntent::Join(code()));
        rig.relay(SignalingEvent::Connected);
        let ack = rig.last_ack();
        rig.server(ServerEvent::Ack { id: ack, reply: AckReply::failed("Lobby not found") });
        assert_eq!(rig.state(), SessionState::Idle);
        assert_eq!(rig.controller.view().error, Some(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_disconnect_outside_keep_alive_is_an_error() {
        let mut rig = Rig::connected_host();
        rig.relay(SignalingEvent::Disconnected("reset".into()));

        assert_eq!(rig.state(), SessionState::Idle);
        assert_eq!(rig.controller.view().error, Some(SessionError::Transport("reset".into())));
        assert_eq!(rig.channel.lock().unwrap().closes, 1);

        // A disconnect after teardown is a no-op.
        rig.relay(SignalingEvent::Disconnected("again".into()));
        assert_eq!(rig.controller.view().error, Some(SessionError::Transport("reset".into())));
    }

    #[tokio::test]
    async fn test_keep_alive_suppresses_disconnect_and_peer_left() {
        let mut rig = Rig::playing_host(Instant::now());
        assert_eq!(rig.state(), SessionState::Playing);

        rig.server(ServerEvent::PeerLeft);
        rig.relay(SignalingEvent::Disconnected("hand-off".into()));
        assert_eq!(rig.state(), SessionState::Playing);
        assert_eq!(rig.controller.view().error, None);

        rig.intent(SessionIntent::Hit);
        assert_eq!(rig.controller.view().roster.local.score, 1);
    }

    #[tokio::test]
    async fn test_client_ignores_lobby_close_after_start() {
        let mut rig = Rig::starting_client();
        assert_eq!(rig.state(), SessionState::Connected);
        assert_eq!(rig.controller.view().countdown, Some(3));

        rig.server(ServerEvent::Closed);
        rig.relay(SignalingEvent::Disconnected("host moved on".into()));
        assert_eq!(rig.state(), SessionState::Connected);
        assert_eq!(rig.controller.view().countdown, Some(3));
        assert_eq!(rig.controller.view().error, None);
        assert_eq!(rig.channel.lock().unwrap().closes, 0);

        for _ in 0..3 {
            rig.tick(TickKind::Countdown, Instant::now());
        }
        assert_eq!(rig.state(), SessionState::Playing);
        rig.frame(PeerMessage::ScoreDelta { delta: 1 });
        assert_eq!(rig.controller.view().roster.remote.as_ref().unwrap().score, 1);
    }

    #[tokio::test]
    async fn test_score_deltas_saturate() {
        let mut rig = Rig::playing_host(Instant::now());
        rig.frame(PeerMessage::ScoreDelta { delta: i32::MAX });
        rig.frame(PeerMessage::ScoreDelta { delta: 1 });
        assert_eq!(rig.controller.view().roster.remote.as_ref().unwrap().score, i32::MAX);

        rig.frame(PeerMessage::ScoreDelta { delta: i32::MIN });
        rig.frame(PeerMessage::ScoreDelta { delta: i32::MIN });
        assert_eq!(rig.controller.view().roster.remote.as_ref().unwrap().score, i32::MIN);

        rig.intent(SessionIntent::Hit);
        assert_eq!(rig.controller.view().roster.local.score, 1);
        assert_eq!(rig.state(), SessionState::Playing);
    }

    #[tokio::test]
    async fn test_end_twice_finalizes_once() {
        let mut rig = Rig::playing_host(Instant::now());
        rig.frame(PeerMessage::ScoreDelta { delta: 1 });
        rig.intent(SessionIntent::Hit);
        rig.intent(SessionIntent::Hit);
        rig.cues();

        rig.intent(SessionIntent::Stop);
        rig.frame(PeerMessage::End);
        rig.intent(SessionIntent::Stop);

        assert_eq!(rig.state(), SessionState::Ended);
        let ends = rig.frames().iter().filter(|m| **m == PeerMessage::End).count();
        assert_eq!(ends, 1);
        assert_eq!(rig.cues(), vec![Cue::RoundStopped]);

        let results = rig.controller.view().results.clone().unwrap();
        assert_eq!(results.scores, vec![("me".to_string(), 2), (REMOTE_PLACEHOLDER.to_string(), 1)]);
        assert_eq!(results.outcome, Outcome::Winner("me".into()));
    }

    #[tokio::test]
    async fn test_clock_expiry_and_stale_ticks() {
        let t0 = Instant::now();
        let mut rig = Rig::playing_host(t0);

        // Tick from an earlier timer epoch.
        let stale = rig.controller.timer_epoch() - 1;
        rig.controller.handle(SessionInput::Tick {
            epoch: stale,
            kind: TickKind::Clock,
            at: t0 + Duration::from_secs(60),
        });
        assert_eq!(rig.state(), SessionState::Playing);

        rig.tick(TickKind::Clock, t0 + Duration::from_secs(10));
        assert_eq!(rig.controller.view().time_left, Some(20.0));

        rig.tick(TickKind::Clock, t0 + Duration::from_secs(31));
        assert_eq!(rig.state(), SessionState::Ended);
        assert_eq!(rig.controller.view().time_left, Some(0.0));
        assert_eq!(rig.frames().last(), Some(&PeerMessage::End));
        assert_eq!(rig.controller.view().results.as_ref().unwrap().outcome, Outcome::Tie);
    }

    #[tokio::test]
    async fn test_dismiss_tears_down() {
        let mut rig = Rig::playing_host(Instant::now());
        rig.intent(SessionIntent::Stop);
        rig.intent(SessionIntent::Dismiss);

        assert_eq!(rig.state(), SessionState::Idle);
        assert_eq!(rig.sent_events().last(), Some(&ClientEvent::Leave { code: code() }));
        assert_eq!(rig.wire.lock().unwrap().closes, 1);
        assert_eq!(rig.channel.lock().unwrap().closes, 1);
        assert_eq!(rig.controller.link_id(), None);
        assert_eq!(rig.controller.view().roster.local.nick, "me");
        assert!(rig.controller.view().results.is_none());
    }

    #[tokio::test]
    async fn test_leave_before_connect_drops_queue() {
        let mut rig = Rig::new();
        rig.intent(SessionIntent::Create);
        rig.intent(SessionIntent::Leave);
        assert_eq!(rig.state(), SessionState::Idle);

        // Connected from the abandoned connection is stale.
        rig.controller.handle(SessionInput::Signaling {
            generation: rig.controller.generation - 1,
            event: SignalingEvent::Connected,
        });
        assert!(rig.sent_events().is_empty());
    }

    #[tokio::test]
    async fn test_peer_left_reopens_lobby_and_ignores_stale_link() {
        let mut rig = Rig::connected_host();
        let old_link = rig.controller.link_id().unwrap();

        rig.server(ServerEvent::PeerLeft);
        assert_eq!(rig.state(), SessionState::InLobby);
        assert!(rig.controller.view().roster.remote.is_none());

        rig.controller.handle(SessionInput::Peer { link: old_link, event: PeerEvent::Open });
        assert_eq!(rig.state(), SessionState::InLobby);

        rig.server(ServerEvent::PeerJoined);
        assert_eq!(rig.state(), SessionState::Negotiating);
        assert_ne!(rig.controller.link_id(), Some(old_link));
    }

    #[tokio::test]
    async fn test_settings_are_host_owned() {
        let mut host = Rig::connected_host();
        host.intent(SessionIntent::SetGameDuration(45.0));
        assert_eq!(host.frames().last(), Some(&PeerMessage::GameDuration { value: 45.0 }));
        host.frame(PeerMessage::TargetSize { value: 9.0 });
        assert_eq!(host.controller.view().target_size, 1.5);

        host.intent(SessionIntent::SetTargetSize(-1.0));
        assert_eq!(host.controller.view().error, Some(SessionError::InvalidSetting(-1.0)));

        let mut client = Rig::new();
        client.intent(SessionIntent::Join(code()));
        client.intent(SessionIntent::SetGameDuration(10.0));
        assert_eq!(client.controller.view().error, Some(SessionError::NotHost));
        client.intent(SessionIntent::Start);
        assert_eq!(client.controller.view().error, Some(SessionError::NotHost));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let mut rig = Rig::playing_host(Instant::now());
        rig.peer(PeerEvent::Frame("{garbage".into()));
        rig.peer(PeerEvent::Frame(r#"{"type":"emote"}"#.into()));
        rig.frame(PeerMessage::ScoreDelta { delta: -1 });

        assert_eq!(rig.state(), SessionState::Playing);
        assert_eq!(rig.controller.view().roster.remote.as_ref().unwrap().score, -1);
    }

    #[tokio::test]
    async fn test_benign_peer_errors_not_surfaced() {
        let mut rig = Rig::connected_host();
        rig.peer(PeerEvent::Error("User-Initiated Abort, reason=Close called".into()));
        assert_eq!(rig.controller.view().error, None);

        rig.peer(PeerEvent::Error("ICE failed".into()));
        assert_eq!(rig.controller.view().error, Some(SessionError::Negotiation("ICE failed".into())));
        assert_eq!(rig.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_client_sees_lobby_closed() {
        let mut rig = Rig::new();
        rig.intent(SessionIntent::Join(code()));
        rig.relay(SignalingEvent::Connected);
        let ack = rig.last_ack();
        rig.server(ServerEvent::Ack { id: ack, reply: AckReply::with_code(code()) });

        rig.server(ServerEvent::Closed);
        assert_eq!(rig.state(), SessionState::Idle);
        assert!(matches!(rig.controller.view().error, Some(SessionError::Transport(_))));
    }

    #[tokio::test]
    async fn test_view_is_published() {
        let mut rig = Rig::new();
        rig.intent(SessionIntent::SetNick("ana".into()));
        assert_eq!(rig.handle.view().roster.local.nick, "ana");
        assert!(rig.handle.send(SessionIntent::Create));
        assert_eq!(rig.controller.drain_ready(), 1);
        assert_eq!(rig.handle.view().state, SessionState::Connecting);
        assert_eq!(rig.wire.lock().unwrap().connects, 1);
    }
}
