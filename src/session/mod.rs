//! Session Layer
//!
//! Peer side of a duel: the relay connection, the peer data channel, timers and
//! the state machine that ties them together. Everything that can wake the
//! controller arrives as a [`SessionInput`] on one inbox, so transitions never
//! run concurrently.

pub mod controller;
pub mod message;
pub mod peer;
pub mod rtc;
pub mod signaling;
pub mod timer;

use tokio::sync::mpsc;

pub use controller::{
    Cue, MatchResults, Outcome, PlayerSlot, Roster, SessionConfig, SessionController,
    SessionError, SessionHandle, SessionIntent, SessionState, SessionView,
};
pub use message::{PeerMessage, ProtocolError};
pub use peer::{LinkId, PeerBackend, PeerConnector, PeerEvent, PeerLink};
pub use signaling::{
    PendingEventQueue, SignalingClient, SignalingConnector, SignalingEvent, SignalingSink,
    WsConnector,
};
pub use timer::{TickKind, Ticker};

/// Something the controller must react to.
#[derive(Debug, Clone)]
pub enum SessionInput {
    /// Relay connection event, tagged with the connection generation.
    Signaling {
        /// Generation of the connection that produced it.
        generation: u64,
        /// The event.
        event: SignalingEvent,
    },
    /// Peer link event, tagged with the link that produced it.
    Peer {
        /// Owning link.
        link: LinkId,
        /// The event.
        event: PeerEvent,
    },
    /// Timer tick.
    Tick {
        /// Timer epoch; ticks from an older epoch are stale.
        epoch: u64,
        /// Which timer fired.
        kind: TickKind,
        /// When it fired.
        at: tokio::time::Instant,
    },
    /// Local intent from the collaborator.
    Intent(SessionIntent),
}

/// Sender half of a controller inbox.
pub type Inbox = mpsc::UnboundedSender<SessionInput>;
