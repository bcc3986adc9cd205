//! # Aimlink
//!
//! Lobby rendezvous, signaling relay and peer session core for two-player aim duels.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          AIMLINK                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/         - Relay side                               │
//! │  ├── protocol.rs  - Signaling events (wire format)           │
//! │  ├── registry.rs  - Lobby code -> lobby record               │
//! │  └── server.rs    - WebSocket relay + liveness endpoint      │
//! │                                                              │
//! │  session/         - Peer side                                │
//! │  ├── message.rs   - Data channel messages                    │
//! │  ├── signaling.rs - Relay connection + pending queue         │
//! │  ├── peer.rs      - PeerLink over a negotiation backend      │
//! │  ├── rtc.rs       - webrtc-rs backend                        │
//! │  ├── timer.rs     - Cancellable periodic ticks               │
//! │  └── controller.rs- Session state machine                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The relay never looks inside negotiation payloads. Once two peers have a
//! data channel, all gameplay traffic (nicknames, start/end handshake, score
//! deltas, settings) goes peer to peer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod session;

// Re-export commonly used types
pub use network::protocol::{ClientEvent, ServerEvent, LobbyCode};
pub use network::registry::{LobbyRegistry, LobbyError, Role};
pub use network::server::{RelayServer, RelayConfig, RelayError};
pub use session::controller::{SessionController, SessionState, SessionView, SessionError};
pub use session::message::PeerMessage;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default relay port.
pub const DEFAULT_RELAY_PORT: u16 = 3000;

/// Countdown length before a round starts (seconds).
pub const COUNTDOWN_SECONDS: u32 = 3;
