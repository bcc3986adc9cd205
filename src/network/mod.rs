//! Network Layer
//!
//! Signaling relay: lobby rendezvous and verbatim forwarding of negotiation
//! payloads between the two participants of a lobby.

pub mod protocol;
pub mod registry;
pub mod server;

pub use protocol::{
    AckId, AckReply, ClientEnvelope, ClientEvent, LobbyCode, ServerEvent,
};
pub use registry::{ConnectionId, LobbyError, LobbyRegistry, Participant, Role};
pub use server::{RelayConfig, RelayError, RelayServer};
