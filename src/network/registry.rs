//! Lobby Registry
//!
//! Maps lobby codes to lobby records and routes signaling between the two
//! participants of each lobby. The map itself sits behind one `RwLock`; each
//! record has its own `Mutex`, so events for one lobby are serialized without
//! ever blocking an unrelated lobby.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use crate::network::protocol::{LobbyCode, ServerEvent};

/// Opaque per-connection identifier.
pub type ConnectionId = u64;

/// Participant role inside a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the lobby; initiates negotiation and owns the settings.
    Host,
    /// Joined with the lobby code.
    Client,
}

/// A connection that can receive relay events.
#[derive(Debug, Clone)]
pub struct Participant {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Outbound event channel of the connection.
    pub sender: mpsc::Sender<ServerEvent>,
}

impl Participant {
    /// Create a participant handle.
    pub fn new(id: ConnectionId, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self { id, sender }
    }

    /// Push an event to this participant. Returns false if the connection is gone.
    pub async fn notify(&self, event: ServerEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }
}

/// What a connection remembers about its lobby, for leave and disconnect handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Lobby code.
    pub code: LobbyCode,
    /// Role inside that lobby.
    pub role: Role,
}

/// Outcome of a leave or disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The host left; the lobby is gone.
    LobbyClosed,
    /// The client left; the lobby is joinable again.
    ClientLeft,
    /// The connection was not part of that lobby.
    NotMember,
}

/// Registry errors, reported only to the joining caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    /// No open lobby with that code.
    #[error("Lobby not found")]
    NotFound,

    /// The lobby already has a client.
    #[error("Lobby full")]
    Full,
}

/// A single lobby.
#[derive(Debug)]
pub struct LobbyRecord {
    /// Lobby code.
    pub code: LobbyCode,
    host: Participant,
    client: Option<Participant>,
    /// Set under the record lock when the lobby is deleted.
    closed: bool,
}

impl LobbyRecord {
    fn new(code: LobbyCode, host: Participant) -> Self {
        Self {
            code,
            host,
            client: None,
            closed: false,
        }
    }

    /// Role of a connection in this lobby.
    pub fn role_of(&self, id: ConnectionId) -> Option<Role> {
        if self.host.id == id {
            Some(Role::Host)
        } else if self.client.as_ref().map(|c| c.id) == Some(id) {
            Some(Role::Client)
        } else {
            None
        }
    }

    /// The other participant, if `from` is a member and the other slot is filled.
    pub fn counterpart(&self, from: ConnectionId) -> Option<&Participant> {
        match self.role_of(from)? {
            Role::Host => self.client.as_ref(),
            Role::Client => Some(&self.host),
        }
    }

    /// Whether a client is attached.
    pub fn is_paired(&self) -> bool {
        self.client.is_some()
    }
}

/// Pick a code the `taken` predicate does not reject.
pub fn allocate_code(
    mut taken: impl FnMut(&LobbyCode) -> bool,
    mut generate: impl FnMut() -> LobbyCode,
) -> LobbyCode {
    loop {
        let code = generate();
        if !taken(&code) {
            return code;
        }
        debug!("Lobby code {} collided, drawing again", code);
    }
}

/// All open lobbies.
pub struct LobbyRegistry {
    lobbies: RwLock<BTreeMap<LobbyCode, Arc<Mutex<LobbyRecord>>>>,
}

impl LobbyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            lobbies: RwLock::new(BTreeMap::new()),
        }
    }

    async fn get(&self, code: &LobbyCode) -> Option<Arc<Mutex<LobbyRecord>>> {
        let lobbies = self.lobbies.read().await;
        lobbies.get(code).cloned()
    }

    /// Open a lobby hosted by `host`.
    pub async fn create(&self, host: Participant) -> Membership {
        self.create_with(host, LobbyCode::generate).await
    }

    /// Open a lobby using a custom code source.
    pub async fn create_with(
        &self,
        host: Participant,
        generate: impl FnMut() -> LobbyCode,
    ) -> Membership {
        let mut lobbies = self.lobbies.write().await;
        let code = allocate_code(|c| lobbies.contains_key(c), generate);
        let host_id = host.id;
        lobbies.insert(code.clone(), Arc::new(Mutex::new(LobbyRecord::new(code.clone(), host))));

        info!("Lobby {} created by connection {}", code, host_id);
        Membership { code, role: Role::Host }
    }

    /// Attach `client` to the lobby `code` and notify the host.
    pub async fn join(&self, client: Participant, code: &LobbyCode) -> Result<Membership, LobbyError> {
        let lobby = self.get(code).await.ok_or(LobbyError::NotFound)?;
        let mut record = lobby.lock().await;

        if record.closed {
            return Err(LobbyError::NotFound);
        }
        if record.client.is_some() || record.host.id == client.id {
            return Err(LobbyError::Full);
        }

        let client_id = client.id;
        record.client = Some(client);
        if !record.host.notify(ServerEvent::PeerJoined).await {
            debug!("Host of lobby {} unreachable for peer-joined", code);
        }

        info!("Connection {} joined lobby {}", client_id, code);
        Ok(Membership { code: code.clone(), role: Role::Client })
    }

    /// Forward a negotiation payload to the counterpart of `from`.
    /// Returns whether it was delivered.
    pub async fn signal(&self, from: ConnectionId, code: &LobbyCode, signal: serde_json::Value) -> bool {
        self.forward(from, code, ServerEvent::Signal { signal }).await
    }

    /// Forward a start notification to the counterpart of `from`.
    pub async fn start(&self, from: ConnectionId, code: &LobbyCode) -> bool {
        self.forward(from, code, ServerEvent::Start).await
    }

    async fn forward(&self, from: ConnectionId, code: &LobbyCode, event: ServerEvent) -> bool {
        let Some(lobby) = self.get(code).await else {
            debug!("Dropping {} for unknown lobby {}", event_name(&event), code);
            return false;
        };
        let record = lobby.lock().await;
        if record.closed {
            return false;
        }

        match record.counterpart(from) {
            Some(target) => {
                debug!("Relaying {} in lobby {}: {} -> {}", event_name(&event), code, from, target.id);
                target.notify(event).await
            }
            None => {
                debug!("Dropping {} in lobby {}: no counterpart for {}", event_name(&event), code, from);
                false
            }
        }
    }

    /// Remove `from` from lobby `code`.
    pub async fn leave(&self, from: ConnectionId, code: &LobbyCode) -> Departure {
        let Some(lobby) = self.get(code).await else {
            return Departure::NotMember;
        };
        let mut record = lobby.lock().await;
        if record.closed {
            return Departure::NotMember;
        }

        match record.role_of(from) {
            Some(Role::Host) => {
                record.closed = true;
                if let Some(client) = record.client.take() {
                    client.notify(ServerEvent::Closed).await;
                }
                drop(record);

                let mut lobbies = self.lobbies.write().await;
                if lobbies.get(code).is_some_and(|l| Arc::ptr_eq(l, &lobby)) {
                    lobbies.remove(code);
                }
                info!("Lobby {} closed by host {}", code, from);
                Departure::LobbyClosed
            }
            Some(Role::Client) => {
                record.client = None;
                record.host.notify(ServerEvent::PeerLeft).await;
                info!("Connection {} left lobby {}", from, code);
                Departure::ClientLeft
            }
            None => {
                debug!("Ignoring leave of lobby {} from non-member {}", code, from);
                Departure::NotMember
            }
        }
    }

    /// Handle a transport disconnect using the connection's remembered membership.
    pub async fn disconnect(&self, from: ConnectionId, membership: Option<&Membership>) -> Departure {
        match membership {
            Some(m) => self.leave(from, &m.code).await,
            None => Departure::NotMember,
        }
    }

    /// Number of open lobbies.
    pub async fn lobby_count(&self) -> usize {
        self.lobbies.read().await.len()
    }

    /// Whether a lobby is open.
    pub async fn is_open(&self, code: &LobbyCode) -> bool {
        self.get(code).await.is_some()
    }

    /// Whether a lobby is open and has a client.
    pub async fn is_paired(&self, code: &LobbyCode) -> bool {
        match self.get(code).await {
            Some(lobby) => lobby.lock().await.is_paired(),
            None => false,
        }
    }

    /// Host and client connection ids of a lobby.
    pub async fn members(&self, code: &LobbyCode) -> Option<(ConnectionId, Option<ConnectionId>)> {
        let lobby = self.get(code).await?;
        let record = lobby.lock().await;
        Some((record.host.id, record.client.as_ref().map(|c| c.id)))
    }
}

impl Default for LobbyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn event_name(event: &ServerEvent) -> &'static str {
    match event {
        ServerEvent::Signal { .. } => "signal",
        ServerEvent::Start => "start",
        _ => "event",
    }
}
