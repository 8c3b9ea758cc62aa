//! The session manager: the public facade above the connection manager.
//!
//! Performs the registration handshake, maintains the known-peer table,
//! translates broker control frames into [`Event`]s, maintains the peer
//! subscription set, and routes outgoing application messages.

use std::sync::Arc;

use crate::codec::DecodedFrame;
use crate::config::ClientConfig;
use crate::connection::{ConnEvent, ConnectionManager};
use crate::discovery;
use crate::endpoint::Endpoint;
use crate::env::{self, EnvReader, ProcessEnv};
use crate::event::{Event, EventSink};
use crate::message::Message;
use crate::peer::{ClientId, PeerRecord, PeerTable, BROKER_ID, UNASSIGNED_ID};
use crate::spawner::{ProcessSpawner, Spawner};

const PROTOCOL_VERSION: &str = "1";
const DEFAULT_SERVER_COMMAND: &str = "coserver4";

/// State the session keeps about itself and its known peers.
struct SessionState {
    my_id: ClientId,
    client_type: String,
    name: String,
    user_id: String,
    peers: PeerTable,
    selected_peer_names: Vec<String>,
    connected: bool,
}

/// Owns a [`ConnectionManager`] and layers registration, peer tracking,
/// and message routing on top of it.
pub struct Session {
    connection: ConnectionManager,
    state: SessionState,
    on_event: EventSink,
}

impl Session {
    /// Builds a session for a given `client_type`, initially named the
    /// same as its type (see [`Session::set_name`] to change it).
    #[must_use]
    pub fn new(
        client_type: impl Into<String>,
        user_id: impl Into<String>,
        candidates: Vec<Endpoint>,
        server_command: String,
        attempt_to_start_server: bool,
        spawner: Arc<dyn Spawner>,
        local_hostname: String,
        on_event: EventSink,
    ) -> Self {
        let client_type = client_type.into();
        let connection = ConnectionManager::new(
            candidates,
            server_command,
            attempt_to_start_server,
            spawner,
            local_hostname,
        );

        Self {
            connection,
            state: SessionState {
                my_id: UNASSIGNED_ID,
                name: client_type.clone(),
                client_type,
                user_id: user_id.into(),
                peers: PeerTable::new(),
                selected_peer_names: Vec::new(),
                connected: false,
            },
            on_event,
        }
    }

    /// Builds a session using the process environment and `client.ini`
    /// files to discover candidate endpoints, the server command, the
    /// auto-start policy, and the user id, the way a real client embeds
    /// this crate. `explicit_urls` is an already-known candidate list
    /// (e.g. restored from a prior [`Session::set_server_urls`] call);
    /// pass an empty vector when there is none.
    #[must_use]
    pub fn discover(
        client_type: impl Into<String>,
        explicit_urls: Vec<String>,
        on_event: EventSink,
    ) -> Self {
        let env = ProcessEnv;
        let config = ClientConfig::load(
            crate::config::user_config_path().as_deref(),
            crate::config::system_config_path().as_deref(),
        );

        let default_port = crate::config::legacy_port_file().unwrap_or(crate::endpoint::DEFAULT_PORT);
        let raw_candidates = discovery::discover_raw(&explicit_urls, &env, &config, default_port);
        let candidates = discovery::parse_candidates(&raw_candidates);

        let server_command = config.server_command.clone().unwrap_or_else(|| DEFAULT_SERVER_COMMAND.to_string());
        let attempt_to_start_server = config.attempt_to_start_server.unwrap_or(true);
        let user_id = Self::resolve_user_id(&env, &config);
        let local_hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        Self::new(
            client_type,
            user_id,
            candidates,
            server_command,
            attempt_to_start_server,
            Arc::new(ProcessSpawner),
            local_hostname,
            on_event,
        )
    }

    fn resolve_user_id(env: &dyn EnvReader, config: &ClientConfig) -> String {
        if let Some(user) = env::user(env) {
            return user;
        }
        if let Some(user_id) = &config.user_id {
            return user_id.clone();
        }
        env::os_identity(env)
    }

    /// Starts (or restarts) the connect walk over the candidate list.
    pub fn connect(&mut self) {
        self.connection.connect();
    }

    /// Closes the transport immediately. The resulting cleanup (peer
    /// table clear, `Disconnected` event) happens on the next [`Session::pump`]
    /// once the connection manager reports the close.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Drains and processes every event the connection manager has
    /// queued since the last call, dispatching [`Event`]s to the
    /// registered sink as session state is updated.
    pub fn pump(&mut self) {
        for evt in self.connection.poll() {
            match evt {
                ConnEvent::Connected(endpoint) => self.on_connected(&endpoint),
                ConnEvent::Closed { .. } => self.on_closed(),
                ConnEvent::UnableToConnect => self.emit(Event::UnableToConnect),
                ConnEvent::Frame(frame) => self.on_frame(frame),
            }
        }
    }

    fn on_connected(&mut self, endpoint: &Endpoint) {
        self.state.connected = true;
        self.state.my_id = UNASSIGNED_ID;
        self.emit(Event::Connected(endpoint.to_string()));

        let mut handshake = Message::new("SETTYPE");
        handshake.add_common("type", self.state.client_type.clone());
        handshake.add_common("userId", self.state.user_id.clone());
        handshake.add_common("name", self.state.name.clone());
        handshake.add_common("protocolVersion", PROTOCOL_VERSION);
        self.connection.send(Vec::new(), handshake);
    }

    fn on_closed(&mut self) {
        let ids: Vec<ClientId> = self.state.peers.keys().copied().collect();
        for id in ids {
            self.emit(Event::ClientGone(id));
            self.emit(Event::ClientUnregistered(id));
        }
        self.state.peers.clear();
        self.state.my_id = UNASSIGNED_ID;
        self.state.connected = false;
        self.emit(Event::Disconnected);
    }

    fn on_frame(&mut self, frame: DecodedFrame) {
        let DecodedFrame::ServerToClient { from, message } = frame else {
            log::warn!("[session] received a client-to-server shaped frame, ignoring");
            return;
        };

        if from == BROKER_ID {
            self.handle_control(&message);
        } else {
            let legacy = message.to_flat();
            self.emit(Event::ReceivedMessage { from, message, legacy });
        }
    }

    fn handle_control(&mut self, message: &Message) {
        match message.command() {
            "registeredclient" => self.handle_registered_client(message),
            "newclient" => self.handle_new_client(message),
            "renameclient" => self.handle_rename_client(message),
            "removeclient" => self.handle_remove_client(message),
            "unregisteredclient" => self.handle_unregistered_client(message),
            other => log::warn!("[session] unknown control command {other:?}"),
        }
    }

    fn handle_registered_client(&mut self, message: &Message) {
        let id_field = message.common_value("id");
        if !id_field.is_empty() {
            if let Ok(id) = id_field.parse::<ClientId>() {
                if id != self.state.my_id {
                    self.state.my_id = id;
                    self.emit(Event::ReceivedId(id));
                }
            } else {
                log::warn!("[session] registeredclient carried a non-numeric id {id_field:?}");
            }
        }

        let id_col = message.find_data_desc("id");
        let type_col = message.find_data_desc("type");
        let name_col = message.find_data_desc("name");

        if let (Some(id_col), Some(type_col), Some(name_col)) = (id_col, type_col, name_col) {
            let mut registered = Vec::new();
            for row in message.data_rows() {
                let (Some(raw_id), Some(client_type), Some(name)) =
                    (row.get(id_col), row.get(type_col), row.get(name_col))
                else {
                    continue;
                };
                let Ok(id) = raw_id.parse::<ClientId>() else {
                    log::warn!("[session] registeredclient row had a non-numeric id {raw_id:?}");
                    continue;
                };
                self.state
                    .peers
                    .entry(id)
                    .or_insert_with(|| PeerRecord::new(client_type.clone(), name.clone()));
                registered.push(id);
            }
            self.send_set_peers();
            for id in registered {
                self.emit(Event::ClientRegistered(id));
            }
        } else {
            self.send_set_peers();
        }

        self.emit(Event::AddressListChanged);
    }

    fn handle_new_client(&mut self, message: &Message) {
        let Some(id) = self.parsed_id(message) else { return };
        let found = if let Some(peer) = self.state.peers.get_mut(&id) {
            peer.connected = true;
            true
        } else {
            false
        };
        if found {
            self.emit(Event::ClientNew(id));
        } else {
            log::warn!("[session] newclient for unknown id {id}");
        }
    }

    fn handle_remove_client(&mut self, message: &Message) {
        let Some(id) = self.parsed_id(message) else { return };
        let found = if let Some(peer) = self.state.peers.get_mut(&id) {
            peer.connected = false;
            true
        } else {
            false
        };
        if found {
            self.emit(Event::ClientGone(id));
        } else {
            log::warn!("[session] removeclient for unknown id {id}");
        }
    }

    fn handle_rename_client(&mut self, message: &Message) {
        let Some(id) = self.parsed_id(message) else { return };
        let new_name = message.common_value("name");
        if new_name.is_empty() {
            log::warn!("[session] renameclient for id {id} carried no name");
            return;
        }

        let Some(peer) = self.state.peers.get_mut(&id) else {
            log::warn!("[session] renameclient for unknown id {id}");
            return;
        };

        let old_name = std::mem::replace(&mut peer.name, new_name.to_string());
        self.emit(Event::ClientRename(id));

        if let Some(slot) = self.state.selected_peer_names.iter_mut().find(|n| **n == old_name) {
            *slot = new_name.to_string();
            self.send_set_peers();
        }
    }

    fn handle_unregistered_client(&mut self, message: &Message) {
        let Some(id) = self.parsed_id(message) else { return };
        if self.state.peers.remove(&id).is_some() {
            self.emit(Event::ClientUnregistered(id));
            self.emit(Event::AddressListChanged);
            self.send_set_peers();
        } else {
            log::warn!("[session] unregisteredclient for unknown id {id}");
        }
    }

    fn parsed_id(&self, message: &Message) -> Option<ClientId> {
        let raw = message.common_value("id");
        if raw.is_empty() {
            log::warn!("[session] {:?} carried no id", message.command());
            return None;
        }
        raw.parse().ok().or_else(|| {
            log::warn!("[session] {:?} carried a non-numeric id {raw:?}", message.command());
            None
        })
    }

    fn send_set_peers(&mut self) {
        if !self.state.connected {
            return;
        }
        let mut ids: Vec<ClientId> = self
            .state
            .peers
            .iter()
            .filter(|(_, peer)| {
                self.state.selected_peer_names.is_empty() || self.state.selected_peer_names.contains(&peer.name)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        let mut message = Message::new("SETPEERS");
        message.add_data_desc("peer_ids");
        for id in ids {
            message.add_data_values(vec![id.to_string()]);
        }
        self.connection.send(Vec::new(), message);
    }

    /// Sends `message` toward `to_ids` (empty means broadcast). Returns
    /// `false` without sending when not currently connected.
    pub fn send(&self, to_ids: Vec<ClientId>, message: Message) -> bool {
        if !self.state.connected {
            return false;
        }
        self.connection.send(to_ids, message);
        true
    }

    /// Renames this client, sending `SETNAME` to the broker. A no-op if
    /// `name` is unchanged.
    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if name == self.state.name {
            return;
        }
        self.state.name = name.clone();
        let mut message = Message::new("SETNAME");
        message.add_common("name", name);
        self.connection.send(Vec::new(), message);
    }

    /// Replaces the peer-name subscription filter and resends `SETPEERS`.
    /// An empty list subscribes to every known peer.
    pub fn set_selected_peer_names(&mut self, names: Vec<String>) {
        self.state.selected_peer_names = names;
        self.send_set_peers();
    }

    pub fn set_server_urls(&self, candidates: Vec<Endpoint>) {
        self.connection.set_server_urls(candidates);
    }

    pub fn set_server_command(&self, command: String) {
        self.connection.set_server_command(command);
    }

    pub fn set_attempt_to_start_server(&self, attempt: bool) {
        self.connection.set_attempt_to_start_server(attempt);
    }

    /// Overrides the user id sent on the next handshake. Has no effect on
    /// an already-registered connection.
    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.state.user_id = user_id.into();
    }

    #[must_use]
    pub fn my_id(&self) -> ClientId {
        self.state.my_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    #[must_use]
    pub fn client_type(&self) -> &str {
        &self.state.client_type
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    // --- client-type enquiry (pure reads of the peer table) ---

    #[must_use]
    pub fn has_client_of_type(&self, client_type: &str) -> bool {
        self.state.peers.values().any(|p| p.client_type == client_type)
    }

    #[must_use]
    pub fn peer_name(&self, id: ClientId) -> Option<&str> {
        self.state.peers.get(&id).map(|p| p.name.as_str())
    }

    #[must_use]
    pub fn peer_type(&self, id: ClientId) -> Option<&str> {
        self.state.peers.get(&id).map(|p| p.client_type.as_str())
    }

    #[must_use]
    pub fn known_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.state.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn emit(&mut self, event: Event) {
        (self.on_event)(event);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("my_id", &self.state.my_id)
            .field("client_type", &self.state.client_type)
            .field("name", &self.state.name)
            .field("connected", &self.state.connected)
            .field("peers", &self.state.peers.len())
            .finish_non_exhaustive()
    }
}
