//! Client identifiers and the known-peer table.

use std::collections::HashMap;

/// A broker-assigned client identifier.
///
/// `0` designates the broker itself; `-1` designates "broadcast /
/// unassigned"; positive values designate peer clients.
pub type ClientId = i32;

/// The broker's own id.
pub const BROKER_ID: ClientId = 0;

/// Broadcast / unassigned sentinel id.
pub const UNASSIGNED_ID: ClientId = -1;

/// What the session knows about one peer client.
///
/// Created when the broker announces the peer as *registered*; `connected`
/// flips to `true` on *new* and back to `false` on *gone*; the record is
/// removed entirely on *unregistered*.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub client_type: String,
    pub name: String,
    pub connected: bool,
}

impl PeerRecord {
    #[must_use]
    pub fn new(client_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client_type: client_type.into(),
            name: name.into(),
            connected: false,
        }
    }
}

/// The known-client map: id → peer record, insertion order is not
/// significant (lookups are always by id or by name).
pub type PeerTable = HashMap<ClientId, PeerRecord>;
