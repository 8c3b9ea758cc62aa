//! The typed event stream the session emits upward to application code.
//!
//! The client owns no back-reference to its subscriber: delivery is a
//! non-owning notification through a callback registered at construction,
//! posted only after the session's own state has been committed so a
//! handler observing one event sees a consistent snapshot.

use crate::message::{FlatMessage, Message};
use crate::peer::ClientId;

/// One connection-, registration-, or message-level notification.
#[derive(Debug, Clone)]
pub enum Event {
    /// The transport reached the given endpoint and the handshake has not
    /// yet necessarily completed (id assignment follows as [`Event::ReceivedId`]).
    Connected(String),
    /// The transport closed, for any reason (explicit disconnect or
    /// remote close); the peer table has already been cleared.
    Disconnected,
    /// The candidate endpoint list was exhausted without connecting.
    UnableToConnect,
    /// The broker assigned this client its id.
    ReceivedId(ClientId),
    /// A peer was registered with the broker (may not yet be connected).
    ClientRegistered(ClientId),
    /// A previously-registered peer came online.
    ClientNew(ClientId),
    /// A peer's name changed.
    ClientRename(ClientId),
    /// A previously-connected peer went offline (record retained).
    ClientGone(ClientId),
    /// A peer's record was removed entirely.
    ClientUnregistered(ClientId),
    /// An application message arrived from another client, delivered both
    /// in structured form and as the legacy flat form.
    ReceivedMessage {
        from: ClientId,
        message: Message,
        legacy: FlatMessage,
    },
    /// The known-peer table changed shape (registration/unregistration),
    /// distinct from a single peer's connectedness flipping.
    AddressListChanged,
}

/// A boxed, non-owning event sink. `Send` because events are posted from
/// the session's own call stack, which may run on any thread the
/// embedding application chooses to drive it from.
pub type EventSink = Box<dyn FnMut(Event) + Send>;
