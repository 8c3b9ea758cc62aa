//! Client library for the coserver local inter-process message bus.
//!
//! A process instantiates one [`Session`], which registers with a broker
//! under a client type and name, learns about peers, subscribes to a
//! subset of them, and exchanges structured messages. The broker itself
//! is a separate process this crate does not implement.
//!
//! Module layout, leaves first: [`message`] (the in-memory message model
//! and its legacy flat form), [`codec`] (the framed binary wire format),
//! [`connection`] (transport lifecycle, candidate endpoint walk, local
//! broker auto-start), [`session`] (the public facade: registration,
//! peer table, message routing).

pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod endpoint;
pub mod env;
pub mod event;
pub mod message;
pub mod peer;
pub mod session;
pub mod spawner;
pub mod transport;

pub use codec::{Codec, DecodedFrame};
pub use config::ClientConfig;
pub use connection::ConnectionManager;
pub use endpoint::{Endpoint, Scheme, DEFAULT_PORT};
pub use event::{Event, EventSink};
pub use message::{FlatMessage, Message};
pub use peer::{ClientId, PeerRecord, PeerTable, BROKER_ID, UNASSIGNED_ID};
pub use session::Session;
pub use spawner::{ProcessSpawner, Spawner};
