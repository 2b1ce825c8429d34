//! Peers protocol agent runtime.
//!
//! [`handshake`] scans the text handshake; [`client::serve`] runs the
//! per-connection state machine (handshake, heartbeat ticker, liveness
//! timer, message dispatch) against [`sticktable`]'s definition/entry-update
//! codec; [`server`] owns the accept loop that wires a listener's
//! connections into `client::serve`.

pub mod cancel;
pub mod client;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod message;
pub mod server;
pub mod sticktable;

pub use cancel::CancelToken;
pub use client::{serve, ClientConfig};
pub use error::PeersError;
pub use handler::{Handler, HandlerFn};
pub use handshake::{Handshake, HandshakeStatus};
pub use server::{Server, ServerConfig};
pub use sticktable::{DataType, Definition, EntryUpdate, KeyType, MapData, MapKey};
