//! SPOP (Stream Processing Offload Protocol) agent runtime.
//!
//! [`frame`] frames the wire; [`client::serve`] runs the per-connection
//! state machine (HELLO negotiation, NOTIFY dispatch, DISCONNECT) on top of
//! [`scheduler`]'s bounded worker pool; [`server`] owns the accept loop that
//! wires a listener's connections into `client::serve`.

pub mod cancel;
pub mod client;
pub mod error;
pub mod frame;
pub mod handler;
pub mod scheduler;
pub mod server;

pub use cancel::CancelToken;
pub use client::{serve, ClientConfig};
pub use error::{ErrorCode, SpopError};
pub use frame::{Frame, FrameType, MAX_FRAME_SIZE};
pub use handler::{Handler, HandlerFn};
pub use server::{Server, ServerConfig};
