//! Typed-value wire codec shared by the SPOP and Peers HAProxy agent protocols.
//!
//! Layered bottom-up: [`varint`] underlies [`kv`] (typed key/value entries)
//! and [`message`] (the named, KV-bearing units inside a NOTIFY frame body),
//! while [`action`] writes the SET-VAR/UNSET-VAR actions an agent returns.
//! [`slice_buffer`] is the fixed backing buffer both `agent-spop`'s frame
//! type and this crate's own pooled scanners stage their bytes in.

pub mod action;
pub mod data_type;
pub mod kv;
pub mod message;
pub mod pool;
pub mod slice_buffer;
pub mod varint;

pub use action::{ActionWriter, VarScope};
pub use data_type::DataType;
pub use kv::{KVEntry, KVScanner, KVWriter, KvError};
pub use message::{Message, MessageScanner};
pub use slice_buffer::SliceBuffer;
pub use varint::{decode_varint, encode_varint, VarintError};
