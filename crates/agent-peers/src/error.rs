//! Error taxonomy for handshake scanning, message dispatch, and stick-table
//! decoding.

use std::fmt;
use std::io;

use agent_wire::VarintError;

use crate::message::{
    UnknownControlMessageType, UnknownErrorMessageType, UnknownMessageClass,
    UnknownStickTableUpdateMessageType,
};
use crate::sticktable::{UnknownDataType, UnknownKeyType};

#[derive(Debug)]
pub enum PeersError {
    Io(io::Error),
    Varint(VarintError),
    UnknownMessageClass(UnknownMessageClass),
    UnknownControlMessageType(UnknownControlMessageType),
    UnknownErrorMessageType(UnknownErrorMessageType),
    UnknownStickTableUpdateMessageType(UnknownStickTableUpdateMessageType),
    UnknownDataType(UnknownDataType),
    UnknownKeyType(UnknownKeyType),
    /// The peer's handshake lines could not be parsed into a [`crate::Handshake`].
    MalformedHandshake,
    /// The remote peer reported a protocol-level error (class `Error`).
    ProtocolError,
    /// The remote peer reported that a message exceeded its size limit.
    SizeLimitError,
    /// An entry-update message arrived before any stick-table definition.
    NoTableDefinition,
    /// A message body did not end exactly at the declared length.
    TrailingBytes,
}

impl fmt::Display for PeersError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeersError::Io(e) => write!(f, "{e}"),
            PeersError::Varint(e) => write!(f, "{e}"),
            PeersError::UnknownMessageClass(e) => write!(f, "{e}"),
            PeersError::UnknownControlMessageType(e) => write!(f, "{e}"),
            PeersError::UnknownErrorMessageType(e) => write!(f, "{e}"),
            PeersError::UnknownStickTableUpdateMessageType(e) => write!(f, "{e}"),
            PeersError::UnknownDataType(e) => write!(f, "{e}"),
            PeersError::UnknownKeyType(e) => write!(f, "{e}"),
            PeersError::MalformedHandshake => write!(f, "malformed peer handshake"),
            PeersError::ProtocolError => write!(f, "peer reported a protocol error"),
            PeersError::SizeLimitError => write!(f, "peer reported a message size limit error"),
            PeersError::NoTableDefinition => {
                write!(f, "entry update received before a stick-table definition")
            }
            PeersError::TrailingBytes => write!(f, "message body left unconsumed trailing bytes"),
        }
    }
}

impl std::error::Error for PeersError {}

impl From<io::Error> for PeersError {
    fn from(e: io::Error) -> Self {
        PeersError::Io(e)
    }
}

impl From<VarintError> for PeersError {
    fn from(e: VarintError) -> Self {
        PeersError::Varint(e)
    }
}

impl From<UnknownMessageClass> for PeersError {
    fn from(e: UnknownMessageClass) -> Self {
        PeersError::UnknownMessageClass(e)
    }
}

impl From<UnknownControlMessageType> for PeersError {
    fn from(e: UnknownControlMessageType) -> Self {
        PeersError::UnknownControlMessageType(e)
    }
}

impl From<UnknownStickTableUpdateMessageType> for PeersError {
    fn from(e: UnknownStickTableUpdateMessageType) -> Self {
        PeersError::UnknownStickTableUpdateMessageType(e)
    }
}

impl From<UnknownErrorMessageType> for PeersError {
    fn from(e: UnknownErrorMessageType) -> Self {
        PeersError::UnknownErrorMessageType(e)
    }
}

impl From<UnknownDataType> for PeersError {
    fn from(e: UnknownDataType) -> Self {
        PeersError::UnknownDataType(e)
    }
}

impl From<UnknownKeyType> for PeersError {
    fn from(e: UnknownKeyType) -> Self {
        PeersError::UnknownKeyType(e)
    }
}
