//! SPOP's own error taxonomy (the codes carried in an AgentDisconnect
//! frame's `status-code`/`message` KV pair) plus this crate's internal
//! error type.

use std::fmt;
use std::io;

use agent_wire::kv::KvError;

use crate::frame::UnknownFrameType;

/// The `status-code` values HAProxy and its agents exchange in DISCONNECT
/// frames. Matches the SPOE specification's error code table exactly.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None = 0,
    Io = 1,
    Timeout = 2,
    TooBig = 3,
    Invalid = 4,
    NoVersion = 5,
    NoFrameSize = 6,
    NoCapabilities = 7,
    BadVersion = 8,
    BadFrameSize = 9,
    FragmentationNotSupported = 10,
    InterlacedFrames = 11,
    FrameIdNotFound = 12,
    ResourceAllocation = 13,
    Unknown = 99,
}

impl ErrorCode {
    /// Maps a wire `status-code` value to its `ErrorCode`, falling back to
    /// `Unknown` for anything the SPOE table doesn't assign (matching
    /// HAProxy's own lenient treatment of unrecognized codes).
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => ErrorCode::None,
            1 => ErrorCode::Io,
            2 => ErrorCode::Timeout,
            3 => ErrorCode::TooBig,
            4 => ErrorCode::Invalid,
            5 => ErrorCode::NoVersion,
            6 => ErrorCode::NoFrameSize,
            7 => ErrorCode::NoCapabilities,
            8 => ErrorCode::BadVersion,
            9 => ErrorCode::BadFrameSize,
            10 => ErrorCode::FragmentationNotSupported,
            11 => ErrorCode::InterlacedFrames,
            12 => ErrorCode::FrameIdNotFound,
            13 => ErrorCode::ResourceAllocation,
            _ => ErrorCode::Unknown,
        }
    }

    /// Whether this code indicates an ordinary, non-error teardown.
    pub fn is_clean_shutdown(self) -> bool {
        matches!(self, ErrorCode::None | ErrorCode::Io | ErrorCode::Timeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::None => "normal",
            ErrorCode::Io => "I/O error",
            ErrorCode::Timeout => "a timeout occurred",
            ErrorCode::TooBig => "frame is too big",
            ErrorCode::Invalid => "invalid frame received",
            ErrorCode::NoVersion => "version value not found",
            ErrorCode::NoFrameSize => "max-frame-size value not found",
            ErrorCode::NoCapabilities => "capabilities value not found",
            ErrorCode::BadVersion => "unsupported version",
            ErrorCode::BadFrameSize => "max-frame-size too big or too small",
            ErrorCode::FragmentationNotSupported => "fragmentation not supported",
            ErrorCode::InterlacedFrames => "invalid interlaced frames",
            ErrorCode::FrameIdNotFound => "frame-id not found",
            ErrorCode::ResourceAllocation => "resource allocation error",
            ErrorCode::Unknown => "an unknown error occurred",
        };
        write!(f, "{s}")
    }
}

/// Errors produced while decoding/encoding SPOP frames or running the
/// protocol state machine.
#[derive(Debug)]
pub enum SpopError {
    Io(io::Error),
    Kv(KvError),
    UnknownFrameType(UnknownFrameType),
    /// A frame was written without its `frame_type` having been set.
    MissingFrameType,
    /// HAProxy's HELLO advertised a `max-frame-size` larger than this agent
    /// is willing to accept.
    MaxFrameSizeTooLarge { requested: u32, limit: u32 },
    /// A second HAProxyHello arrived on a connection that already completed
    /// its handshake.
    DuplicateHello,
    /// An AgentDisconnect-worthy condition identified by its SPOE error code.
    Code(ErrorCode),
    /// HAProxy sent a HAProxyDisconnect frame whose status-code is outside
    /// `{None, Io, Timeout}` — a non-clean teardown the caller should log.
    Disconnected { code: ErrorCode, message: String },
}

impl fmt::Display for SpopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpopError::Io(e) => write!(f, "{e}"),
            SpopError::Kv(e) => write!(f, "{e}"),
            SpopError::UnknownFrameType(e) => write!(f, "{e}"),
            SpopError::MissingFrameType => write!(f, "frame written without a frame type"),
            SpopError::MaxFrameSizeTooLarge { requested, limit } => write!(
                f,
                "max-frame-size {requested} exceeds the maximum allowed size {limit}"
            ),
            SpopError::DuplicateHello => write!(f, "duplicate hello frame"),
            SpopError::Code(c) => write!(f, "{c}"),
            SpopError::Disconnected { code, message } => {
                write!(f, "haproxy-disconnect: {code} ({message})")
            }
        }
    }
}

impl std::error::Error for SpopError {}

impl From<io::Error> for SpopError {
    fn from(e: io::Error) -> Self {
        SpopError::Io(e)
    }
}

impl From<KvError> for SpopError {
    fn from(e: KvError) -> Self {
        SpopError::Kv(e)
    }
}

impl From<UnknownFrameType> for SpopError {
    fn from(e: UnknownFrameType) -> Self {
        SpopError::UnknownFrameType(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_display_matches_spoe_table() {
        assert_eq!(ErrorCode::TooBig.to_string(), "frame is too big");
        assert_eq!(ErrorCode::Unknown.to_string(), "an unknown error occurred");
    }

    #[test]
    fn error_code_values_match_wire_table() {
        assert_eq!(ErrorCode::None as u32, 0);
        assert_eq!(ErrorCode::ResourceAllocation as u32, 13);
        assert_eq!(ErrorCode::Unknown as u32, 99);
    }
}
