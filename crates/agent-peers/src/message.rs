//! The Peers protocol's binary message envelope: a 2-byte `{class, type}`
//! header, optionally followed by a varint length and that many bytes of
//! payload for message types `>= 128` (the stick-table update family).

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::PeersError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Control = 0,
    Error = 1,
    StickTableUpdates = 10,
    Reserved = 255,
}

impl MessageClass {
    pub fn from_u8(v: u8) -> Result<Self, UnknownMessageClass> {
        match v {
            0 => Ok(MessageClass::Control),
            1 => Ok(MessageClass::Error),
            10 => Ok(MessageClass::StickTableUpdates),
            255 => Ok(MessageClass::Reserved),
            other => Err(UnknownMessageClass(other)),
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageClass::Control => "control",
            MessageClass::Error => "error",
            MessageClass::StickTableUpdates => "stick-table updates",
            MessageClass::Reserved => "reserved",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessageClass(pub u8);

impl fmt::Display for UnknownMessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message class: {}", self.0)
    }
}

impl std::error::Error for UnknownMessageClass {}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessageType {
    SyncRequest = 0,
    SyncFinished = 1,
    SyncPartial = 2,
    SyncConfirmed = 3,
    Heartbeat = 4,
}

impl ControlMessageType {
    pub fn from_u8(v: u8) -> Result<Self, UnknownControlMessageType> {
        match v {
            0 => Ok(ControlMessageType::SyncRequest),
            1 => Ok(ControlMessageType::SyncFinished),
            2 => Ok(ControlMessageType::SyncPartial),
            3 => Ok(ControlMessageType::SyncConfirmed),
            4 => Ok(ControlMessageType::Heartbeat),
            other => Err(UnknownControlMessageType(other)),
        }
    }
}

impl fmt::Display for ControlMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlMessageType::SyncRequest => "sync request",
            ControlMessageType::SyncFinished => "sync finished",
            ControlMessageType::SyncPartial => "sync partial",
            ControlMessageType::SyncConfirmed => "sync confirmed",
            ControlMessageType::Heartbeat => "heartbeat",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownControlMessageType(pub u8);

impl fmt::Display for UnknownControlMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown control message type: {}", self.0)
    }
}

impl std::error::Error for UnknownControlMessageType {}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMessageType {
    Protocol = 0,
    SizeLimit = 1,
}

impl ErrorMessageType {
    pub fn from_u8(v: u8) -> Result<Self, UnknownErrorMessageType> {
        match v {
            0 => Ok(ErrorMessageType::Protocol),
            1 => Ok(ErrorMessageType::SizeLimit),
            other => Err(UnknownErrorMessageType(other)),
        }
    }
}

impl fmt::Display for ErrorMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorMessageType::Protocol => "protocol error",
            ErrorMessageType::SizeLimit => "size limit error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownErrorMessageType(pub u8);

impl fmt::Display for UnknownErrorMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error message type: {}", self.0)
    }
}

impl std::error::Error for UnknownErrorMessageType {}

/// Message types `>= 0x80` under [`MessageClass::StickTableUpdates`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickTableUpdateMessageType {
    EntryUpdate = 0x80,
    IncrementalEntryUpdate = 0x81,
    StickTableDefinition = 0x82,
    StickTableSwitch = 0x83,
    UpdateAcknowledge = 0x84,
    UpdateTimed = 0x85,
    IncrementalEntryUpdateTimed = 0x86,
}

impl StickTableUpdateMessageType {
    pub fn from_u8(v: u8) -> Result<Self, UnknownStickTableUpdateMessageType> {
        match v {
            0x80 => Ok(StickTableUpdateMessageType::EntryUpdate),
            0x81 => Ok(StickTableUpdateMessageType::IncrementalEntryUpdate),
            0x82 => Ok(StickTableUpdateMessageType::StickTableDefinition),
            0x83 => Ok(StickTableUpdateMessageType::StickTableSwitch),
            0x84 => Ok(StickTableUpdateMessageType::UpdateAcknowledge),
            0x85 => Ok(StickTableUpdateMessageType::UpdateTimed),
            0x86 => Ok(StickTableUpdateMessageType::IncrementalEntryUpdateTimed),
            other => Err(UnknownStickTableUpdateMessageType(other)),
        }
    }

    /// Whether this message type carries its own explicit local update ID,
    /// rather than having the receiver derive `previous + 1`.
    pub fn with_local_update_id(self) -> bool {
        matches!(
            self,
            StickTableUpdateMessageType::EntryUpdate | StickTableUpdateMessageType::UpdateTimed
        )
    }

    pub fn with_expiry(self) -> bool {
        matches!(
            self,
            StickTableUpdateMessageType::UpdateTimed
                | StickTableUpdateMessageType::IncrementalEntryUpdateTimed
        )
    }
}

impl fmt::Display for StickTableUpdateMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StickTableUpdateMessageType::EntryUpdate => "entry update",
            StickTableUpdateMessageType::IncrementalEntryUpdate => "incremental entry update",
            StickTableUpdateMessageType::StickTableDefinition => "stick-table definition",
            StickTableUpdateMessageType::StickTableSwitch => "stick-table switch",
            StickTableUpdateMessageType::UpdateAcknowledge => "update acknowledge",
            StickTableUpdateMessageType::UpdateTimed => "update timed",
            StickTableUpdateMessageType::IncrementalEntryUpdateTimed => {
                "incremental entry update timed"
            }
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownStickTableUpdateMessageType(pub u8);

impl fmt::Display for UnknownStickTableUpdateMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown stick-table update message type: {}", self.0)
    }
}

impl std::error::Error for UnknownStickTableUpdateMessageType {}

/// A message as it comes off the wire: a 2-byte header and, for `type >=
/// 128`, a varint-length-prefixed payload.
#[derive(Debug, Default)]
pub struct RawMessage {
    pub class: u8,
    pub message_type: u8,
    pub data: Vec<u8>,
}

impl RawMessage {
    pub async fn read_from<R>(&mut self, r: &mut R) -> Result<(), PeersError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 2];
        r.read_exact(&mut header).await?;
        self.class = header[0];
        self.message_type = header[1];
        self.data.clear();

        if self.message_type >= 128 {
            let len = read_varint_async(r).await?;
            self.data.resize(len as usize, 0);
            r.read_exact(&mut self.data).await?;
        }

        Ok(())
    }
}

/// Reads a varint one byte at a time off an async stream, using the same
/// continuation rule as [`agent_wire::decode_varint`] (first byte `< 240` is
/// the whole value; otherwise subsequent bytes carry 7 bits each with the
/// high bit as a continuation flag).
async fn read_varint_async<R>(r: &mut R) -> Result<u64, PeersError>
where
    R: AsyncRead + Unpin,
{
    let first = r.read_u8().await?;
    if first < 240 {
        return Ok(first as u64);
    }

    let mut val = first as u64;
    let mut shift = 4u32;
    loop {
        let b = r.read_u8().await?;
        val += (b as u64) << shift;
        shift += 7;
        if b < 128 {
            break;
        }
    }

    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn short_message_has_no_payload() {
        let mut r = Cursor::new(vec![0x00, 0x04]);
        let mut m = RawMessage::default();
        m.read_from(&mut r).await.unwrap();
        assert_eq!(m.class, 0);
        assert_eq!(m.message_type, 4);
        assert!(m.data.is_empty());
    }

    #[tokio::test]
    async fn long_message_reads_varint_length_then_payload() {
        let mut wire = vec![10u8, 0x82, 3];
        wire.extend_from_slice(b"abc");
        let mut r = Cursor::new(wire);
        let mut m = RawMessage::default();
        m.read_from(&mut r).await.unwrap();
        assert_eq!(m.class, 10);
        assert_eq!(m.message_type, 0x82);
        assert_eq!(m.data, b"abc");
    }

    #[test]
    fn stick_table_message_types_match_the_wire_table() {
        assert_eq!(StickTableUpdateMessageType::EntryUpdate as u8, 0x80);
        assert_eq!(StickTableUpdateMessageType::IncrementalEntryUpdateTimed as u8, 0x86);
    }

    #[test]
    fn update_flags_match_dispatch_rules() {
        assert!(StickTableUpdateMessageType::EntryUpdate.with_local_update_id());
        assert!(!StickTableUpdateMessageType::EntryUpdate.with_expiry());
        assert!(StickTableUpdateMessageType::UpdateTimed.with_local_update_id());
        assert!(StickTableUpdateMessageType::UpdateTimed.with_expiry());
        assert!(!StickTableUpdateMessageType::IncrementalEntryUpdate.with_local_update_id());
        assert!(!StickTableUpdateMessageType::IncrementalEntryUpdate.with_expiry());
        assert!(StickTableUpdateMessageType::IncrementalEntryUpdateTimed.with_expiry());
    }
}
