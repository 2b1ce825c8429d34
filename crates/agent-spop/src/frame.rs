//! SPOP frame header codec and the three frame types an agent writes:
//! AgentHello, AgentDisconnect, and Ack.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by
//! a body of exactly that many bytes: 1-byte frame type, 4-byte big-endian
//! flags, a varint stream ID, a varint frame ID, and then the frame's
//! payload (HELLO/NOTIFY KV entries, or nothing for DISCONNECT).

use std::fmt;
use std::io;

use agent_wire::kv::KvError;
use agent_wire::pool::{Reset, ResetPool};
use agent_wire::{decode_varint, encode_varint, ActionWriter, KVWriter, SliceBuffer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorCode, SpopError};

/// Maximum frame size this crate will ever negotiate or accept, matching
/// HAProxy's own SPOE hard limit.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 - 1;

const LENGTH_PREFIX_LEN: usize = 4;

pub const HELLO_KEY_MAX_FRAME_SIZE: &str = "max-frame-size";
pub const HELLO_KEY_SUPPORTED_VERSIONS: &str = "supported-versions";
pub const HELLO_KEY_VERSION: &str = "version";
pub const HELLO_KEY_CAPABILITIES: &str = "capabilities";
pub const HELLO_KEY_HEALTHCHECK: &str = "healthcheck";
pub const HELLO_KEY_ENGINE_ID: &str = "engine-id";

pub const CAPABILITY_ASYNC: &str = "async";
pub const CAPABILITY_PIPELINING: &str = "pipelining";

pub const SPOP_VERSION: &str = "2.0";

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const FIN  = 0b01;
        const ABRT = 0b10;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    HaproxyHello = 1,
    HaproxyDisconnect = 2,
    Notify = 3,
    AgentHello = 101,
    AgentDisconnect = 102,
    Ack = 103,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Result<Self, UnknownFrameType> {
        match v {
            1 => Ok(FrameType::HaproxyHello),
            2 => Ok(FrameType::HaproxyDisconnect),
            3 => Ok(FrameType::Notify),
            101 => Ok(FrameType::AgentHello),
            102 => Ok(FrameType::AgentDisconnect),
            103 => Ok(FrameType::Ack),
            other => Err(UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownFrameType(pub u8);

impl fmt::Display for UnknownFrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown frame type: {}", self.0)
    }
}

impl std::error::Error for UnknownFrameType {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    pub flags: u32,
    pub stream_id: u64,
    pub frame_id: u64,
}

/// A single SPOP frame: header metadata plus a [`SliceBuffer`] holding the
/// still-to-be-parsed (or still-to-be-filled) body.
///
/// `buf` is sized to [`MAX_FRAME_SIZE`]. A connection's read loop pulls
/// frames out of a [`FramePool`] (see that type's docs) rather than calling
/// [`Frame::new`] on every iteration, so the 64KB backing buffer is reused
/// instead of reallocated once the pool has warmed up.
pub struct Frame {
    pub frame_type: Option<FrameType>,
    pub meta: FrameMetadata,
    pub buf: SliceBuffer,
    length: [u8; LENGTH_PREFIX_LEN],
}

impl Frame {
    pub fn new() -> Self {
        Self {
            frame_type: None,
            meta: FrameMetadata::default(),
            buf: SliceBuffer::new(MAX_FRAME_SIZE as usize),
            length: [0u8; LENGTH_PREFIX_LEN],
        }
    }

    pub fn reset(&mut self) {
        self.frame_type = None;
        self.meta = FrameMetadata::default();
        self.buf.reset();
    }

    /// Writes frame-type, flags, stream ID, and frame ID into `buf` at its
    /// current write cursor.
    pub fn encode_header(&mut self) -> Result<(), SpopError> {
        let frame_type = self.frame_type.ok_or(SpopError::MissingFrameType)?;
        self.buf.write_n_bytes(1)[0] = frame_type as u8;
        self.buf
            .write_n_bytes(4)
            .copy_from_slice(&self.meta.flags.to_be_bytes());

        let n = encode_varint(self.buf.write_bytes(), self.meta.stream_id)
            .map_err(KvError::from)?;
        self.buf.advance_w(n);

        let n = encode_varint(self.buf.write_bytes(), self.meta.frame_id)
            .map_err(KvError::from)?;
        self.buf.advance_w(n);

        Ok(())
    }

    /// Reads frame-type, flags, stream ID, and frame ID from `buf` at its
    /// current read cursor. The body is left for the caller to scan.
    pub fn decode_header(&mut self) -> Result<(), SpopError> {
        let frame_type = self.buf.read_n_bytes(1)[0];
        self.frame_type = Some(FrameType::from_u8(frame_type)?);

        let mut flag_bytes = [0u8; 4];
        flag_bytes.copy_from_slice(self.buf.read_n_bytes(4));
        self.meta.flags = u32::from_be_bytes(flag_bytes);

        let (stream_id, n) = decode_varint(self.buf.read_bytes()).map_err(KvError::from)?;
        self.buf.advance_r(n);
        self.meta.stream_id = stream_id;

        let (frame_id, n) = decode_varint(self.buf.read_bytes()).map_err(KvError::from)?;
        self.buf.advance_r(n);
        self.meta.frame_id = frame_id;

        Ok(())
    }

    /// Reads one full length-prefixed frame from `r` into this instance.
    pub async fn read_from<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> io::Result<()> {
        self.reset();
        r.read_exact(&mut self.length).await?;
        let frame_len = u32::from_be_bytes(self.length) as usize;

        if frame_len > self.buf.capacity() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                SpopError::Code(ErrorCode::TooBig),
            ));
        }

        let dest = self.buf.write_n_bytes(frame_len);
        r.read_exact(dest).await?;

        self.decode_header()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(())
    }

    /// Writes this frame's length prefix and body to `w`.
    pub async fn write_to<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> io::Result<()> {
        let len = self.buf.len() as u32;
        self.length = len.to_be_bytes();
        w.write_all(&self.length).await?;
        w.write_all(self.buf.read_bytes()).await?;
        Ok(())
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Reset for Frame {
    fn reset(&mut self) {
        // Delegate to the inherent method; the trait exists only so `Frame`
        // can live in a `ResetPool`, not to change reset's behavior.
        Frame::reset(self);
    }
}

/// A pool of [`Frame`]s sharing one connection's worth of 64KB backing
/// buffers. The read loop acquires a frame with `acquire_owned`, hands it to
/// the scheduler once it's been read, and whichever worker finishes
/// processing it returns it with `release_owned` — see `client.rs`.
pub type FramePool = ResetPool<Frame>;

/// Builds and writes the AgentHello reply frame.
pub struct AgentHelloFrame {
    pub version: &'static str,
    pub max_frame_size: u32,
    pub capabilities: Vec<&'static str>,
}

impl AgentHelloFrame {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let mut f = Frame::new();
        f.frame_type = Some(FrameType::AgentHello);
        f.meta.flags = FrameFlags::FIN.bits();

        f.encode_header()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut kvw = KVWriter::new(f.buf.write_bytes(), 0);
        kvw.set_string(HELLO_KEY_VERSION, self.version)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        kvw.set_u32(HELLO_KEY_MAX_FRAME_SIZE, self.max_frame_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        kvw.set_string(HELLO_KEY_CAPABILITIES, &self.capabilities.join(","))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let off = kvw.off();
        f.buf.advance_w(off);

        f.write_to(w).await
    }
}

/// Builds and writes the AgentDisconnect frame.
pub struct AgentDisconnectFrame {
    pub err_code: ErrorCode,
}

impl AgentDisconnectFrame {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let mut f = Frame::new();
        f.frame_type = Some(FrameType::AgentDisconnect);
        f.meta.flags = FrameFlags::FIN.bits();

        f.encode_header()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut kvw = KVWriter::new(f.buf.write_bytes(), 0);
        kvw.set_u32("status-code", self.err_code as u32)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        kvw.set_string("message", &self.err_code.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let off = kvw.off();
        f.buf.advance_w(off);

        f.write_to(w).await
    }
}

/// Builds and writes an Ack frame in response to a NOTIFY, filling its
/// action body via `fill`. `fill` receives an [`ActionWriter`] over the
/// frame's own backing buffer.
pub struct AckFrame {
    pub frame_id: u64,
    pub stream_id: u64,
}

impl AckFrame {
    pub async fn write_to<W, F>(&self, w: &mut W, fill: F) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        F: FnOnce(&mut ActionWriter<'_>) -> Result<(), KvError>,
    {
        let mut f = Frame::new();
        f.frame_type = Some(FrameType::Ack);
        f.meta.flags = FrameFlags::FIN.bits();
        f.meta.frame_id = self.frame_id;
        f.meta.stream_id = self.stream_id;

        f.encode_header()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut aw = ActionWriter::new(f.buf.write_bytes(), 0);
        fill(&mut aw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let off = aw.off();
        f.buf.advance_w(off);

        f.write_to(w).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut f = Frame::new();
        f.frame_type = Some(FrameType::Notify);
        f.meta.flags = FrameFlags::FIN.bits();
        f.meta.stream_id = 7;
        f.meta.frame_id = 42;

        f.encode_header().unwrap();

        let written = f.buf.read_bytes().to_vec();

        let mut r = Frame::new();
        let dest = r.buf.write_n_bytes(written.len());
        dest.copy_from_slice(&written);
        r.decode_header().unwrap();

        assert_eq!(r.frame_type, Some(FrameType::Notify));
        assert_eq!(r.meta.flags, FrameFlags::FIN.bits());
        assert_eq!(r.meta.stream_id, 7);
        assert_eq!(r.meta.frame_id, 42);
    }

    #[tokio::test]
    async fn agent_hello_frame_round_trips_through_write_and_read() {
        let hello = AgentHelloFrame {
            version: SPOP_VERSION,
            max_frame_size: MAX_FRAME_SIZE,
            capabilities: vec![CAPABILITY_PIPELINING, CAPABILITY_ASYNC],
        };

        let mut buf = Vec::new();
        hello.write_to(&mut buf).await.unwrap();

        let mut f = Frame::new();
        let mut cursor = std::io::Cursor::new(buf);
        f.read_from(&mut cursor).await.unwrap();

        assert_eq!(f.frame_type, Some(FrameType::AgentHello));

        let mut s = agent_wire::KVScanner::new(f.buf.read_bytes(), -1);
        let mut e = agent_wire::KVEntry::default();
        let mut saw_version = false;
        while s.next(&mut e) {
            if e.name_equals(HELLO_KEY_VERSION) {
                saw_version = true;
                assert_eq!(e.value_bytes(), SPOP_VERSION.as_bytes());
            }
        }
        assert!(saw_version);
    }

    #[tokio::test]
    async fn ack_frame_carries_stream_and_frame_id() {
        let ack = AckFrame {
            frame_id: 5,
            stream_id: 9,
        };

        let mut buf = Vec::new();
        ack.write_to(&mut buf, |aw| aw.set_bool(agent_wire::VarScope::Session, "ok", true))
            .await
            .unwrap();

        let mut f = Frame::new();
        let mut cursor = std::io::Cursor::new(buf);
        f.read_from(&mut cursor).await.unwrap();

        assert_eq!(f.frame_type, Some(FrameType::Ack));
        assert_eq!(f.meta.frame_id, 5);
        assert_eq!(f.meta.stream_id, 9);
    }
}
