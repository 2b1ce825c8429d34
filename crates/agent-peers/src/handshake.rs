//! The Peers protocol's text handshake: three newline-terminated lines
//! exchanged before any binary message flows, and the three-digit status
//! line sent in reply.

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PeersError;

pub const PROTOCOL_IDENTIFIER: &str = "HAProxyS";
pub const PROTOCOL_VERSION: &str = "2.1";

/// Status codes exchanged on the handshake's reply line. Only
/// [`HandshakeStatus::Succeeded`] is ever emitted by this crate; the others
/// are carried for parsing symmetry with a peer that might send them.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Succeeded = 200,
    TryAgainLater = 300,
    ProtocolError = 501,
    BadVersion = 502,
    LocalPeerIdentifierMismatch = 503,
    RemotePeerIdentifierMismatch = 504,
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// The six fields HAProxy's peers protocol exchanges before any stick-table
/// traffic: protocol identifier and version, the peer this hello addresses,
/// the sender's own identity, and its process IDs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Handshake {
    pub protocol_identifier: String,
    pub version: String,
    pub remote_peer: String,
    pub local_peer_identifier: String,
    pub process_id: i32,
    pub relative_process_id: i32,
}

impl Handshake {
    /// A handshake ready to send to `remote_peer`, identifying this agent
    /// as `local_peer_identifier`. Kept symmetric with [`Handshake::write_to`]
    /// even though initiating an outbound peer connection is out of scope
    /// for this crate's listener.
    pub fn new(remote_peer: impl Into<String>, local_peer_identifier: impl Into<String>) -> Self {
        Self {
            protocol_identifier: PROTOCOL_IDENTIFIER.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            remote_peer: remote_peer.into(),
            local_peer_identifier: local_peer_identifier.into(),
            process_id: std::process::id() as i32,
            relative_process_id: 0,
        }
    }

    /// Scans the three handshake lines off `r`. Does not validate
    /// `protocol_identifier`/`version` against any expectation — parsing is
    /// purely structural, matching every field it reads.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, PeersError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();

        line.clear();
        r.read_line(&mut line).await?;
        let mut parts = line.trim_end_matches(['\r', '\n']).split_whitespace();
        let protocol_identifier = parts.next().ok_or(PeersError::MalformedHandshake)?.to_string();
        let version = parts.next().ok_or(PeersError::MalformedHandshake)?.to_string();

        line.clear();
        r.read_line(&mut line).await?;
        let remote_peer = line.trim_end_matches(['\r', '\n']).to_string();

        line.clear();
        r.read_line(&mut line).await?;
        let mut parts = line.trim_end_matches(['\r', '\n']).split_whitespace();
        let local_peer_identifier = parts.next().ok_or(PeersError::MalformedHandshake)?.to_string();
        let process_id = parts
            .next()
            .ok_or(PeersError::MalformedHandshake)?
            .parse()
            .map_err(|_| PeersError::MalformedHandshake)?;
        let relative_process_id = parts
            .next()
            .ok_or(PeersError::MalformedHandshake)?
            .parse()
            .map_err(|_| PeersError::MalformedHandshake)?;

        Ok(Self {
            protocol_identifier,
            version,
            remote_peer,
            local_peer_identifier,
            process_id,
            relative_process_id,
        })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let line1 = format!("{} {}\n", self.protocol_identifier, self.version);
        w.write_all(line1.as_bytes()).await?;

        let line2 = format!("{}\n", self.remote_peer);
        w.write_all(line2.as_bytes()).await?;

        let line3 = format!(
            "{} {} {}\n",
            self.local_peer_identifier, self.process_id, self.relative_process_id
        );
        w.write_all(line3.as_bytes()).await
    }
}

/// Writes the handshake's reply line, e.g. `"200\n"`.
pub async fn write_status<W>(w: &mut W, status: HandshakeStatus) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{status}\n");
    w.write_all(line.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn round_trips_through_write_then_read() {
        let h = Handshake::new("lb2", "lb1");
        let mut buf = Vec::new();
        h.write_to(&mut buf).await.unwrap();

        let mut r = BufReader::new(Cursor::new(buf));
        let parsed = Handshake::read_from(&mut r).await.unwrap();

        assert_eq!(parsed.protocol_identifier, PROTOCOL_IDENTIFIER);
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.remote_peer, "lb2");
        assert_eq!(parsed.local_peer_identifier, "lb1");
        assert_eq!(parsed.relative_process_id, 0);
    }

    #[tokio::test]
    async fn reads_the_exact_wire_form() {
        let wire = b"HAProxyS 2.1\nlb2\nlb1 4242 0\n".to_vec();
        let mut r = BufReader::new(Cursor::new(wire));
        let h = Handshake::read_from(&mut r).await.unwrap();

        assert_eq!(h.protocol_identifier, "HAProxyS");
        assert_eq!(h.version, "2.1");
        assert_eq!(h.remote_peer, "lb2");
        assert_eq!(h.local_peer_identifier, "lb1");
        assert_eq!(h.process_id, 4242);
        assert_eq!(h.relative_process_id, 0);
    }

    #[tokio::test]
    async fn status_line_is_three_digits_and_a_newline() {
        let mut buf = Vec::new();
        write_status(&mut buf, HandshakeStatus::Succeeded).await.unwrap();
        assert_eq!(buf, b"200\n");
    }
}
