//! The per-connection Peers protocol state machine: text handshake, then a
//! binary message loop racing a heartbeat ticker and a liveness timer.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::cancel::CancelToken;
use crate::error::PeersError;
use crate::handler::Handler;
use crate::handshake::{write_status, Handshake, HandshakeStatus};
use crate::message::{ControlMessageType, ErrorMessageType, MessageClass, RawMessage, StickTableUpdateMessageType};
use crate::sticktable::{Definition, EntryUpdate};

/// Per-connection knobs, constant across every connection a [`crate::Server`] accepts.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Outbound inactivity period after which a heartbeat frame is sent.
    pub heartbeat_interval: Duration,
    /// Inbound inactivity period after which the connection is closed.
    pub liveness_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            liveness_timeout: Duration::from_secs(5),
        }
    }
}

const HEARTBEAT_FRAME: [u8; 2] = [MessageClass::Control as u8, ControlMessageType::Heartbeat as u8];
const SYNC_PARTIAL_FRAME: [u8; 2] = [MessageClass::Control as u8, ControlMessageType::SyncPartial as u8];

/// Runs the Peers protocol state machine over `stream` until the remote
/// peer disconnects, a transport error occurs, the liveness timer expires,
/// or `cancel` fires.
pub async fn serve<S>(
    stream: S,
    handler: Arc<dyn Handler>,
    config: ClientConfig,
    cancel: CancelToken,
) -> Result<(), PeersError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));

    let handshake = Handshake::read_from(&mut reader).await?;
    debug!(remote_peer = %handshake.remote_peer, local = %handshake.local_peer_identifier, "peer handshake received");
    handler.handle_handshake(&handshake);

    {
        let mut w = writer.lock().await;
        write_status(&mut *w, HandshakeStatus::Succeeded).await?;
    }

    let outbound_activity = Arc::new(Notify::new());
    let inbound_activity = Arc::new(Notify::new());

    tokio::spawn(heartbeat_loop(
        writer.clone(),
        outbound_activity.clone(),
        config.heartbeat_interval,
        cancel.clone(),
    ));
    tokio::spawn(liveness_loop(inbound_activity.clone(), config.liveness_timeout, cancel.clone()));

    let mut last_definition: Option<Definition> = None;
    let mut last_entry_update: Option<EntryUpdate> = None;

    loop {
        let mut m = RawMessage::default();
        let read_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = m.read_from(&mut reader) => Some(r),
        };

        let m = match read_result {
            None => break,
            Some(Ok(())) => m,
            Some(Err(PeersError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Some(Err(e)) => return Err(e),
        };

        inbound_activity.notify_one();

        if let Err(e) = dispatch(
            &m,
            &handler,
            &writer,
            &outbound_activity,
            &mut last_definition,
            &mut last_entry_update,
        )
        .await
        {
            warn!(error = %e, "peers connection ended with a protocol error");
            return Err(e);
        }
    }

    debug!("peers connection closed");
    Ok(())
}

async fn dispatch<W: AsyncWrite + Unpin + Send>(
    m: &RawMessage,
    handler: &Arc<dyn Handler>,
    writer: &Arc<Mutex<W>>,
    outbound_activity: &Arc<Notify>,
    last_definition: &mut Option<Definition>,
    last_entry_update: &mut Option<EntryUpdate>,
) -> Result<(), PeersError> {
    match MessageClass::from_u8(m.class)? {
        MessageClass::Control => {
            let t = ControlMessageType::from_u8(m.message_type)?;
            trace!(?t, "control message");
            if t == ControlMessageType::SyncRequest {
                let mut w = writer.lock().await;
                w.write_all(&SYNC_PARTIAL_FRAME).await?;
                outbound_activity.notify_one();
            }
            Ok(())
        }
        MessageClass::Error => {
            let t = ErrorMessageType::from_u8(m.message_type)?;
            match t {
                ErrorMessageType::Protocol => Err(PeersError::ProtocolError),
                ErrorMessageType::SizeLimit => Err(PeersError::SizeLimitError),
            }
        }
        MessageClass::StickTableUpdates => {
            dispatch_stick_table(m, handler, last_definition, last_entry_update)
        }
        MessageClass::Reserved => Err(PeersError::from(crate::message::UnknownMessageClass(m.class))),
    }
}

fn dispatch_stick_table(
    m: &RawMessage,
    handler: &Arc<dyn Handler>,
    last_definition: &mut Option<Definition>,
    last_entry_update: &mut Option<EntryUpdate>,
) -> Result<(), PeersError> {
    let t = StickTableUpdateMessageType::from_u8(m.message_type)?;

    match t {
        StickTableUpdateMessageType::StickTableDefinition => {
            let (def, _) = Definition::unmarshal(&m.data)?;
            trace!(name = %def.name, "stick-table definition received");
            *last_definition = Some(def);
            return Ok(());
        }
        StickTableUpdateMessageType::StickTableSwitch | StickTableUpdateMessageType::UpdateAcknowledge => {
            debug!(?t, "not implemented");
            return Ok(());
        }
        _ => {}
    }

    let definition = last_definition.as_ref().ok_or(PeersError::NoTableDefinition)?;

    let fallback_id = last_entry_update.as_ref().map(|e| e.local_update_id.wrapping_add(1)).unwrap_or(0);
    let (update, consumed) = EntryUpdate::unmarshal(
        &m.data,
        definition,
        t.with_local_update_id(),
        t.with_expiry(),
        fallback_id,
    )?;

    if consumed != m.data.len() {
        return Err(PeersError::TrailingBytes);
    }

    handler.handle_update(definition, &update);
    *last_entry_update = Some(update);

    Ok(())
}

async fn heartbeat_loop<W: AsyncWrite + Unpin + Send>(
    writer: Arc<Mutex<W>>,
    outbound_activity: Arc<Notify>,
    interval: Duration,
    cancel: CancelToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = outbound_activity.notified() => continue,
            _ = tokio::time::sleep(interval) => {
                let mut w = writer.lock().await;
                if let Err(e) = w.write_all(&HEARTBEAT_FRAME).await {
                    warn!(error = %e, "failed to write peer heartbeat");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn liveness_loop(inbound_activity: Arc<Notify>, timeout: Duration, cancel: CancelToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = inbound_activity.notified() => continue,
            _ = tokio::time::sleep(timeout) => {
                error!("last message timer expired: closing connection");
                cancel.cancel();
                return;
            }
        }
    }
}
