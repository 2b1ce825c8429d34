//! The per-connection SPOP state machine: HELLO negotiation, NOTIFY
//! dispatch through the scheduler, and DISCONNECT/healthcheck teardown.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use agent_wire::{KVEntry, KVScanner, Message, MessageScanner};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{ErrorCode, SpopError};
use crate::frame::{
    AgentDisconnectFrame, AgentHelloFrame, Frame, FramePool, FrameType, CAPABILITY_ASYNC,
    CAPABILITY_PIPELINING, HELLO_KEY_HEALTHCHECK, HELLO_KEY_MAX_FRAME_SIZE, MAX_FRAME_SIZE,
    SPOP_VERSION,
};
use crate::handler::Handler;
use crate::scheduler::{panic_message, AsyncScheduler, FrameProcessor};

/// Per-agent knobs that don't vary by connection.
pub struct ClientConfig {
    pub capabilities: Vec<&'static str>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            capabilities: vec![CAPABILITY_PIPELINING, CAPABILITY_ASYNC],
        }
    }
}

struct SharedState {
    got_hello: AtomicBool,
    negotiated_frame_size: AtomicU32,
    cancel: CancelToken,
    /// Set when a HAProxyDisconnect frame carries a status-code outside
    /// `{None, Io, Timeout}`; surfaced as `serve`'s return value once the
    /// read loop observes cancellation, per the clean-vs-error shutdown
    /// split in `spec.md` §4.7/§7.
    disconnect_error: StdMutex<Option<(ErrorCode, String)>>,
}

struct Inner<W> {
    write: Mutex<W>,
    handler: Arc<dyn Handler>,
    state: SharedState,
    config: ClientConfig,
    frame_pool: FramePool,
}

impl<W: AsyncWrite + Unpin + Send> Inner<W> {
    async fn send_disconnect(&self, code: ErrorCode) {
        let mut w = self.write.lock().await;
        if let Err(e) = (AgentDisconnectFrame { err_code: code }).write_to(&mut *w).await {
            warn!(error = %e, "failed to write agent-disconnect frame");
        }
    }

    async fn handle_hello(&self, frame: &mut Frame) {
        if self.state.got_hello.swap(true, Ordering::SeqCst) {
            warn!("duplicate haproxy-hello on an already-negotiated connection");
            self.send_disconnect(ErrorCode::Invalid).await;
            self.state.cancel.cancel();
            return;
        }

        let mut requested_frame_size = MAX_FRAME_SIZE;
        let mut healthcheck = false;
        {
            let mut s = KVScanner::new(frame.buf.read_bytes(), -1);
            let mut e = KVEntry::default();
            while s.next(&mut e) {
                if e.name_equals(HELLO_KEY_MAX_FRAME_SIZE) {
                    requested_frame_size = e.value_int() as u32;
                } else if e.name_equals(HELLO_KEY_HEALTHCHECK) {
                    healthcheck = e.value_bool();
                }
            }
        }

        // The negotiated size can only ever shrink from what this agent is
        // willing to accept; a HAProxyHello that asks for more than
        // MAX_FRAME_SIZE is a protocol error, not something to silently cap.
        if requested_frame_size > MAX_FRAME_SIZE {
            warn!(
                requested = requested_frame_size,
                limit = MAX_FRAME_SIZE,
                "haproxy-hello requested a max-frame-size larger than this agent allows"
            );
            self.send_disconnect(ErrorCode::BadFrameSize).await;
            self.state.cancel.cancel();
            return;
        }

        let negotiated = requested_frame_size;
        self.state
            .negotiated_frame_size
            .store(negotiated, Ordering::SeqCst);

        let reply = AgentHelloFrame {
            version: SPOP_VERSION,
            max_frame_size: negotiated,
            capabilities: self.config.capabilities.clone(),
        };

        {
            let mut w = self.write.lock().await;
            if let Err(e) = reply.write_to(&mut *w).await {
                warn!(error = %e, "failed to write agent-hello reply");
                self.state.cancel.cancel();
                return;
            }
        }

        if healthcheck {
            // A healthcheck connection gets exactly one AgentHello and is
            // then expected to close; HAProxy never sends DISCONNECT for it.
            self.state.cancel.cancel();
        }
    }

    async fn handle_notify(&self, frame: &mut Frame) {
        let stream_id = frame.meta.stream_id;
        let frame_id = frame.meta.frame_id;
        let body = frame.buf.read_bytes();

        let mut w = self.write.lock().await;
        let ack = crate::frame::AckFrame { frame_id, stream_id };
        let handler = &self.handler;
        let result = ack
            .write_to(&mut *w, |aw| -> Result<(), agent_wire::kv::KvError> {
                let mut scanner = MessageScanner::new(body);
                let mut m = Message::default();
                while scanner.next(&mut m) {
                    // A handler that panics must not take the whole frame
                    // (or connection) down with it: the ack still goes out,
                    // just without whatever actions the panicking message
                    // would have contributed.
                    let before = aw.off();
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler.handle_spoe(aw, &mut m);
                    }));
                    if let Err(panic) = outcome {
                        let msg = panic_message(&panic);
                        tracing::error!(
                            stream_id,
                            frame_id,
                            panic = %msg,
                            "spoe handler panicked; replying with no actions for this message"
                        );
                        // Drop whatever partial action the handler left behind.
                        aw.truncate(before);
                    }
                    m.discard_kv()?;
                }
                if let Some(e) = scanner.error() {
                    warn!(error = %e, "malformed message inside notify frame");
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to write ack frame");
        }
    }

    async fn handle_disconnect(&self, frame: &mut Frame) {
        let mut code = ErrorCode::None;
        let mut message = String::new();
        {
            let mut s = KVScanner::new(frame.buf.read_bytes(), -1);
            let mut e = KVEntry::default();
            while s.next(&mut e) {
                if e.name_equals("status-code") {
                    code = ErrorCode::from_u32(e.value_int() as u32);
                } else if e.name_equals("message") {
                    message = String::from_utf8_lossy(e.value_bytes()).into_owned();
                }
            }
        }

        if !code.is_clean_shutdown() {
            warn!(?code, %message, "haproxy-disconnect carried a non-clean status code");
            *self.state.disconnect_error.lock().unwrap() = Some((code, message));
        } else {
            debug!(?code, "haproxy-disconnect: clean shutdown");
        }

        self.state.cancel.cancel();
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameProcessor for Inner<W> {
    fn process(&self, mut frame: Frame) -> impl Future<Output = ()> + Send {
        async move {
            match frame.frame_type {
                Some(FrameType::HaproxyHello) => self.handle_hello(&mut frame).await,
                Some(FrameType::Notify) => self.handle_notify(&mut frame).await,
                Some(FrameType::HaproxyDisconnect) => self.handle_disconnect(&mut frame).await,
                Some(other) => debug!(?other, "ignoring frame type not expected from haproxy"),
                None => {}
            }
            // Whichever worker finishes a frame returns it to the
            // connection's pool, regardless of which worker read it off the
            // wire in the first place.
            self.frame_pool.release_owned(frame);
        }
    }
}

/// How many [`Frame`]s a connection's pool starts out holding. Frames beyond
/// this many in flight at once are simply allocated on demand (see
/// [`agent_wire::pool::ResetPool::acquire_owned`]), so this only sizes the
/// warm-start working set, not a hard cap.
const FRAME_POOL_CAPACITY: usize = 16;

/// Runs the SPOP state machine over `stream` until HAProxy disconnects, a
/// transport error occurs, or `cancel` fires.
pub async fn serve<S>(
    stream: S,
    handler: Arc<dyn Handler>,
    config: ClientConfig,
    cancel: CancelToken,
) -> Result<(), SpopError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);

    let inner = Arc::new(Inner {
        write: Mutex::new(write_half),
        handler,
        state: SharedState {
            got_hello: AtomicBool::new(false),
            negotiated_frame_size: AtomicU32::new(MAX_FRAME_SIZE),
            cancel: cancel.clone(),
            disconnect_error: StdMutex::new(None),
        },
        config,
        frame_pool: FramePool::new(FRAME_POOL_CAPACITY),
    });

    let scheduler = AsyncScheduler::new(inner.clone());

    loop {
        let mut frame = inner.frame_pool.acquire_owned();
        let read_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = frame.read_from(&mut read_half) => Some(r),
        };

        match read_result {
            None => break,
            Some(Ok(())) => {}
            Some(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Some(Err(e)) => return Err(SpopError::Io(e)),
        }

        if scheduler.schedule(frame).await.is_err() {
            break;
        }
    }

    match inner.state.disconnect_error.lock().unwrap().take() {
        Some((code, message)) => Err(SpopError::Disconnected { code, message }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFn;
    use agent_wire::{ActionWriter, KVWriter, VarScope};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;

    fn build_hello_frame(max_frame_size: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut w = KVWriter::new(&mut buf, 0);
        w.set_string("supported-versions", SPOP_VERSION).unwrap();
        w.set_u32(HELLO_KEY_MAX_FRAME_SIZE, max_frame_size).unwrap();
        w.set_string("capabilities", "pipelining").unwrap();
        let off = w.off();
        buf.truncate(off);
        buf
    }

    async fn write_frame<W: AsyncWrite + Unpin>(
        w: &mut W,
        frame_type: FrameType,
        flags: u32,
        stream_id: u64,
        frame_id: u64,
        body: &[u8],
    ) {
        let mut f = Frame::new();
        f.frame_type = Some(frame_type);
        f.meta.flags = flags;
        f.meta.stream_id = stream_id;
        f.meta.frame_id = frame_id;
        f.encode_header().unwrap();
        f.buf.write_n_bytes(body.len()).copy_from_slice(body);
        f.write_to(w).await.unwrap();
    }

    #[tokio::test]
    async fn hello_negotiates_requested_frame_size() {
        let (client, agent) = duplex(8192);
        let cancel = CancelToken::new();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|_w: &mut ActionWriter<'_>, _m: &mut Message<'_>| {}));

        let cancel2 = cancel.clone();
        let server = tokio::spawn(async move {
            serve(agent, handler, ClientConfig::default(), cancel2).await
        });

        let (mut read_half, mut write_half) = tokio::io::split(client);

        let body = build_hello_frame(MAX_FRAME_SIZE);
        write_frame(&mut write_half, FrameType::HaproxyHello, 0x01, 0, 0, &body).await;

        let mut reply = Frame::new();
        reply.read_from(&mut read_half).await.unwrap();
        assert_eq!(reply.frame_type, Some(FrameType::AgentHello));

        let mut s = KVScanner::new(reply.buf.read_bytes(), -1);
        let mut e = KVEntry::default();
        let mut saw_size = false;
        while s.next(&mut e) {
            if e.name_equals(HELLO_KEY_MAX_FRAME_SIZE) {
                saw_size = true;
                assert_eq!(e.value_int() as u32, MAX_FRAME_SIZE);
            }
        }
        assert!(saw_size);

        cancel.cancel();
        drop(write_half);
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_max_frame_size_closes_without_agent_hello() {
        let (client, agent) = duplex(8192);
        let cancel = CancelToken::new();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|_w: &mut ActionWriter<'_>, _m: &mut Message<'_>| {}));

        let cancel2 = cancel.clone();
        let server = tokio::spawn(async move {
            serve(agent, handler, ClientConfig::default(), cancel2).await
        });

        let (mut read_half, mut write_half) = tokio::io::split(client);

        let body = build_hello_frame(MAX_FRAME_SIZE + 1);
        write_frame(&mut write_half, FrameType::HaproxyHello, 0x01, 0, 0, &body).await;

        let mut reply = Frame::new();
        reply.read_from(&mut read_half).await.unwrap();
        // No AgentHello is ever emitted; the agent goes straight to a
        // best-effort AgentDisconnect before closing.
        assert_eq!(reply.frame_type, Some(FrameType::AgentDisconnect));

        drop(write_half);
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn notify_dispatches_to_handler_and_acks() {
        let (client, agent) = duplex(8192);
        let cancel = CancelToken::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(move |w: &mut ActionWriter<'_>, m: &mut Message<'_>| {
            seen2.fetch_add(1, Ordering::SeqCst);
            assert_eq!(m.name_bytes(), b"check-client-ip");
            w.set_bool(VarScope::Transaction, "allow", true).unwrap();
        }));

        let cancel2 = cancel.clone();
        let server =
            tokio::spawn(async move { serve(agent, handler, ClientConfig::default(), cancel2).await });

        let (mut read_half, mut write_half) = tokio::io::split(client);

        let hello_body = build_hello_frame(MAX_FRAME_SIZE);
        write_frame(&mut write_half, FrameType::HaproxyHello, 0x01, 0, 0, &hello_body).await;
        let mut hello_reply = Frame::new();
        hello_reply.read_from(&mut read_half).await.unwrap();
        assert_eq!(hello_reply.frame_type, Some(FrameType::AgentHello));

        let mut msg_buf = vec![0u8; 128];
        let mut off = 0;
        let name = b"check-client-ip";
        let nlen = agent_wire::encode_varint(&mut msg_buf[off..], name.len() as u64).unwrap();
        off += nlen;
        msg_buf[off..off + name.len()].copy_from_slice(name);
        off += name.len();
        msg_buf[off] = 0; // zero KV entries
        off += 1;
        msg_buf.truncate(off);

        write_frame(&mut write_half, FrameType::Notify, 0x01, 3, 9, &msg_buf).await;

        let mut ack = Frame::new();
        ack.read_from(&mut read_half).await.unwrap();
        assert_eq!(ack.frame_type, Some(FrameType::Ack));
        assert_eq!(ack.meta.stream_id, 3);
        assert_eq!(ack.meta.frame_id, 9);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        cancel.cancel();
        drop(write_half);
        let _ = server.await.unwrap();
    }

    fn build_single_empty_kv_message(name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 128];
        let mut off = agent_wire::encode_varint(&mut buf, name.as_bytes().len() as u64).unwrap();
        buf[off..off + name.len()].copy_from_slice(name.as_bytes());
        off += name.len();
        buf[off] = 0;
        off += 1;
        buf.truncate(off);
        buf
    }

    #[tokio::test]
    async fn panicking_handler_still_produces_an_ack_with_no_actions() {
        let (client, agent) = duplex(8192);
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(move |_w: &mut ActionWriter<'_>, _m: &mut Message<'_>| {
            calls2.fetch_add(1, Ordering::SeqCst);
            panic!("handler blew up");
        }));

        let cancel2 = cancel.clone();
        let server =
            tokio::spawn(async move { serve(agent, handler, ClientConfig::default(), cancel2).await });

        let (mut read_half, mut write_half) = tokio::io::split(client);

        let hello_body = build_hello_frame(MAX_FRAME_SIZE);
        write_frame(&mut write_half, FrameType::HaproxyHello, 0x01, 0, 0, &hello_body).await;
        let mut hello_reply = Frame::new();
        hello_reply.read_from(&mut read_half).await.unwrap();
        assert_eq!(hello_reply.frame_type, Some(FrameType::AgentHello));

        // First notify: handler panics on this message.
        let msg = build_single_empty_kv_message("panics-here");
        write_frame(&mut write_half, FrameType::Notify, 0x01, 1, 1, &msg).await;

        let mut ack = Frame::new();
        ack.read_from(&mut read_half).await.unwrap();
        assert_eq!(ack.frame_type, Some(FrameType::Ack));
        assert_eq!(ack.meta.stream_id, 1);
        assert_eq!(ack.meta.frame_id, 1);
        assert_eq!(ack.buf.len(), 0, "no actions should survive a handler panic");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The connection keeps serving subsequent notifies afterwards.
        let msg2 = build_single_empty_kv_message("panics-again");
        write_frame(&mut write_half, FrameType::Notify, 0x01, 2, 2, &msg2).await;

        let mut ack2 = Frame::new();
        ack2.read_from(&mut read_half).await.unwrap();
        assert_eq!(ack2.frame_type, Some(FrameType::Ack));
        assert_eq!(ack2.meta.stream_id, 2);
        assert_eq!(ack2.meta.frame_id, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        drop(write_half);
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn golden_status_code_action_end_to_end() {
        let (client, agent) = duplex(8192);
        let cancel = CancelToken::new();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|w: &mut ActionWriter<'_>, _m: &mut Message<'_>| {
            w.set_i64(VarScope::Transaction, "statuscode", 401).unwrap();
        }));

        let cancel2 = cancel.clone();
        let server =
            tokio::spawn(async move { serve(agent, handler, ClientConfig::default(), cancel2).await });

        let (mut read_half, mut write_half) = tokio::io::split(client);

        let hello_body = build_hello_frame(MAX_FRAME_SIZE);
        write_frame(&mut write_half, FrameType::HaproxyHello, 0x01, 0, 0, &hello_body).await;
        let mut hello_reply = Frame::new();
        hello_reply.read_from(&mut read_half).await.unwrap();

        let msg = build_single_empty_kv_message("txn-end");
        write_frame(&mut write_half, FrameType::Notify, 0x01, 0, 0, &msg).await;

        let mut ack = Frame::new();
        ack.read_from(&mut read_half).await.unwrap();
        assert_eq!(
            ack.buf.read_bytes(),
            &[0x01, 0x03, 0x02, 0x0A, b's', b't', b'a', b't', b'u', b's', b'c', b'o', b'd', b'e', 0x04, 0xF1, 0x0A]
        );

        cancel.cancel();
        drop(write_half);
        let _ = server.await.unwrap();
    }

    fn build_disconnect_frame(code: ErrorCode, message: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut w = agent_wire::KVWriter::new(&mut buf, 0);
        w.set_u32("status-code", code as u32).unwrap();
        w.set_string("message", message).unwrap();
        let off = w.off();
        buf.truncate(off);
        buf
    }

    #[tokio::test]
    async fn haproxy_disconnect_with_io_code_is_a_clean_shutdown() {
        let (client, agent) = duplex(8192);
        let cancel = CancelToken::new();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|_w: &mut ActionWriter<'_>, _m: &mut Message<'_>| {}));

        let server =
            tokio::spawn(async move { serve(agent, handler, ClientConfig::default(), cancel).await });

        let (_read_half, mut write_half) = tokio::io::split(client);

        let hello_body = build_hello_frame(MAX_FRAME_SIZE);
        write_frame(&mut write_half, FrameType::HaproxyHello, 0x01, 0, 0, &hello_body).await;

        let body = build_disconnect_frame(ErrorCode::Io, "i/o error");
        write_frame(&mut write_half, FrameType::HaproxyDisconnect, 0x01, 0, 0, &body).await;

        let result = server.await.unwrap();
        assert!(result.is_ok(), "{result:?} should be a clean shutdown");
    }

    #[tokio::test]
    async fn haproxy_disconnect_with_bad_version_surfaces_as_an_error() {
        let (client, agent) = duplex(8192);
        let cancel = CancelToken::new();
        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|_w: &mut ActionWriter<'_>, _m: &mut Message<'_>| {}));

        let server =
            tokio::spawn(async move { serve(agent, handler, ClientConfig::default(), cancel).await });

        let (_read_half, mut write_half) = tokio::io::split(client);

        let hello_body = build_hello_frame(MAX_FRAME_SIZE);
        write_frame(&mut write_half, FrameType::HaproxyHello, 0x01, 0, 0, &hello_body).await;

        let body = build_disconnect_frame(ErrorCode::BadVersion, "unsupported version");
        write_frame(&mut write_half, FrameType::HaproxyDisconnect, 0x01, 0, 0, &body).await;

        let result = server.await.unwrap();
        match result {
            Err(SpopError::Disconnected { code: ErrorCode::BadVersion, .. }) => {}
            other => panic!("expected a BadVersion disconnect error, got {other:?}"),
        }
    }
}
