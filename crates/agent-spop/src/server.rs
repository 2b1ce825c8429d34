//! Accept loop: binds a listener, spawns a [`client::serve`] task per
//! accepted connection, and tears every connection down when the server's
//! base [`CancelToken`] fires.

use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::client::{self, ClientConfig};
use crate::frame::MAX_FRAME_SIZE;
use crate::handler::Handler;

/// Knobs for the accept loop itself, separate from [`ClientConfig`] which
/// governs per-connection negotiation.
pub struct ServerConfig {
    pub client: ClientConfig,
    /// Socket buffers (send and receive) are sized to at least
    /// `socket_buffer_multiple * MAX_FRAME_SIZE` on every accepted TCP
    /// connection.
    pub socket_buffer_multiple: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            socket_buffer_multiple: 4,
        }
    }
}

/// Owns a listener and the base cancellation token that tears down every
/// connection it has spawned.
pub struct Server {
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    base_cancel: CancelToken,
}

impl Server {
    pub fn new(handler: Arc<dyn Handler>, config: ServerConfig) -> Self {
        Self {
            handler,
            config,
            base_cancel: CancelToken::new(),
        }
    }

    /// The token that, once cancelled, closes the listener and every live
    /// connection spawned from it.
    pub fn cancel_token(&self) -> CancelToken {
        self.base_cancel.clone()
    }

    pub async fn listen_and_serve(&self, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "spop agent listening");
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.base_cancel.cancelled() => return Ok(()),
                r = listener.accept() => r,
            };

            let (stream, peer) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if let Err(e) = tune_socket_buffers(&stream, self.config.socket_buffer_multiple) {
                debug!(error = %e, %peer, "could not tune tcp socket buffers");
            }

            let handler = self.handler.clone();
            let client_config = ClientConfig {
                capabilities: self.config.client.capabilities.clone(),
            };
            let conn_cancel = self.base_cancel.child();

            tokio::spawn(async move {
                debug!(%peer, "spop connection accepted");
                if let Err(e) = client::serve(stream, handler, client_config, conn_cancel).await {
                    error!(%peer, error = %e, "spop connection ended with an error");
                } else {
                    debug!(%peer, "spop connection closed");
                }
            });
        }
    }
}

#[cfg(unix)]
fn tune_socket_buffers(stream: &TcpStream, multiple: u32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let target = (MAX_FRAME_SIZE * multiple) as libc::c_int;
    let fd = stream.as_raw_fd();

    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &target as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn tune_socket_buffers(_stream: &TcpStream, _multiple: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFn;
    use agent_wire::{ActionWriter, Message};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn accepts_a_connection_and_runs_the_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handler: Arc<dyn Handler> = Arc::new(HandlerFn(|_w: &mut ActionWriter<'_>, _m: &mut Message<'_>| {}));
        let server = Server::new(handler, ServerConfig::default());
        let cancel = server.cancel_token();

        let server_task = tokio::spawn(async move { server.serve(listener).await });

        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut buf = vec![0u8; 256];
        let mut w = agent_wire::KVWriter::new(&mut buf, 0);
        w.set_string("supported-versions", "2.0").unwrap();
        w.set_u32("max-frame-size", 16384).unwrap();
        let off = w.off();
        buf.truncate(off);

        let mut frame = crate::frame::Frame::new();
        frame.frame_type = Some(crate::frame::FrameType::HaproxyHello);
        frame.meta.flags = 1;
        frame.encode_header().unwrap();
        frame.buf.write_n_bytes(buf.len()).copy_from_slice(&buf);
        frame.write_to(&mut client).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let body_len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; body_len];
        client.read_exact(&mut body).await.unwrap();
        // type byte for AgentHello == 101.
        assert_eq!(body[0], 101);

        client.shutdown().await.unwrap();
        cancel.cancel();
        let _ = server_task.await.unwrap();
    }
}
