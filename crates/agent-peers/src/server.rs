//! Accept loop: binds a listener, spawns a [`client::serve`] task per
//! accepted connection, and tears every connection down when the server's
//! base [`CancelToken`] fires.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::client::{self, ClientConfig};
use crate::handler::Handler;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub client: ClientConfig,
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
        info!(%addr, "peers agent listening");
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

            let handler = self.handler.clone();
            let client_config = self.config.client;
            let conn_cancel = self.base_cancel.child();

            tokio::spawn(async move {
                debug!(%peer, "peers connection accepted");
                if let Err(e) = client::serve(stream, handler, client_config, conn_cancel).await {
                    error!(%peer, error = %e, "peers connection ended with an error");
                } else {
                    debug!(%peer, "peers connection closed");
                }
            });
        }
    }
}
