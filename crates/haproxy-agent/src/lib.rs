//! Top-level HAProxy agent crate.
//!
//! Bundles the two protocol runtimes HAProxy speaks to an external agent:
//! SPOP (`spop`, filter-driven stream processing) and Peers (`peers`,
//! stick-table replication). Each is gated behind its own Cargo feature so a
//! binary that only needs one protocol doesn't pull in the other's
//! dependencies.
//!
//! ```toml
//! [dependencies]
//! haproxy-agent = { version = "0.5", features = ["spop"] }
//! ```

#[cfg(feature = "spop")]
pub mod spop {
    //! Re-exports of [`agent_spop`]'s public API.
    pub use agent_spop::*;
}

#[cfg(feature = "peers")]
pub mod peers {
    //! Re-exports of [`agent_peers`]'s public API.
    pub use agent_peers::*;
}

/// Convenience imports for the common case of running one protocol server.
///
/// ```ignore
/// use haproxy_agent::prelude::*;
/// ```
pub mod prelude {
    #[cfg(feature = "spop")]
    pub use crate::spop::{Handler as SpopHandler, Server as SpopServer, ServerConfig as SpopServerConfig};

    #[cfg(feature = "peers")]
    pub use crate::peers::{Handler as PeersHandler, Server as PeersServer, ServerConfig as PeersServerConfig};
}

#[cfg(all(test, feature = "spop", feature = "peers"))]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct NoopSpopHandler;
    impl SpopHandler for NoopSpopHandler {
        fn handle_spoe(&self, _w: &mut agent_wire::ActionWriter<'_>, _m: &mut agent_wire::Message<'_>) {}
    }

    struct NoopPeersHandler;
    impl PeersHandler for NoopPeersHandler {
        fn handle_update(
            &self,
            _definition: &crate::peers::Definition,
            _update: &crate::peers::EntryUpdate,
        ) {
        }
    }

    // Both protocol servers are independent runtimes: accepting a SPOP
    // connection on one listener does not interfere with a Peers handshake
    // running concurrently on another.
    #[tokio::test]
    async fn spop_and_peers_servers_run_side_by_side() {
        let spop_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let spop_addr = spop_listener.local_addr().unwrap();
        let spop_server = SpopServer::new(Arc::new(NoopSpopHandler), SpopServerConfig::default());
        let spop_cancel = spop_server.cancel_token();
        let spop_task = tokio::spawn(async move { spop_server.serve(spop_listener).await });

        let peers_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peers_addr = peers_listener.local_addr().unwrap();
        let peers_server = PeersServer::new(Arc::new(NoopPeersHandler), PeersServerConfig::default());
        let peers_cancel = peers_server.cancel_token();
        let peers_task = tokio::spawn(async move { peers_server.serve(peers_listener).await });

        let mut peers_client = TcpStream::connect(peers_addr).await.unwrap();
        peers_client
            .write_all(b"HAProxyS 2.1\nlb2\nlb1 1 0\n")
            .await
            .unwrap();
        let mut reply = [0u8; 4];
        peers_client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"200\n");

        let spop_client = TcpStream::connect(spop_addr).await.unwrap();
        drop(spop_client);

        peers_cancel.cancel();
        spop_cancel.cancel();
        let _ = peers_task.await.unwrap();
        let _ = spop_task.await.unwrap();
    }
}
