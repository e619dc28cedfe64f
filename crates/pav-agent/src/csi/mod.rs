//! Serving the container-storage RPC surface over a unix socket, where
//! the orchestrator's sidecars expect to find it.

pub mod controller;
pub mod identity;
pub mod node;

use std::path::Path;

use k8s_csi::v1_3_0::controller_server::ControllerServer;
use k8s_csi::v1_3_0::identity_server::IdentityServer;
use k8s_csi::v1_3_0::node_server::NodeServer;
use tracing::info;

pub use controller::ControllerPlugin;
pub use identity::IdentityService;
pub use node::NodePlugin;

/// Serves Identity + Controller on the given socket. Blocks until the
/// server exits.
pub async fn serve_controller(
    identity: IdentityService,
    controller: ControllerPlugin,
    socket_path: &Path,
) -> anyhow::Result<()> {
    let socket = socket::PluginSocket::bind(socket_path)?;
    info!(socket = %socket_path.display(), "serving CSI controller plugin");
    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(ControllerServer::new(controller))
        .serve_with_incoming(socket)
        .await?;
    Ok(())
}

/// Serves Identity + Node on the given socket. Blocks until the server
/// exits.
pub async fn serve_node(
    identity: IdentityService,
    node: NodePlugin,
    socket_path: &Path,
) -> anyhow::Result<()> {
    let socket = socket::PluginSocket::bind(socket_path)?;
    info!(socket = %socket_path.display(), "serving CSI node plugin");
    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node))
        .serve_with_incoming(socket)
        .await?;
    Ok(())
}

mod socket {
    //! tonic serves TCP out of the box, but the external provisioner
    //! and the kubelet dial storage plugins over a unix socket; this
    //! adapter feeds the server an incoming stream of accepted unix
    //! connections instead.

    use std::io;
    use std::path::{Path, PathBuf};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures::Stream;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::{UnixListener, UnixStream};
    use tonic::transport::server::Connected;
    use tracing::{debug, warn};

    /// Accepts plugin connections on a unix socket. The socket file is
    /// claimed on bind, replacing a leftover from a previous agent run,
    /// and unlinked again on drop.
    pub struct PluginSocket {
        listener: UnixListener,
        path: PathBuf,
    }

    impl PluginSocket {
        pub fn bind(path: &Path) -> anyhow::Result<Self> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::remove_file(path) {
                Ok(()) => debug!(socket = %path.display(), "replaced leftover socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            }
            Ok(PluginSocket {
                listener: UnixListener::bind(path)?,
                path: path.to_owned(),
            })
        }
    }

    impl Drop for PluginSocket {
        fn drop(&mut self) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(socket = %self.path.display(), error = %e,
                      "socket file not cleaned up, manual removal needed");
            }
        }
    }

    impl Stream for PluginSocket {
        type Item = io::Result<Connection>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.listener
                .poll_accept(cx)
                .map(|accepted| Some(accepted.map(|(stream, _addr)| Connection(stream))))
        }
    }

    /// One accepted plugin connection; read and write pass straight
    /// through to the underlying stream.
    #[derive(Debug)]
    pub struct Connection(UnixStream);

    impl Connected for Connection {
        type ConnectInfo = ();

        fn connect_info(&self) -> Self::ConnectInfo {}
    }

    impl AsyncRead for Connection {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Connection {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        #[tokio::test]
        async fn binding_claims_and_dropping_unlinks_the_socket_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("plugin").join("csi.sock");

            // A leftover file from a crashed run must not block the bind.
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();

            let socket = PluginSocket::bind(&path).unwrap();
            assert!(path.exists());
            drop(socket);
            assert!(!path.exists());
        }

        #[tokio::test]
        async fn accepted_connections_surface_on_the_stream() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("csi.sock");
            let mut socket = PluginSocket::bind(&path).unwrap();

            let mut client = UnixStream::connect(&path).await.unwrap();
            let mut connection = socket.next().await.unwrap().unwrap();

            client.write_all(b"ping").await.unwrap();
            client.shutdown().await.unwrap();

            let mut received = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut connection, &mut received)
                .await
                .unwrap();
            assert_eq!(received, b"ping");
        }
    }
}
