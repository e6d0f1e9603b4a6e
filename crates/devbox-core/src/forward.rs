//! Port-forward relay.
//!
//! A cluster port is tunnelled to an ephemeral local middleware port. The
//! caller-facing listener relays each connection to the middleware and
//! drains both directions before closing, so trailing bytes survive an
//! abrupt close of the forwarded stream.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::error::ClusterError;

/// Ask the OS for an unused local port.
pub async fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// A running forward. Stops when the token passed to [`start`] is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    pub local_port: u16,
    pub middleware_port: u16,
}

/// Forward `cluster_port` of `pod` to `127.0.0.1:local_port`.
pub async fn start(
    cluster: Arc<dyn ClusterClient>,
    namespace: &str,
    pod: &str,
    cluster_port: u16,
    local_port: u16,
    token: &CancellationToken,
) -> Result<PortForward, ClusterError> {
    let middleware = TcpListener::bind(("127.0.0.1", 0)).await?;
    let middleware_port = middleware.local_addr()?.port();
    let relay = TcpListener::bind(("127.0.0.1", local_port)).await?;
    let local_port = relay.local_addr()?.port();

    let namespace = namespace.to_string();
    let pod = pod.to_string();
    let tunnel_token = token.clone();
    tokio::spawn(async move {
        loop {
            let socket = tokio::select! {
                _ = tunnel_token.cancelled() => break,
                accepted = middleware.accept() => match accepted {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        warn!(error = %e, "middleware accept failed");
                        continue;
                    }
                },
            };
            let cluster = Arc::clone(&cluster);
            let namespace = namespace.clone();
            let pod = pod.clone();
            tokio::spawn(async move {
                match cluster.port_forward(&namespace, &pod, cluster_port).await {
                    Ok(mut stream) => {
                        let mut socket = socket;
                        if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                            debug!(pod = %pod, port = cluster_port, error = %e, "tunnel closed");
                        }
                    }
                    Err(e) => warn!(pod = %pod, port = cluster_port, error = %e, "tunnel failed"),
                }
            });
        }
    });

    let relay_token = token.clone();
    tokio::spawn(async move {
        loop {
            let client = tokio::select! {
                _ = relay_token.cancelled() => break,
                accepted = relay.accept() => match accepted {
                    Ok((client, _)) => client,
                    Err(e) => {
                        warn!(error = %e, "relay accept failed");
                        continue;
                    }
                },
            };
            tokio::spawn(async move {
                match TcpStream::connect(("127.0.0.1", middleware_port)).await {
                    Ok(upstream) => {
                        if let Err(e) = relay_connection(client, upstream).await {
                            debug!(error = %e, "relay connection ended with error");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to reach middleware"),
                }
            });
        }
    });

    info!(local_port = local_port, cluster_port = cluster_port, "port forward started");
    Ok(PortForward {
        local_port,
        middleware_port,
    })
}

/// Copy both directions to completion, then drain whatever is left.
///
/// A failure in one direction does not cut the other short. Returns bytes
/// sent upstream and bytes received from upstream.
pub async fn relay_connection<C, U>(client: C, upstream: U) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let outbound = async {
        let sent = tokio::io::copy(&mut client_read, &mut upstream_write).await?;
        upstream_write.shutdown().await?;
        Ok::<u64, io::Error>(sent)
    };
    let inbound = async {
        let received = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
        client_write.flush().await?;
        client_write.shutdown().await?;
        Ok::<u64, io::Error>(received)
    };
    let (sent, received) = tokio::join!(outbound, inbound);

    let mut sink = tokio::io::sink();
    let mut scratch = Vec::new();
    let _ = client_read.read_to_end(&mut scratch).await;
    let _ = tokio::io::copy(&mut upstream_read, &mut sink).await;

    Ok((sent?, received?))
}
