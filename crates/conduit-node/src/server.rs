//! Server proxy: the tunnel-terminating role.
//!
//! Accepts (optionally mutually authenticated) connections from client
//! proxies, reads the framed handshake, dials the requested origin with
//! the loop-guard mark set, and relays. Possession of a valid client
//! certificate is the only authorization check.

use crate::dial;
use conduit_core::codec::read_tunnel_header;
use conduit_core::netcfg::ListenConfig;
use conduit_core::proto::TlsMaterial;
use conduit_core::rpc::SessionStream;
use conduit_core::{tlsutil, ConduitError, ConduitResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ORIGIN_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerProxy {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl ServerProxy {
    /// Bind the configured listen address. Manager-issued DER material
    /// takes precedence over file-configured TLS; with neither, the
    /// listener is plain TCP.
    pub async fn bind(
        listen: &ListenConfig,
        material: Option<&TlsMaterial>,
    ) -> ConduitResult<ServerProxy> {
        let listener = TcpListener::bind(&listen.addr).await?;

        let acceptor = if let Some(material) = material {
            let config = tlsutil::server_config_from_material(material)?;
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            match &listen.tls {
                Some(tls) if tls.enable => {
                    let config = tlsutil::server_config_from_files(tls)?;
                    Some(TlsAcceptor::from(Arc::new(config)))
                }
                _ => None,
            }
        };

        Ok(ServerProxy { listener, acceptor })
    }

    pub fn local_addr(&self) -> ConduitResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut conns = JoinSet::new();
        info!(
            addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            mtls = self.acceptor.is_some(),
            "server proxy started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let acceptor = self.acceptor.clone();
                            conns.spawn(async move {
                                if let Err(e) = handle_inbound(stream, peer, acceptor).await {
                                    error!(%peer, error = %e, "inbound tunnel failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
            while conns.try_join_next().is_some() {}
        }

        drop(self.listener);
        while conns.join_next().await.is_some() {}
        info!("server proxy stopped");
    }
}

async fn handle_inbound(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> ConduitResult<()> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| ConduitError::Tls(e.to_string()))?;
            relay_inbound(tls, peer).await
        }
        None => relay_inbound(stream, peer).await,
    }
}

async fn relay_inbound<S>(mut inbound: S, peer: SocketAddr) -> ConduitResult<()>
where
    S: SessionStream,
{
    let header = read_tunnel_header(&mut inbound).await?;
    debug!(
        %peer,
        src = %format!("{}:{}", header.src_ip, header.src_port),
        dst_as = %header.dst_as,
        "tunnel handshake"
    );

    let outbound = tokio::time::timeout(
        ORIGIN_DIAL_TIMEOUT,
        dial::connect_marked(&header.dst_as),
    )
    .await
    .map_err(|_| ConduitError::Timeout)??;
    let mut outbound = outbound;

    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
        .await
        .map_err(ConduitError::Io)?;
    debug!(%peer, dst_as = %header.dst_as, up, down, "tunnel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::codec::{write_tunnel_header, TunnelHeader};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn plain_tunnel_delivers_to_origin() {
        // Origin that uppercases one chunk.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            buf.make_ascii_uppercase();
            conn.write_all(&buf).await.unwrap();
        });

        let listen = ListenConfig {
            network: "tcp4".to_string(),
            addr: "127.0.0.1:0".to_string(),
            tls: None,
        };
        let proxy = ServerProxy::bind(&listen, None).await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(proxy.run(shutdown_rx));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let header = TunnelHeader {
            src_ip: "10.0.0.1".to_string(),
            src_port: 55555,
            dst_ip: "10.0.0.2".to_string(),
            dst_port: 9090,
            dst_as: origin_addr.to_string(),
        };
        write_tunnel_header(&mut client, &header).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = vec![0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PING");

        drop(client);
        shutdown_tx.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn truncated_handshake_closes_connection() {
        let listen = ListenConfig {
            network: "tcp4".to_string(),
            addr: "127.0.0.1:0".to_string(),
            tls: None,
        };
        let proxy = ServerProxy::bind(&listen, None).await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(proxy.run(shutdown_rx));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        // Length says 16 bytes; send only 3 and close.
        client.write_all(&16u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        // The proxy must survive the bad peer and keep serving.
        let mut again = TcpStream::connect(proxy_addr).await.unwrap();
        again.write_all(&1u32.to_le_bytes()).await.unwrap();
        drop(again);

        shutdown_tx.send(()).unwrap();
        server.await.unwrap();
    }
}
