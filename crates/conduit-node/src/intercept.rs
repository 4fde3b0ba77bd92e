//! Intercept listener: the client-role entry point.
//!
//! The kernel plane DNATs matching local connections to this listener. Per
//! accepted connection: recover the pre-NAT destination and the fwmark,
//! resolve a forwarding policy, dial the peer conduit, send the framed
//! handshake, then relay bytes until either side closes.

use crate::dial;
use crate::repo::{Policy, PolicyTable, Repo};
use crate::sock::{self, MARK_IP, MARK_IPPORT, MARK_PORT};
use conduit_core::codec::{write_tunnel_header, TunnelHeader};
use conduit_core::{ConduitError, ConduitResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Everything known about one intercepted connection.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    /// Original destination as "ip:port".
    pub dst: String,
    /// Where the server proxy should deliver; defaults to `dst`.
    pub dst_as: String,
}

/// Pick the policy for an intercepted connection.
///
/// The fwmark tells us which match set the packet hit, so we can go to the
/// right map directly. Without a mark (fwmark-accept disabled) fall back to
/// the precedence lookup: ip:port, then port, then ip.
pub fn resolve_policy(
    table: &PolicyTable,
    mark: u32,
    dst: &str,
    dst_port: u16,
    dst_ip: &str,
) -> Option<Policy> {
    table.with_read(|maps| match mark {
        m if m == MARK_IP => maps.get_ip(dst_ip),
        m if m == MARK_IPPORT => maps.get_ip_port(dst),
        m if m == MARK_PORT => maps.get_port(dst_port),
        _ => maps.get(dst, dst_port, dst_ip),
    })
}

/// The accept loop. Owns the bound listener; connection tasks drain into
/// the join set so shutdown can wait for in-flight tunnels.
pub struct Interceptor {
    listener: TcpListener,
    repo: Arc<Repo>,
}

impl Interceptor {
    pub fn new(listener: TcpListener, repo: Arc<Repo>) -> Self {
        Self { listener, repo }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut tunnels = JoinSet::new();
        info!(addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
              "intercept listener started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, src)) => {
                            let repo = self.repo.clone();
                            tunnels.spawn(handle_conn(repo, stream, src));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
            // Reap finished tunnels without blocking the accept path.
            while tunnels.try_join_next().is_some() {}
        }

        drop(self.listener);
        debug!(in_flight = tunnels.len(), "draining tunnels");
        while tunnels.join_next().await.is_some() {}
        info!("intercept listener stopped");
    }
}

async fn handle_conn(repo: Arc<Repo>, inbound: TcpStream, src: SocketAddr) {
    let dst = match sock::original_dst(&inbound) {
        Ok(dst) => dst,
        Err(e) => {
            error!(%src, error = %e, "original destination recovery failed");
            return;
        }
    };
    // Mark absence is survivable; the fallback lookup covers it.
    let mark = match sock::socket_mark(&inbound) {
        Ok(mark) => mark,
        Err(e) => {
            warn!(%src, error = %e, "socket mark unavailable");
            0
        }
    };

    let ctx = ConnContext {
        src_ip: src.ip().to_string(),
        src_port: src.port(),
        dst_ip: dst.ip().to_string(),
        dst_port: dst.port(),
        dst: dst.to_string(),
        dst_as: dst.to_string(),
    };
    debug!(src = %src, dst = %ctx.dst, mark, "intercepted connection");

    let Some(policy) = resolve_policy(&repo.table, mark, &ctx.dst, ctx.dst_port, &ctx.dst_ip)
    else {
        error!(dst = %ctx.dst, mark, "policy not found");
        return;
    };

    if let Err(e) = tunnel(inbound, ctx, policy).await {
        error!(%src, error = %e, "tunnel failed");
    }
}

/// Dial the peer, send the handshake frame, relay until either half
/// closes. Returns bytes copied in each direction.
async fn tunnel(
    mut inbound: TcpStream,
    mut ctx: ConnContext,
    policy: Policy,
) -> ConduitResult<(u64, u64)> {
    if let Some(dst_as) = &policy.dst_as {
        if !dst_as.is_empty() {
            ctx.dst_as = dst_as.clone();
        }
    }

    let mut outbound = dial::dial(&policy.peer_dial).await?;

    let header = TunnelHeader {
        src_ip: ctx.src_ip.clone(),
        src_port: ctx.src_port,
        dst_ip: ctx.dst_ip.clone(),
        dst_port: ctx.dst_port,
        dst_as: ctx.dst_as.clone(),
    };
    write_tunnel_header(&mut outbound, &header).await?;

    let copied = tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
        .await
        .map_err(ConduitError::Io)?;
    debug!(dst = %ctx.dst, dst_as = %ctx.dst_as, up = copied.0, down = copied.1, "tunnel closed");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dial::{DialPlan, Transport};
    use conduit_core::codec::read_tunnel_header;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn plan(addr: &str) -> Arc<DialPlan> {
        Arc::new(DialPlan {
            addresses: vec![addr.to_string()],
            transport: Transport::Raw,
            timeout: Duration::from_secs(2),
        })
    }

    fn policy(addr: &str, dst_as: Option<&str>) -> Policy {
        Policy {
            peer_dial: plan(addr),
            dst_as: dst_as.map(|s| s.to_string()),
        }
    }

    fn table_with_all_keyspaces() -> PolicyTable {
        let table = PolicyTable::new();
        table.with_write(|maps| {
            maps.add_ip("10.0.0.9".to_string(), policy("ip:1", None));
            maps.add_port(9090, policy("port:1", None));
            maps.add_ip_port("10.0.0.9:9090".to_string(), policy("ipport:1", None));
        });
        table
    }

    #[test]
    fn mark_dispatch_goes_straight_to_its_map() {
        let table = table_with_all_keyspaces();
        let hit = resolve_policy(&table, MARK_IP, "10.0.0.9:9090", 9090, "10.0.0.9").unwrap();
        assert_eq!(hit.peer_dial.addresses[0], "ip:1");
        let hit = resolve_policy(&table, MARK_PORT, "10.0.0.9:9090", 9090, "10.0.0.9").unwrap();
        assert_eq!(hit.peer_dial.addresses[0], "port:1");
        let hit = resolve_policy(&table, MARK_IPPORT, "10.0.0.9:9090", 9090, "10.0.0.9").unwrap();
        assert_eq!(hit.peer_dial.addresses[0], "ipport:1");
    }

    #[test]
    fn missing_mark_falls_back_in_precedence_order() {
        let table = table_with_all_keyspaces();
        // fwmark-accept disabled: mark reads as zero.
        let hit = resolve_policy(&table, 0, "10.0.0.9:9090", 9090, "10.0.0.9").unwrap();
        assert_eq!(hit.peer_dial.addresses[0], "ipport:1");
        let hit = resolve_policy(&table, 0, "10.0.0.8:9090", 9090, "10.0.0.8").unwrap();
        assert_eq!(hit.peer_dial.addresses[0], "port:1");
        let hit = resolve_policy(&table, 0, "10.0.0.9:7000", 7000, "10.0.0.9").unwrap();
        assert_eq!(hit.peer_dial.addresses[0], "ip:1");
        assert!(resolve_policy(&table, 0, "10.1.1.1:1", 1, "10.1.1.1").is_none());
    }

    #[test]
    fn marked_dispatch_does_not_fall_through() {
        let table = PolicyTable::new();
        table.with_write(|maps| maps.add_port(9090, policy("port:1", None)));
        // MARK_IP names the ip map; a port row must not satisfy it.
        assert!(resolve_policy(&table, MARK_IP, "10.0.0.9:9090", 9090, "10.0.0.9").is_none());
    }

    #[tokio::test]
    async fn tunnel_sends_header_then_relays_losslessly() {
        // A stand-in server proxy: read the handshake, then echo.
        let remote = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = remote.accept().await.unwrap();
            let header = read_tunnel_header(&mut conn).await.unwrap();
            assert_eq!(header.dst_as, "127.0.0.1:9090");
            assert_eq!(header.dst_port, 9090);
            let mut buf = vec![0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        // A connected socket pair standing in for the intercepted app.
        let gateway = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        let mut app = tokio::net::TcpStream::connect(gateway_addr).await.unwrap();
        let (intercepted, _) = gateway.accept().await.unwrap();

        let ctx = ConnContext {
            src_ip: "127.0.0.1".to_string(),
            src_port: app.local_addr().unwrap().port(),
            dst_ip: "10.0.0.2".to_string(),
            dst_port: 9090,
            dst: "10.0.0.2:9090".to_string(),
            dst_as: "10.0.0.2:9090".to_string(),
        };
        let relay = tokio::spawn(tunnel(
            intercepted,
            ctx,
            policy(&remote_addr.to_string(), Some("127.0.0.1:9090")),
        ));

        app.write_all(b"hello").await.unwrap();
        let mut echoed = vec![0u8; 5];
        app.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        drop(app);

        let (up, down) = relay.await.unwrap().unwrap();
        assert_eq!(up, 5);
        assert_eq!(down, 5);
        server.await.unwrap();
    }
}
