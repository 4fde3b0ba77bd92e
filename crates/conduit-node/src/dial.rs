//! Dial engine: marked outbound sockets to a peer conduit.
//!
//! The raw/tls/mtls distinction is resolved when a [`DialPlan`] is built;
//! by connect time there is only "plain socket" or "wrap in this
//! connector".

use crate::sock::{self, MARK_IGNORE_SELF};
use conduit_core::netcfg::DialConfig;
use conduit_core::netutil::split_host_port;
use conduit_core::proto::TlsMaterial;
use conduit_core::rpc::BoxedStream;
use conduit_core::{tlsutil, ConduitError, ConduitResult};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// How the byte stream to a peer is transported.
pub enum Transport {
    Raw,
    Tls(TlsConnector),
}

/// A fully resolved dial target: candidate addresses plus transport.
pub struct DialPlan {
    pub addresses: Vec<String>,
    pub transport: Transport,
    pub timeout: Duration,
}

impl DialPlan {
    /// Resolve a file-backed dial config into a plan.
    pub fn from_config(dial: &DialConfig, timeout: Duration) -> ConduitResult<DialPlan> {
        if dial.addresses.is_empty() {
            return Err(ConduitError::InvalidAddress("empty dial addresses".to_string()));
        }
        let transport = match &dial.tls {
            Some(tls) if tls.enable => {
                let config = tlsutil::client_config_from_files(tls)?;
                Transport::Tls(TlsConnector::from(Arc::new(config)))
            }
            _ => Transport::Raw,
        };
        Ok(DialPlan {
            addresses: dial.addresses.clone(),
            transport,
            timeout,
        })
    }

    /// Build the mutual-TLS plan for a dynamically learned peer from
    /// manager-issued material.
    pub fn mtls_from_material(
        addresses: Vec<String>,
        material: &TlsMaterial,
        timeout: Duration,
    ) -> ConduitResult<DialPlan> {
        if addresses.is_empty() {
            return Err(ConduitError::InvalidAddress("empty dial addresses".to_string()));
        }
        let config = tlsutil::client_config_from_material(material)?;
        Ok(DialPlan {
            addresses,
            transport: Transport::Tls(TlsConnector::from(Arc::new(config))),
            timeout,
        })
    }
}

/// Dial one address of the plan, chosen uniformly at random, under the
/// plan's timeout. Errors surface to the caller; retry is connection-scope.
pub async fn dial(plan: &DialPlan) -> ConduitResult<BoxedStream> {
    let index = rand::thread_rng().gen_range(0..plan.addresses.len());
    let addr = &plan.addresses[index];
    match tokio::time::timeout(plan.timeout, dial_addr(plan, addr)).await {
        Ok(result) => result,
        Err(_) => Err(ConduitError::Timeout),
    }
}

async fn dial_addr(plan: &DialPlan, addr: &str) -> ConduitResult<BoxedStream> {
    let stream = connect_marked(addr).await?;
    match &plan.transport {
        Transport::Raw => Ok(Box::new(stream)),
        Transport::Tls(connector) => {
            let (host, _port) = split_host_port(addr)?;
            let name = tlsutil::server_name(host)?;
            let tls = connector
                .connect(name, stream)
                .await
                .map_err(|e| ConduitError::Tls(e.to_string()))?;
            Ok(Box::new(tls))
        }
    }
}

/// Open a TCP connection with `SO_REUSEADDR` and
/// `SO_MARK = MARK_IGNORE_SELF` set before connect.
pub async fn connect_marked(addr: &str) -> ConduitResult<TcpStream> {
    let sockaddr = lookup_host(addr)
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| ConduitError::InvalidAddress(addr.to_string()))?;
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    if let Err(e) = sock::set_mark(&socket, MARK_IGNORE_SELF) {
        // SO_MARK needs CAP_NET_ADMIN. Without it the intercept rules
        // cannot have been installed either, so there is no loop to avoid.
        warn!(error = %e, "cannot set fwmark on outbound socket");
    }
    debug!(addr = %sockaddr, "dialing");
    Ok(socket.connect(sockaddr).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_peer_times_out() {
        // 192.0.2.0/24 (TEST-NET-1) never answers; the plan timeout must
        // bound the attempt.
        let plan = DialPlan {
            addresses: vec!["192.0.2.1:443".to_string()],
            transport: Transport::Raw,
            timeout: Duration::from_millis(200),
        };
        let started = std::time::Instant::now();
        let err = dial(&plan).await.unwrap_err();
        assert!(matches!(err, ConduitError::Timeout | ConduitError::Io(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn raw_dial_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let plan = DialPlan {
            addresses: vec![addr.to_string()],
            transport: Transport::Raw,
            timeout: Duration::from_secs(2),
        };
        let (dialed, accepted) = tokio::join!(dial(&plan), listener.accept());
        assert!(dialed.is_ok());
        assert!(accepted.is_ok());
    }
}
