//! The conduit manager service: RPC sessions from the fleet, role
//! registration, cluster queries, and event fan-out.
//!
//! Handlers run per-session; cluster events (server online/offline,
//! network change) drain through one bounded channel so a slow client can
//! never back-pressure a handler. On overflow events are dropped;
//! clients reconverge at their next `pull_cluster`.

use crate::cms::Cms;
use crate::registry::Registry;
use conduit_core::netcfg::ListenConfig;
use conduit_core::proto::*;
use conduit_core::rpc::{IncomingRequest, RpcSession, SessionStream};
use conduit_core::{tlsutil, ConduitError, ConduitResult};
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const EVENT_QUEUE: usize = 1024;

/// Cluster events fanned out to client-role sessions.
#[derive(Debug, Clone)]
pub enum Event {
    ServerOnline(ConduitRecord),
    ServerOffline(String),
    NetworksChanged {
        machine_id: String,
        ips: Vec<Ipv4Addr>,
    },
}

impl Event {
    /// The machine the event originated from; it is excluded from the
    /// fan-out.
    fn source(&self) -> &str {
        match self {
            Event::ServerOnline(record) => &record.machine_id,
            Event::ServerOffline(machine_id) => machine_id,
            Event::NetworksChanged { machine_id, .. } => machine_id,
        }
    }

    fn into_call(self) -> ConduitResult<(&'static str, serde_json::Value)> {
        Ok(match self {
            Event::ServerOnline(conduit) => (
                RPC_SYNC_CONDUIT_ONLINE,
                serde_json::to_value(ConduitOnlineRequest { conduit })?,
            ),
            Event::ServerOffline(machine_id) => (
                RPC_SYNC_CONDUIT_OFFLINE,
                serde_json::to_value(ConduitOfflineRequest { machine_id })?,
            ),
            Event::NetworksChanged { machine_id, ips } => (
                RPC_SYNC_CONDUIT_NETWORKS_CHANGED,
                serde_json::to_value(ConduitNetworksChangedRequest { machine_id, ips })?,
            ),
        })
    }
}

pub struct ManagerService {
    registry: Arc<Registry<RpcSession>>,
    cms: Arc<Cms>,
    events: mpsc::Sender<Event>,
}

impl ManagerService {
    /// Build the service and start its event fan-out loop.
    pub fn new(cms: Arc<Cms>) -> Arc<ManagerService> {
        let registry = Arc::new(Registry::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(event_loop(registry.clone(), events_rx));
        Arc::new(ManagerService {
            registry,
            cms,
            events: events_tx,
        })
    }

    /// Accept RPC sessions until shutdown.
    pub async fn run(
        self: Arc<Self>,
        listen: ListenConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> ConduitResult<()> {
        let listener = TcpListener::bind(&listen.addr).await?;
        let acceptor = match &listen.tls {
            Some(tls) if tls.enable => Some(TlsAcceptor::from(Arc::new(
                tlsutil::server_config_from_files(tls)?,
            ))),
            _ => None,
        };
        info!(addr = %listen.addr, tls = acceptor.is_some(), "conduit manager listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "session connected");
                    let service = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let result = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => service.handle_session(tls).await,
                                Err(e) => Err(ConduitError::Tls(e.to_string())),
                            },
                            None => service.handle_session(stream).await,
                        };
                        if let Err(e) = result {
                            debug!(%peer, error = %e, "session ended with error");
                        }
                    });
                }
            }
        }
        info!("conduit manager stopped");
        Ok(())
    }

    /// Serve one node session to completion. The hello frame's metadata is
    /// the authoritative machine id for everything the session reports.
    pub async fn handle_session<S>(self: Arc<Self>, stream: S) -> ConduitResult<()>
    where
        S: SessionStream + 'static,
    {
        let (session, machine_id, mut incoming) = RpcSession::server(stream).await?;
        self.registry.begin(&machine_id, session.clone()).await;

        while let Some(request) = incoming.recv().await {
            self.dispatch(&machine_id, &session, request).await;
        }

        if let Some(entry) = self.registry.remove(&machine_id).await {
            if entry.roles.server {
                self.emit(Event::ServerOffline(machine_id.clone()));
            }
        }
        debug!(machine_id = %machine_id, "session closed");
        Ok(())
    }

    async fn dispatch(&self, machine_id: &str, session: &RpcSession, request: IncomingRequest) {
        match request.method.clone().as_str() {
            RPC_REPORT_CLIENT => {
                let result = self.cms.client_material().map(|tls| ReportClientResponse { tls });
                if result.is_ok() {
                    self.registry.promote_client(machine_id, session.clone()).await;
                }
                request.respond(result);
            }
            RPC_REPORT_SERVER => {
                let parsed = request.parse::<ReportServerRequest>();
                match parsed {
                    Ok(report) => {
                        let record = ConduitRecord {
                            machine_id: machine_id.to_string(),
                            network: report.network,
                            addr: report.addr,
                            ips: report.ips,
                        };
                        match self.cms.server_material(&record.ips) {
                            Ok(tls) => {
                                let online = self
                                    .registry
                                    .promote_server(machine_id, session.clone(), record.clone())
                                    .await;
                                if online {
                                    self.emit(Event::ServerOnline(record));
                                }
                                request.respond(Ok(ReportServerResponse { tls }));
                            }
                            Err(e) => {
                                error!(machine_id, error = %e, "server certificate issuance failed");
                                request.respond::<ReportServerResponse>(Err(e));
                            }
                        }
                    }
                    Err(e) => request.respond::<ReportServerResponse>(Err(e)),
                }
            }
            RPC_REPORT_NETWORKS => match request.parse::<ReportNetworksRequest>() {
                Ok(report) => {
                    if let Some(record) = self
                        .registry
                        .update_networks(machine_id, report.ips)
                        .await
                    {
                        self.emit(Event::NetworksChanged {
                            machine_id: machine_id.to_string(),
                            ips: record.ips,
                        });
                    }
                    request.respond(Ok(json!({})));
                }
                Err(e) => request.respond::<serde_json::Value>(Err(e)),
            },
            RPC_PULL_CLUSTER => {
                let cluster = self.registry.cluster().await;
                request.respond(Ok(PullClusterResponse { cluster }));
            }
            other => {
                debug!(machine_id, method = other, "unknown rpc method");
                request.respond::<serde_json::Value>(Err(ConduitError::RpcMethodNotFound(
                    other.to_string(),
                )));
            }
        }
    }

    fn emit(&self, event: Event) {
        if let Err(e) = self.events.try_send(event) {
            // Bounded on purpose: drop and let clients reconverge.
            warn!(error = %e, "event queue full, event dropped");
        }
    }
}

/// Drain the event channel and fan each event out to every client-role
/// session except its source. Deliveries run concurrently under the RPC
/// call timeout, so one unresponsive client cannot stall the loop.
async fn event_loop(registry: Arc<Registry<RpcSession>>, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        let source = event.source().to_string();
        let (method, payload) = match event.into_call() {
            Ok(call) => call,
            Err(e) => {
                error!(error = %e, "unserializable event");
                continue;
            }
        };
        for (machine_id, session) in registry.clients_except(&source).await {
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = session.call::<_, serde_json::Value>(method, &payload).await {
                    debug!(machine_id = %machine_id, method, error = %e, "event delivery failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cms::{CertProfile, CmsConfig};
    use crate::store::Store;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_cms(dir: &std::path::Path) -> Arc<Cms> {
        let store = Arc::new(Store::open(dir.join("store.json")).unwrap());
        let config = CmsConfig {
            ca: CertProfile {
                not_after: "1,0,0".to_string(),
                common_name: "Conduit CA".to_string(),
                organization: "Conduit".to_string(),
            },
            cert: CertProfile {
                not_after: "0,1,0".to_string(),
                common_name: "Conduit".to_string(),
                organization: "Conduit".to_string(),
            },
            renew_before: Duration::from_secs(7 * 24 * 3600),
        };
        Arc::new(Cms::init(store, config).unwrap())
    }

    async fn recv_event(
        incoming: &mut mpsc::UnboundedReceiver<IncomingRequest>,
    ) -> IncomingRequest {
        timeout(Duration::from_secs(5), incoming.recv())
            .await
            .expect("event timed out")
            .expect("session closed")
    }

    #[tokio::test]
    async fn report_pull_and_offline_flow() {
        let dir = tempfile::tempdir().unwrap();
        let service = ManagerService::new(test_cms(dir.path()));

        // Client-role node comes up first.
        let (client_io, client_srv_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(service.clone().handle_session(client_srv_io));
        let (client_session, mut client_incoming) = RpcSession::client(client_io, "machine-b");
        let issued: ReportClientResponse = client_session
            .call(RPC_REPORT_CLIENT, &ReportClientRequest { machine_id: "machine-b".into() })
            .await
            .unwrap();
        assert!(!issued.tls.ca.is_empty());
        assert!(!issued.tls.key.is_empty());

        // Server-role node reports: the client must hear about it.
        let (server_io, server_srv_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(service.clone().handle_session(server_srv_io));
        let (server_session, _server_incoming) = RpcSession::client(server_io, "machine-a");
        let issued: ReportServerResponse = server_session
            .call(
                RPC_REPORT_SERVER,
                &ReportServerRequest {
                    machine_id: "machine-a".into(),
                    network: "tcp4".into(),
                    addr: "0.0.0.0:443".into(),
                    ips: vec!["10.0.0.2".parse().unwrap()],
                },
            )
            .await
            .unwrap();
        assert!(!issued.tls.cert.is_empty());

        let online = recv_event(&mut client_incoming).await;
        assert_eq!(online.method, RPC_SYNC_CONDUIT_ONLINE);
        let online_req: ConduitOnlineRequest = online.parse().unwrap();
        assert_eq!(online_req.conduit.machine_id, "machine-a");
        online.respond(Ok(json!({})));

        // The cluster view contains exactly the server conduit.
        let cluster: PullClusterResponse = client_session
            .call(RPC_PULL_CLUSTER, &PullClusterRequest { machine_id: "machine-b".into() })
            .await
            .unwrap();
        assert_eq!(cluster.cluster.len(), 1);
        assert_eq!(cluster.cluster[0].machine_id, "machine-a");

        // Dropping the server session propagates offline to the client.
        drop(server_session);
        let offline = recv_event(&mut client_incoming).await;
        assert_eq!(offline.method, RPC_SYNC_CONDUIT_OFFLINE);
        let offline_req: ConduitOfflineRequest = offline.parse().unwrap();
        assert_eq!(offline_req.machine_id, "machine-a");
        offline.respond(Ok(json!({})));

        let cluster: PullClusterResponse = client_session
            .call(RPC_PULL_CLUSTER, &PullClusterRequest { machine_id: "machine-b".into() })
            .await
            .unwrap();
        assert!(cluster.cluster.is_empty());
    }

    #[tokio::test]
    async fn network_change_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let service = ManagerService::new(test_cms(dir.path()));

        let (client_io, client_srv_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(service.clone().handle_session(client_srv_io));
        let (client_session, mut client_incoming) = RpcSession::client(client_io, "machine-b");
        let _: ReportClientResponse = client_session
            .call(RPC_REPORT_CLIENT, &ReportClientRequest { machine_id: "machine-b".into() })
            .await
            .unwrap();

        let (server_io, server_srv_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(service.clone().handle_session(server_srv_io));
        let (server_session, _keep) = RpcSession::client(server_io, "machine-a");
        let _: ReportServerResponse = server_session
            .call(
                RPC_REPORT_SERVER,
                &ReportServerRequest {
                    machine_id: "machine-a".into(),
                    network: "tcp4".into(),
                    addr: "0.0.0.0:443".into(),
                    ips: vec!["10.0.0.2".parse().unwrap()],
                },
            )
            .await
            .unwrap();
        recv_event(&mut client_incoming).await.respond(Ok(json!({})));

        let _: serde_json::Value = server_session
            .call(
                RPC_REPORT_NETWORKS,
                &ReportNetworksRequest {
                    machine_id: "machine-a".into(),
                    ips: vec!["10.0.0.2".parse().unwrap(), "10.0.0.7".parse().unwrap()],
                },
            )
            .await
            .unwrap();

        let changed = recv_event(&mut client_incoming).await;
        assert_eq!(changed.method, RPC_SYNC_CONDUIT_NETWORKS_CHANGED);
        let changed_req: ConduitNetworksChangedRequest = changed.parse().unwrap();
        assert_eq!(changed_req.machine_id, "machine-a");
        assert_eq!(changed_req.ips.len(), 2);
        changed.respond(Ok(json!({})));
    }
}
