//! Cluster synchronization: the long-lived RPC link to the manager.
//!
//! Two combinable modes. **Up** (server role): report this conduit and its
//! networks so clients can find it. **Down** (client role): receive
//! credentials, ingest online/offline/network-change events, and keep the
//! policy table and IP match set current.
//!
//! Down-subscription handlers run serially from the session's incoming
//! queue, so two events for the same machine apply in arrival order.

use crate::dial::{self, DialPlan};
use crate::repo::{Policy, Repo};
use conduit_core::netcfg::DialConfig;
use conduit_core::netutil::{list_ipv4, split_host_port};
use conduit_core::proto::*;
use conduit_core::rpc::{IncomingRequest, RpcSession};
use conduit_core::{ConduitError, ConduitResult};
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Server-role advertisement.
pub struct UpOptions {
    pub network: String,
    pub addr: String,
    pub report_interval: Duration,
}

/// Client-role subscription.
pub struct DownOptions {
    pub pull_interval: Duration,
}

pub struct SyncerOptions {
    pub machine_id: String,
    pub manager: DialConfig,
    pub dial_timeout: Duration,
    pub up: Option<UpOptions>,
    pub down: Option<DownOptions>,
}

pub struct Syncer {
    opts: SyncerOptions,
    repo: Arc<Repo>,
    session: RpcSession,
    incoming: mpsc::UnboundedReceiver<IncomingRequest>,
    /// Last seen cluster view, one record per machine id.
    cache: Vec<ConduitRecord>,
    /// Credentials for dialing dynamically learned peers (down mode).
    client_material: Option<TlsMaterial>,
    /// Credentials for the server listener (up mode).
    server_material: Option<TlsMaterial>,
}

impl Syncer {
    /// Dial the manager, announce our machine id, and perform the startup
    /// reports for the enabled modes.
    pub async fn connect(opts: SyncerOptions, repo: Arc<Repo>) -> ConduitResult<Syncer> {
        let (session, incoming) = Self::establish(&opts).await?;
        let mut syncer = Syncer {
            opts,
            repo,
            session,
            incoming,
            cache: Vec::new(),
            client_material: None,
            server_material: None,
        };
        syncer.initial_reports().await?;
        Ok(syncer)
    }

    async fn establish(
        opts: &SyncerOptions,
    ) -> ConduitResult<(RpcSession, mpsc::UnboundedReceiver<IncomingRequest>)> {
        let plan = DialPlan::from_config(&opts.manager, opts.dial_timeout)?;
        let stream = dial::dial(&plan).await?;
        Ok(RpcSession::client(stream, &opts.machine_id))
    }

    async fn initial_reports(&mut self) -> ConduitResult<()> {
        if let Some(up) = &self.opts.up {
            let request = ReportServerRequest {
                machine_id: self.opts.machine_id.clone(),
                network: up.network.clone(),
                addr: up.addr.clone(),
                ips: list_ipv4()?,
            };
            let response: ReportServerResponse =
                self.session.call(RPC_REPORT_SERVER, &request).await?;
            self.server_material = Some(response.tls);
            info!("server role reported to manager");
        }
        if self.opts.down.is_some() {
            let request = ReportClientRequest {
                machine_id: self.opts.machine_id.clone(),
            };
            let response: ReportClientResponse =
                self.session.call(RPC_REPORT_CLIENT, &request).await?;
            self.client_material = Some(response.tls);
            info!("client role reported to manager");
        }
        Ok(())
    }

    /// TLS material issued for the server listener, available after
    /// [`Syncer::connect`] in up mode.
    pub fn server_material(&self) -> Option<&TlsMaterial> {
        self.server_material.as_ref()
    }

    /// Drive reports, pulls and down-subscription events until shutdown.
    /// A dropped session reconnects with jittered exponential backoff;
    /// static policies keep working during the outage.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let report_interval = self
            .opts
            .up
            .as_ref()
            .map(|up| up.report_interval)
            .unwrap_or(Duration::from_secs(3600));
        let pull_interval = self
            .opts
            .down
            .as_ref()
            .map(|down| down.pull_interval)
            .unwrap_or(Duration::from_secs(3600));
        let mut report_tick = tokio::time::interval(report_interval);
        let mut pull_tick = tokio::time::interval(pull_interval);
        report_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        pull_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = report_tick.tick(), if self.opts.up.is_some() => {
                    if let Err(e) = self.report_networks().await {
                        error!(error = %e, "report networks failed");
                    }
                }
                _ = pull_tick.tick(), if self.opts.down.is_some() => {
                    if let Err(e) = self.pull_cluster().await {
                        error!(error = %e, "pull cluster failed");
                    }
                }
                request = self.incoming.recv() => {
                    match request {
                        Some(request) => self.handle_request(request),
                        None => {
                            warn!("manager session dropped, reconnecting");
                            if self.reconnect(&mut shutdown).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("syncer stopped");
    }

    /// Re-establish the session. Returns true if shutdown arrived first.
    async fn reconnect(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            let delay = jitter(backoff);
            tokio::select! {
                _ = shutdown.recv() => return true,
                _ = tokio::time::sleep(delay) => {}
            }
            match Self::establish(&self.opts).await {
                Ok((session, incoming)) => {
                    self.session = session;
                    self.incoming = incoming;
                    match self.initial_reports().await {
                        Ok(()) => {
                            info!("manager session re-established");
                            if self.opts.down.is_some() {
                                if let Err(e) = self.pull_cluster().await {
                                    warn!(error = %e, "post-reconnect pull failed");
                                }
                            }
                            return false;
                        }
                        Err(e) => warn!(error = %e, "re-report failed"),
                    }
                }
                Err(e) => debug!(error = %e, "reconnect attempt failed"),
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    // ── Up mode ──────────────────────────────────────────────────────

    async fn report_networks(&self) -> ConduitResult<()> {
        // The machine id always comes from our derived identity, never
        // from cached RPC state.
        let request = ReportNetworksRequest {
            machine_id: self.opts.machine_id.clone(),
            ips: list_ipv4()?,
        };
        let _: serde_json::Value = self.session.call(RPC_REPORT_NETWORKS, &request).await?;
        Ok(())
    }

    // ── Down mode ────────────────────────────────────────────────────

    fn handle_request(&mut self, request: IncomingRequest) {
        match request.method.clone().as_str() {
            RPC_SYNC_CONDUIT_ONLINE => {
                let result = request
                    .parse::<ConduitOnlineRequest>()
                    .and_then(|req| self.conduit_online(req.conduit));
                request.respond(result.map(|_| json!({})));
            }
            RPC_SYNC_CONDUIT_OFFLINE => {
                let result = request
                    .parse::<ConduitOfflineRequest>()
                    .map(|req| self.conduit_offline(&req.machine_id));
                request.respond(result.map(|_| json!({})));
            }
            RPC_SYNC_CONDUIT_NETWORKS_CHANGED => {
                let result = request
                    .parse::<ConduitNetworksChangedRequest>()
                    .and_then(|req| self.conduit_networks_changed(&req.machine_id, req.ips));
                request.respond(result.map(|_| json!({})));
            }
            other => {
                debug!(method = other, "unhandled rpc method");
                request.respond::<serde_json::Value>(Err(ConduitError::RpcMethodNotFound(
                    other.to_string(),
                )));
            }
        }
    }

    /// Upsert by machine id: equal records are a no-op; changed records
    /// are remove-then-add.
    fn conduit_online(&mut self, record: ConduitRecord) -> ConduitResult<()> {
        let plan = self.record_plan(&record)?;
        match self
            .cache
            .iter()
            .position(|old| old.machine_id == record.machine_id)
        {
            Some(index) => {
                if self.cache[index].same(&record) {
                    return Ok(());
                }
                let old = self.cache[index].clone();
                info!(machine_id = %record.machine_id, "conduit changed");
                self.remove_ips(&old.ips);
                self.install_ips(&record.ips, &plan);
                self.cache[index] = record;
            }
            None => {
                info!(machine_id = %record.machine_id, ips = record.ips.len(), "conduit online");
                self.install_ips(&record.ips, &plan);
                self.cache.push(record);
            }
        }
        Ok(())
    }

    fn conduit_offline(&mut self, machine_id: &str) {
        let Some(index) = self
            .cache
            .iter()
            .position(|old| old.machine_id == machine_id)
        else {
            debug!(machine_id, "offline for unknown conduit");
            return;
        };
        let old = self.cache.remove(index);
        info!(machine_id, ips = old.ips.len(), "conduit offline");
        self.remove_ips(&old.ips);
    }

    fn conduit_networks_changed(
        &mut self,
        machine_id: &str,
        ips: Vec<Ipv4Addr>,
    ) -> ConduitResult<()> {
        let Some(index) = self
            .cache
            .iter()
            .position(|old| old.machine_id == machine_id)
        else {
            debug!(machine_id, "network change for unknown conduit");
            return Ok(());
        };
        let mut record = self.cache[index].clone();
        let (removes, adds) = diff_ips(&record.ips, &ips);
        info!(machine_id, removed = removes.len(), added = adds.len(), "conduit networks changed");
        record.ips = ips;
        let plan = self.record_plan(&record)?;
        self.remove_ips(&removes);
        self.install_ips(&adds, &plan);
        self.cache[index] = record;
        Ok(())
    }

    async fn pull_cluster(&mut self) -> ConduitResult<()> {
        let request = PullClusterRequest {
            machine_id: self.opts.machine_id.clone(),
        };
        let response: PullClusterResponse = self.session.call(RPC_PULL_CLUSTER, &request).await?;
        self.apply_cluster(response.cluster)
    }

    /// Apply a full cluster view as a delta against the cache, under one
    /// repository write lock so readers see a consistent snapshot.
    fn apply_cluster(&mut self, cluster: Vec<ConduitRecord>) -> ConduitResult<()> {
        let (removes, adds) = diff_cluster(&self.cache, &cluster);
        if removes.is_empty() && adds.is_empty() {
            self.cache = cluster;
            return Ok(());
        }

        let mut planned = Vec::with_capacity(adds.len());
        for record in &adds {
            planned.push((record.ips.clone(), self.record_plan(record)?));
        }

        let sets = &self.repo.sets;
        self.repo.table.with_write(|maps| {
            for record in &removes {
                for ip in &record.ips {
                    maps.del_ip(&ip.to_string());
                    let _ = sets.del_ip(*ip);
                }
            }
            for (ips, plan) in &planned {
                for ip in ips {
                    maps.add_ip(
                        ip.to_string(),
                        Policy {
                            peer_dial: plan.clone(),
                            dst_as: None,
                        },
                    );
                    let _ = sets.add_ip(*ip);
                }
            }
        });
        debug!(removed = removes.len(), added = adds.len(), "cluster delta applied");
        self.cache = cluster;
        Ok(())
    }

    /// Policy row + match-set entry per IP. The two sides are not
    /// transactional; a failed set write is logged and the next full pull
    /// reconverges.
    fn install_ips(&self, ips: &[Ipv4Addr], plan: &Arc<DialPlan>) {
        for ip in ips {
            self.repo.table.with_write(|maps| {
                maps.add_ip(
                    ip.to_string(),
                    Policy {
                        peer_dial: plan.clone(),
                        dst_as: None,
                    },
                )
            });
            let _ = self.repo.sets.add_ip(*ip);
        }
    }

    fn remove_ips(&self, ips: &[Ipv4Addr]) {
        for ip in ips {
            self.repo.table.with_write(|maps| maps.del_ip(&ip.to_string()));
            let _ = self.repo.sets.del_ip(*ip);
        }
    }

    /// The mtls dial plan for one learned conduit.
    fn record_plan(&self, record: &ConduitRecord) -> ConduitResult<Arc<DialPlan>> {
        let material = self.client_material.as_ref().ok_or_else(|| {
            ConduitError::Other("no client credentials for learned peer".to_string())
        })?;
        let addrs = record_addrs(record)?;
        Ok(Arc::new(DialPlan::mtls_from_material(
            addrs,
            material,
            self.opts.dial_timeout,
        )?))
    }
}

/// Dialable addresses of a conduit record: each advertised IP combined
/// with the port of its listen addr.
fn record_addrs(record: &ConduitRecord) -> ConduitResult<Vec<String>> {
    let (_host, port) = split_host_port(&record.addr)?;
    Ok(record
        .ips
        .iter()
        .map(|ip| format!("{ip}:{port}"))
        .collect())
}

/// Set difference in both directions: (in old only, in new only).
fn diff_ips(old: &[Ipv4Addr], new: &[Ipv4Addr]) -> (Vec<Ipv4Addr>, Vec<Ipv4Addr>) {
    let removes = old.iter().filter(|ip| !new.contains(ip)).copied().collect();
    let adds = new.iter().filter(|ip| !old.contains(ip)).copied().collect();
    (removes, adds)
}

/// Cluster delta keyed by machine id. A record whose fingerprint changed
/// counts as remove-then-add.
fn diff_cluster(
    old: &[ConduitRecord],
    new: &[ConduitRecord],
) -> (Vec<ConduitRecord>, Vec<ConduitRecord>) {
    let mut removes = Vec::new();
    let mut adds = Vec::new();
    let mut kept = std::collections::HashSet::new();

    for oldone in old {
        match new.iter().find(|n| n.machine_id == oldone.machine_id) {
            Some(newone) if oldone.same(newone) => {
                kept.insert(oldone.machine_id.clone());
            }
            Some(_) | None => removes.push(oldone.clone()),
        }
    }
    for newone in new {
        if !kept.contains(&newone.machine_id) {
            adds.push(newone.clone());
        }
    }
    (removes, adds)
}

fn jitter(base: Duration) -> Duration {
    base.mul_f64(0.5 + rand::random::<f64>() * 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(machine_id: &str, addr: &str, ips: &[&str]) -> ConduitRecord {
        ConduitRecord {
            machine_id: machine_id.to_string(),
            network: "tcp4".to_string(),
            addr: addr.to_string(),
            ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn identical_cluster_is_a_no_op() {
        let view = vec![
            record("m1", "0.0.0.0:443", &["10.0.0.2"]),
            record("m2", "0.0.0.0:443", &["10.0.0.3", "10.0.0.4"]),
        ];
        let (removes, adds) = diff_cluster(&view, &view.clone());
        assert!(removes.is_empty());
        assert!(adds.is_empty());
    }

    #[test]
    fn changed_fingerprint_is_remove_then_add() {
        let old = vec![record("m1", "0.0.0.0:443", &["10.0.0.2"])];
        let new = vec![record("m1", "0.0.0.0:443", &["10.0.0.2", "10.0.0.5"])];
        let (removes, adds) = diff_cluster(&old, &new);
        assert_eq!(removes.len(), 1);
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].ips.len(), 2);
    }

    #[test]
    fn vanished_machine_is_removed() {
        let old = vec![
            record("m1", "0.0.0.0:443", &["10.0.0.2"]),
            record("m2", "0.0.0.0:443", &["10.0.0.3"]),
        ];
        let new = vec![record("m1", "0.0.0.0:443", &["10.0.0.2"])];
        let (removes, adds) = diff_cluster(&old, &new);
        assert_eq!(removes.len(), 1);
        assert_eq!(removes[0].machine_id, "m2");
        assert!(adds.is_empty());
    }

    #[test]
    fn ip_diff_is_set_wise() {
        let old = ["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let new = ["10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap()];
        let (removes, adds) = diff_ips(&old, &new);
        assert_eq!(removes, vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(adds, vec!["10.0.0.3".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn record_addrs_take_port_from_listen_addr() {
        let rec = record("m1", "0.0.0.0:8443", &["10.0.0.2", "10.0.0.3"]);
        let addrs = record_addrs(&rec).unwrap();
        assert_eq!(addrs, vec!["10.0.0.2:8443", "10.0.0.3:8443"]);
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        for _ in 0..100 {
            let d = jitter(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(5));
            assert!(d <= Duration::from_secs(10));
        }
    }
}
