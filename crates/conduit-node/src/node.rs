//! Role wiring: build the enabled subsystems in dependency order and tear
//! them down in reverse.
//!
//! Client-role startup order matters: leftover kernel state is cleared,
//! match sets exist before the listener accepts, the listener is bound
//! before the DNAT rules point at it, and static policies are installed
//! before the first accept.

use crate::config::{ClientSection, Config};
use crate::dial::DialPlan;
use crate::intercept::Interceptor;
use crate::repo::{Policy, Repo};
use crate::server::ServerProxy;
use crate::sock;
use crate::syncer::{DownOptions, Syncer, SyncerOptions, UpOptions};
use crate::tables::KernelTables;
use conduit_core::machine;
use conduit_core::netutil::split_host_port;
use conduit_core::{ConduitError, ConduitResult};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Node {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    tables: Option<Arc<KernelTables>>,
    repo: Arc<Repo>,
    client_enabled: bool,
}

impl Node {
    pub async fn start(config: Config) -> ConduitResult<Node> {
        let machine_id = machine::machine_id()?;
        info!(machine_id = %machine_id, "node identity derived");
        match sock::raise_nofile_limit() {
            Ok(limit) => debug!(limit, "nofile limit raised"),
            Err(e) => warn!(error = %e, "cannot raise nofile limit"),
        }

        let repo = Arc::new(Repo::new());
        let (shutdown_tx, _) = broadcast::channel(8);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let dial_timeout = Duration::from_secs(config.client.dial_timeout);

        // The control-plane link comes up first: the server role needs its
        // credentials, the client role its event subscription.
        let syncer = if config.manager.enable {
            let manager = config
                .manager
                .dial
                .clone()
                .ok_or_else(|| ConduitError::Config("manager enabled without dial".to_string()))?;
            let up = match (config.server.enable, &config.server.listen) {
                (true, Some(listen)) => Some(UpOptions {
                    network: listen.network.clone(),
                    addr: listen.addr.clone(),
                    report_interval: Duration::from_secs(config.server.report_interval),
                }),
                _ => None,
            };
            let down = config.client.enable.then(|| DownOptions {
                pull_interval: Duration::from_secs(config.client.pull_interval),
            });
            let opts = SyncerOptions {
                machine_id: machine_id.clone(),
                manager,
                dial_timeout,
                up,
                down,
            };
            Some(Syncer::connect(opts, repo.clone()).await?)
        } else {
            None
        };

        if config.server.enable {
            let listen = config.server.listen.clone().ok_or_else(|| {
                ConduitError::Config("server enabled without listen".to_string())
            })?;
            let material = syncer.as_ref().and_then(|s| s.server_material()).cloned();
            let proxy = ServerProxy::bind(&listen, material.as_ref()).await?;
            tasks.push(tokio::spawn(proxy.run(shutdown_tx.subscribe())));
        }

        let mut tables = None;
        if config.client.enable {
            let listen = config.client.listen.clone().ok_or_else(|| {
                ConduitError::Config("client enabled without listen".to_string())
            })?;
            let (_, listen_port) = split_host_port(&listen.addr)?;
            let manager_addrs = manager_accept_addrs(&config);
            let kernel = Arc::new(KernelTables::new(listen_port, manager_addrs));

            // Crash recovery: clear whatever a previous instance left.
            kernel.clear_legacy();
            repo.sets.fini();
            repo.sets.init()?;

            let listener = TcpListener::bind(&listen.addr).await?;
            kernel.setup()?;
            install_static_policies(&config.client, &repo, dial_timeout)?;

            tasks.push(tokio::spawn(
                Interceptor::new(listener, repo.clone()).run(shutdown_tx.subscribe()),
            ));
            tasks.push(tokio::spawn(kernel.clone().run_heal(
                Duration::from_secs(config.client.check_time),
                shutdown_tx.subscribe(),
            )));
            tables = Some(kernel);
        }

        if let Some(syncer) = syncer {
            tasks.push(tokio::spawn(syncer.run(shutdown_tx.subscribe())));
        }

        Ok(Node {
            shutdown_tx,
            tasks,
            tables,
            repo,
            client_enabled: config.client.enable,
        })
    }

    /// Stop accepting, drain relay tasks, then undo the kernel plane.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        if let Some(tables) = self.tables {
            tables.teardown();
        }
        if self.client_enabled {
            self.repo.sets.fini();
        }
    }
}

/// Manager addresses that must bypass interception.
fn manager_accept_addrs(config: &Config) -> Vec<(String, u16)> {
    let Some(dial) = config.manager.enable.then(|| config.manager.dial.as_ref()).flatten()
    else {
        return Vec::new();
    };
    dial.addresses
        .iter()
        .filter_map(|addr| {
            let (host, port) = split_host_port(addr).ok()?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port))
        })
        .collect()
}

/// Resolve the forward table into policy rows and match-set entries.
/// Exactly one row and one set entry per entry; shapes were validated at
/// config load.
fn install_static_policies(
    client: &ClientSection,
    repo: &Repo,
    dial_timeout: Duration,
) -> ConduitResult<()> {
    let mut plans: HashMap<u32, Arc<DialPlan>> = HashMap::new();
    for peer in &client.peers {
        plans.insert(
            peer.index,
            Arc::new(DialPlan::from_config(&peer.dial, dial_timeout)?),
        );
    }

    for entry in &client.forward_table {
        let (host, port) = split_host_port(&entry.dst)?;
        let plan = plans
            .get(&entry.peer_index)
            .ok_or_else(|| {
                ConduitError::Config(format!("peer index not found: {}", entry.peer_index))
            })?
            .clone();
        let policy = Policy {
            peer_dial: plan,
            dst_as: entry.dst_as.clone(),
        };
        if host.is_empty() {
            repo.table.with_write(|maps| maps.add_port(port, policy));
            repo.sets.add_port(port)?;
        } else {
            let ip: Ipv4Addr = host
                .parse()
                .map_err(|_| ConduitError::Config(format!("illegal forward dst {:?}", entry.dst)))?;
            repo.table
                .with_write(|maps| maps.add_ip_port(format!("{host}:{port}"), policy));
            repo.sets.add_ip_port(ip, port)?;
        }
        debug!(dst = %entry.dst, peer = entry.peer_index, "static policy installed");
    }
    Ok(())
}
