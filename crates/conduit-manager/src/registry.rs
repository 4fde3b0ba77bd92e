//! Fleet registry: which machines hold a live session, and in which
//! roles.
//!
//! A session starts in the inflight table when its hello frame arrives
//! and is promoted to the conduits table by its first report. Re-reports
//! update role flags in place rather than replacing the entry.

use conduit_core::proto::ConduitRecord;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleFlags {
    pub client: bool,
    pub server: bool,
}

struct InflightEntry<S> {
    session: S,
    since: Instant,
}

pub struct ConduitEntry<S> {
    pub session: S,
    pub roles: RoleFlags,
    /// Cluster record; present once the server role reported.
    pub record: Option<ConduitRecord>,
}

/// Session registry keyed by machine id. Generic over the session handle
/// so the state machine is testable without live connections.
pub struct Registry<S> {
    inflight: RwLock<HashMap<String, InflightEntry<S>>>,
    conduits: RwLock<HashMap<String, ConduitEntry<S>>>,
}

impl<S: Clone> Registry<S> {
    pub fn new() -> Self {
        Self {
            inflight: RwLock::new(HashMap::new()),
            conduits: RwLock::new(HashMap::new()),
        }
    }

    /// A session said hello; park it in the inflight table.
    pub async fn begin(&self, machine_id: &str, session: S) {
        debug!(machine_id, "session inflight");
        self.inflight.write().await.insert(
            machine_id.to_string(),
            InflightEntry {
                session,
                since: Instant::now(),
            },
        );
    }

    async fn promote(&self, machine_id: &str) -> Option<S> {
        self.inflight
            .write()
            .await
            .remove(machine_id)
            .map(|entry| {
                debug!(machine_id, waited_ms = entry.since.elapsed().as_millis() as u64, "session promoted");
                entry.session
            })
    }

    /// `report_client`: tag the session as client-role.
    pub async fn promote_client(&self, machine_id: &str, session: S) {
        let promoted = self.promote(machine_id).await;
        let mut conduits = self.conduits.write().await;
        match conduits.get_mut(machine_id) {
            Some(entry) => {
                entry.roles.client = true;
                entry.session = promoted.unwrap_or(session);
            }
            None => {
                info!(machine_id, "client conduit registered");
                conduits.insert(
                    machine_id.to_string(),
                    ConduitEntry {
                        session: promoted.unwrap_or(session),
                        roles: RoleFlags {
                            client: true,
                            server: false,
                        },
                        record: None,
                    },
                );
            }
        }
    }

    /// `report_server`: tag the session as server-role and remember its
    /// cluster record. Returns true when this flipped the server flag on
    /// (the caller emits `ServerOnline`).
    pub async fn promote_server(&self, machine_id: &str, session: S, record: ConduitRecord) -> bool {
        let promoted = self.promote(machine_id).await;
        let mut conduits = self.conduits.write().await;
        match conduits.get_mut(machine_id) {
            Some(entry) => {
                let was_server = entry.roles.server;
                entry.roles.server = true;
                entry.record = Some(record);
                entry.session = promoted.unwrap_or(session);
                !was_server
            }
            None => {
                info!(machine_id, "server conduit registered");
                conduits.insert(
                    machine_id.to_string(),
                    ConduitEntry {
                        session: promoted.unwrap_or(session),
                        roles: RoleFlags {
                            client: false,
                            server: true,
                        },
                        record: Some(record),
                    },
                );
                true
            }
        }
    }

    /// `report_networks`: replace the server's IP list. Returns the
    /// updated record, or None for machines that never reported server.
    pub async fn update_networks(&self, machine_id: &str, ips: Vec<Ipv4Addr>) -> Option<ConduitRecord> {
        let mut conduits = self.conduits.write().await;
        let entry = conduits.get_mut(machine_id)?;
        let record = entry.record.as_mut()?;
        record.ips = ips;
        Some(record.clone())
    }

    /// Session gone: drop it everywhere. Returns the conduit entry so the
    /// caller can emit `ServerOffline` for server-tagged records.
    pub async fn remove(&self, machine_id: &str) -> Option<ConduitEntry<S>> {
        self.inflight.write().await.remove(machine_id);
        let removed = self.conduits.write().await.remove(machine_id);
        if removed.is_some() {
            info!(machine_id, "conduit removed");
        }
        removed
    }

    /// All server-role records, for `pull_cluster`.
    pub async fn cluster(&self) -> Vec<ConduitRecord> {
        self.conduits
            .read()
            .await
            .values()
            .filter(|entry| entry.roles.server)
            .filter_map(|entry| entry.record.clone())
            .collect()
    }

    /// Client-role sessions to fan an event out to, excluding its source.
    pub async fn clients_except(&self, source: &str) -> Vec<(String, S)> {
        self.conduits
            .read()
            .await
            .iter()
            .filter(|(machine_id, entry)| entry.roles.client && machine_id.as_str() != source)
            .map(|(machine_id, entry)| (machine_id.clone(), entry.session.clone()))
            .collect()
    }
}

impl<S: Clone> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}
