//! In-memory forwarding policy table.
//!
//! Three independent keyspaces behind one reader/writer lock. Precedence
//! lives in the combined getter, not in the schema: ip:port beats port
//! beats ip.

use crate::dial::DialPlan;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A resolved forwarding decision: which peer carries the connection and
/// where the far side should deliver it.
#[derive(Clone)]
pub struct Policy {
    pub peer_dial: Arc<DialPlan>,
    /// Delivery override; `None`/empty keeps the original destination.
    pub dst_as: Option<String>,
}

#[derive(Default)]
pub struct PolicyMaps {
    by_ip: HashMap<String, Policy>,
    by_port: HashMap<u16, Policy>,
    by_ip_port: HashMap<String, Policy>,
}

impl PolicyMaps {
    pub fn add_ip(&mut self, ip: String, policy: Policy) {
        self.by_ip.insert(ip, policy);
    }

    pub fn del_ip(&mut self, ip: &str) {
        self.by_ip.remove(ip);
    }

    pub fn add_port(&mut self, port: u16, policy: Policy) {
        self.by_port.insert(port, policy);
    }

    pub fn del_port(&mut self, port: u16) {
        self.by_port.remove(&port);
    }

    pub fn add_ip_port(&mut self, ip_port: String, policy: Policy) {
        self.by_ip_port.insert(ip_port, policy);
    }

    pub fn del_ip_port(&mut self, ip_port: &str) {
        self.by_ip_port.remove(ip_port);
    }

    pub fn get_ip(&self, ip: &str) -> Option<Policy> {
        self.by_ip.get(ip).cloned()
    }

    pub fn get_port(&self, port: u16) -> Option<Policy> {
        self.by_port.get(&port).cloned()
    }

    pub fn get_ip_port(&self, ip_port: &str) -> Option<Policy> {
        self.by_ip_port.get(ip_port).cloned()
    }

    /// Combined-precedence lookup: first ip:port, then port, then ip.
    pub fn get(&self, ip_port: &str, port: u16, ip: &str) -> Option<Policy> {
        if let Some(policy) = self.by_ip_port.get(ip_port) {
            return Some(policy.clone());
        }
        if let Some(policy) = self.by_port.get(&port) {
            return Some(policy.clone());
        }
        self.by_ip.get(ip).cloned()
    }
}

/// The lock-guarded policy table shared by the intercept listener (reads)
/// and the syncer (writes).
#[derive(Default)]
pub struct PolicyTable {
    inner: RwLock<PolicyMaps>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` under the read lock.
    pub fn with_read<R>(&self, f: impl FnOnce(&PolicyMaps) -> R) -> R {
        f(&self.inner.read().expect("policy lock poisoned"))
    }

    /// Run `f` under the write lock. Cluster deltas apply inside one call
    /// so readers observe a consistent snapshot.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut PolicyMaps) -> R) -> R {
        f(&mut self.inner.write().expect("policy lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dial::Transport;
    use std::time::Duration;

    fn plan(tag: &str) -> Arc<DialPlan> {
        Arc::new(DialPlan {
            addresses: vec![format!("{tag}:443")],
            transport: Transport::Raw,
            timeout: Duration::from_secs(10),
        })
    }

    fn policy(tag: &str) -> Policy {
        Policy {
            peer_dial: plan(tag),
            dst_as: None,
        }
    }

    fn first_addr(policy: &Policy) -> &str {
        &policy.peer_dial.addresses[0]
    }

    #[test]
    fn precedence_ip_port_then_port_then_ip() {
        let table = PolicyTable::new();
        table.with_write(|maps| {
            maps.add_ip("10.0.0.1".to_string(), policy("by-ip"));
            maps.add_port(9092, policy("by-port"));
            maps.add_ip_port("10.0.0.1:9092".to_string(), policy("by-ipport"));
        });

        table.with_read(|maps| {
            let hit = maps.get("10.0.0.1:9092", 9092, "10.0.0.1").unwrap();
            assert_eq!(first_addr(&hit), "by-ipport:443");

            // A different IP on the same port falls through to the port row.
            let hit = maps.get("10.0.0.2:9092", 9092, "10.0.0.2").unwrap();
            assert_eq!(first_addr(&hit), "by-port:443");

            // A different port on a known IP falls through to the ip row.
            let hit = maps.get("10.0.0.1:8080", 8080, "10.0.0.1").unwrap();
            assert_eq!(first_addr(&hit), "by-ip:443");

            assert!(maps.get("10.9.9.9:1", 1, "10.9.9.9").is_none());
        });
    }

    #[test]
    fn port_only_entry_matches_any_ip() {
        let table = PolicyTable::new();
        table.with_write(|maps| maps.add_port(9092, policy("any-ip")));
        table.with_read(|maps| {
            assert!(maps.get("172.16.0.1:9092", 9092, "172.16.0.1").is_some());
            assert!(maps.get("10.0.0.1:9092", 9092, "10.0.0.1").is_some());
        });
    }

    #[test]
    fn delete_removes_only_its_keyspace() {
        let table = PolicyTable::new();
        table.with_write(|maps| {
            maps.add_ip("10.0.0.1".to_string(), policy("a"));
            maps.add_port(80, policy("b"));
            maps.del_ip("10.0.0.1");
        });
        table.with_read(|maps| {
            assert!(maps.get_ip("10.0.0.1").is_none());
            assert!(maps.get_port(80).is_some());
        });
    }
}
