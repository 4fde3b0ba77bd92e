//! Control-plane RPC surface shared by nodes and the manager.
//!
//! All payloads are plain JSON objects; the method strings below are the
//! wire-visible RPC names.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

pub const RPC_REPORT_SERVER: &str = "report_server";
pub const RPC_REPORT_CLIENT: &str = "report_client";
pub const RPC_REPORT_NETWORKS: &str = "report_networks";
pub const RPC_PULL_CLUSTER: &str = "pull_cluster";
pub const RPC_SYNC_CONDUIT_ONLINE: &str = "sync_conduit_online";
pub const RPC_SYNC_CONDUIT_OFFLINE: &str = "sync_conduit_offline";
pub const RPC_SYNC_CONDUIT_NETWORKS_CHANGED: &str = "sync_conduit_networks_changed";

/// DER-encoded identity material issued by the manager.
///
/// `ca` and `cert` are DER certificates; `key` is a PKCS#1 DER RSA private
/// key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// One reachable server-role conduit as seen by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitRecord {
    #[serde(rename = "machineID")]
    pub machine_id: String,
    pub network: String,
    pub addr: String,
    pub ips: Vec<Ipv4Addr>,
}

impl ConduitRecord {
    /// Record equality: identical machine id, network and addr, and
    /// set-equal ips (order and duplicates do not matter).
    pub fn same(&self, other: &ConduitRecord) -> bool {
        if self.machine_id != other.machine_id
            || self.network != other.network
            || self.addr != other.addr
        {
            return false;
        }
        let lhs: HashSet<_> = self.ips.iter().collect();
        let rhs: HashSet<_> = other.ips.iter().collect();
        lhs == rhs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportServerRequest {
    #[serde(rename = "machineID")]
    pub machine_id: String,
    pub network: String,
    pub addr: String,
    pub ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportServerResponse {
    pub tls: TlsMaterial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportClientRequest {
    #[serde(rename = "machineID")]
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportClientResponse {
    pub tls: TlsMaterial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportNetworksRequest {
    #[serde(rename = "machineID")]
    pub machine_id: String,
    pub ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullClusterRequest {
    #[serde(rename = "machineID")]
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullClusterResponse {
    pub cluster: Vec<ConduitRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitOnlineRequest {
    pub conduit: ConduitRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitOfflineRequest {
    #[serde(rename = "machineID")]
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitNetworksChangedRequest {
    #[serde(rename = "machineID")]
    pub machine_id: String,
    pub ips: Vec<Ipv4Addr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_equality_ignores_ip_order() {
        let a = ConduitRecord {
            machine_id: "m1".into(),
            network: "tcp4".into(),
            addr: "0.0.0.0:443".into(),
            ips: vec!["10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap()],
        };
        let mut b = a.clone();
        b.ips.reverse();
        assert!(a.same(&b));

        b.ips.pop();
        assert!(!a.same(&b));

        let mut c = a.clone();
        c.addr = "0.0.0.0:444".into();
        assert!(!a.same(&c));
    }

    #[test]
    fn wire_uses_machine_id_key() {
        let req = ReportNetworksRequest {
            machine_id: "m1".into(),
            ips: vec!["192.168.0.9".parse().unwrap()],
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["machineID"], "m1");
        assert_eq!(value["ips"][0], "192.168.0.9");
    }
}
