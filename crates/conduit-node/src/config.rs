//! Node configuration: YAML file with `manager`, `server`, `client` and
//! `log` sections.
//!
//! The machine ID is deliberately absent here: it is derived from the
//! host at startup, never configured.

use conduit_core::netcfg::{DialConfig, ListenConfig};
use conduit_core::netutil::split_host_port;
use conduit_core::{ConduitError, ConduitResult};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

fn default_check_time() -> u64 {
    30
}
fn default_interval() -> u64 {
    60
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

/// `manager` section: the control-plane endpoint this node syncs with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagerSection {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub dial: Option<DialConfig>,
}

/// `server` section: the tunnel-terminating role.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub listen: Option<ListenConfig>,
    /// Seconds between `report_networks` calls.
    #[serde(default = "default_interval")]
    pub report_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            enable: false,
            listen: None,
            report_interval: default_interval(),
        }
    }
}

/// One dialable server-side conduit, referenced from the forward table.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub index: u32,
    pub dial: DialConfig,
}

/// Static forward table entry: traffic whose original destination matches
/// `dst` is tunneled via `peers[peer_index]` and delivered to `dst_as`.
/// `dst` is `"ip:port"` or `":port"` (any IP, that port).
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardEntry {
    pub dst: String,
    pub peer_index: u32,
    #[serde(default)]
    pub dst_as: Option<String>,
}

/// `client` section: the intercepting role.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub listen: Option<ListenConfig>,
    /// Seconds between kernel-plane heal passes.
    #[serde(default = "default_check_time")]
    pub check_time: u64,
    /// Seconds between `pull_cluster` calls.
    #[serde(default = "default_interval")]
    pub pull_interval: u64,
    /// Seconds before a dial attempt is abandoned.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default)]
    pub forward_table: Vec<ForwardEntry>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            enable: false,
            listen: None,
            check_time: default_check_time(),
            pull_interval: default_interval(),
            dial_timeout: default_dial_timeout(),
            forward_table: Vec::new(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub log: LogSection,
}

impl Config {
    /// Load and validate a config file. All validation failures here are
    /// fatal at startup.
    pub fn load(path: &Path) -> ConduitResult<Config> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConduitError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| ConduitError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConduitResult<()> {
        if self.manager.enable && self.manager.dial.is_none() {
            return Err(ConduitError::Config("manager enabled without dial".to_string()));
        }
        if self.server.enable && self.server.listen.is_none() {
            return Err(ConduitError::Config("server enabled without listen".to_string()));
        }
        if self.client.enable {
            let listen = self
                .client
                .listen
                .as_ref()
                .ok_or_else(|| ConduitError::Config("client enabled without listen".to_string()))?;
            // The intercept listener needs a concrete local port for the
            // DNAT target.
            split_host_port(&listen.addr)
                .map_err(|_| ConduitError::Config(format!("illegal client listen address {}", listen.addr)))?;
            self.validate_forward_table()?;
        }
        Ok(())
    }

    fn validate_forward_table(&self) -> ConduitResult<()> {
        let mut indexes = HashSet::new();
        for peer in &self.client.peers {
            if !indexes.insert(peer.index) {
                return Err(ConduitError::Config(format!(
                    "duplicated peer index configured: {}",
                    peer.index
                )));
            }
            if peer.dial.addresses.is_empty() {
                return Err(ConduitError::Config(format!(
                    "peer {} has no addresses",
                    peer.index
                )));
            }
        }
        for entry in &self.client.forward_table {
            // Entries must be ":port" or "ip:port"; anything else is a
            // config error rather than a silent skip.
            let (host, _port) = split_host_port(&entry.dst).map_err(|_| {
                ConduitError::Config(format!("illegal forward dst {:?}", entry.dst))
            })?;
            if !host.is_empty() && host.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(ConduitError::Config(format!(
                    "illegal forward dst {:?}",
                    entry.dst
                )));
            }
            if !indexes.contains(&entry.peer_index) {
                return Err(ConduitError::Config(format!(
                    "peer index not found: {}",
                    entry.peer_index
                )));
            }
            if let Some(dst_as) = &entry.dst_as {
                if !dst_as.is_empty() {
                    split_host_port(dst_as).map_err(|_| {
                        ConduitError::Config(format!("illegal dst_as {:?}", dst_as))
                    })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ConduitResult<Config> {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().map(|_| config)
    }

    const CLIENT_YAML: &str = r#"
client:
  enable: true
  listen: { addr: "127.0.0.1:5052" }
  forward_table:
    - { dst: ":9090", peer_index: 0, dst_as: "127.0.0.1:9090" }
    - { dst: "10.0.0.1:9092", peer_index: 0 }
  peers:
    - index: 0
      dial:
        addresses: ["10.0.0.2:443"]
        tls: { enable: true, insecure_skip_verify: true }
"#;

    #[test]
    fn full_client_config_parses() {
        let config = parse(CLIENT_YAML).unwrap();
        assert!(config.client.enable);
        assert_eq!(config.client.check_time, 30);
        assert_eq!(config.client.forward_table.len(), 2);
        assert_eq!(config.client.peers[0].dial.network, "tcp4");
    }

    #[test]
    fn duplicate_peer_index_rejected() {
        let yaml = r#"
client:
  enable: true
  listen: { addr: ":5052" }
  peers:
    - { index: 0, dial: { addresses: ["a:1"] } }
    - { index: 0, dial: { addresses: ["b:1"] } }
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicated peer index"));
    }

    #[test]
    fn dangling_peer_index_rejected() {
        let yaml = r#"
client:
  enable: true
  listen: { addr: ":5052" }
  forward_table:
    - { dst: ":9090", peer_index: 3 }
  peers:
    - { index: 0, dial: { addresses: ["a:1"] } }
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("peer index not found"));
    }

    #[test]
    fn malformed_forward_dst_rejected() {
        let yaml = r#"
client:
  enable: true
  listen: { addr: ":5052" }
  forward_table:
    - { dst: "nonsense", peer_index: 0 }
  peers:
    - { index: 0, dial: { addresses: ["a:1"] } }
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn manager_requires_dial() {
        let yaml = "manager: { enable: true }";
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn absent_sections_keep_interval_defaults() {
        let config = parse("log: { level: debug }").unwrap();
        assert_eq!(config.client.check_time, 30);
        assert_eq!(config.client.pull_interval, 60);
        assert_eq!(config.client.dial_timeout, 10);
        assert_eq!(config.server.report_interval, 60);
    }
}
