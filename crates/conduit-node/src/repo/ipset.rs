//! Kernel match-set mirror, driven through `ipset(8)`.
//!
//! Every policy key has a corresponding entry in one of three sets; the
//! packet-filter rules test membership and tag or DNAT matching packets.
//! All operations are idempotent: errors that only say "the state is
//! already what you wanted" are demoted to debug logs.

use conduit_core::{ConduitError, ConduitResult};
use std::net::Ipv4Addr;
use std::process::Command;
use tracing::{debug, error};

pub const SET_PORT: &str = "CONDUIT_PORT";
pub const SET_IPPORT: &str = "CONDUIT_IPPORT";
pub const SET_IP: &str = "CONDUIT_IP";

/// `ipset` stderr fragments that mean "nothing to do".
const BENIGN_ERRORS: [&str; 6] = [
    "already exists",
    "already added",
    "does not exist",
    "doesn't exist",
    "not added",
    "no such file or directory",
];

fn is_benign(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    BENIGN_ERRORS.iter().any(|needle| lower.contains(needle))
}

/// Creation argument vectors for the three sets.
fn create_args() -> [Vec<String>; 3] {
    [
        vec![
            "create".into(),
            SET_PORT.into(),
            "bitmap:port".into(),
            "range".into(),
            "0-65535".into(),
        ],
        vec!["create".into(), SET_IPPORT.into(), "hash:ip,port".into()],
        vec!["create".into(), SET_IP.into(), "hash:ip".into()],
    ]
}

fn entry_port(port: u16) -> String {
    port.to_string()
}

fn entry_ip(ip: Ipv4Addr) -> String {
    ip.to_string()
}

fn entry_ip_port(ip: Ipv4Addr, port: u16) -> String {
    format!("{ip},tcp:{port}")
}

/// Handle on the three kernel match sets.
#[derive(Default)]
pub struct MatchSets;

impl MatchSets {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[String]) -> ConduitResult<()> {
        let output = Command::new("ipset").args(args).output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if is_benign(stderr) {
            debug!(args = ?args, stderr, "ipset state already in place");
            return Ok(());
        }
        Err(ConduitError::Other(format!(
            "ipset {} failed: {stderr}",
            args.join(" ")
        )))
    }

    /// Create the three sets. Safe to call over leftovers from a crash.
    pub fn init(&self) -> ConduitResult<()> {
        for args in create_args() {
            self.run(&args)?;
        }
        Ok(())
    }

    pub fn add_port(&self, port: u16) -> ConduitResult<()> {
        self.run(&["add".into(), SET_PORT.into(), entry_port(port)])
            .inspect_err(|e| error!(port, error = %e, "add port set entry failed"))
    }

    pub fn add_ip(&self, ip: Ipv4Addr) -> ConduitResult<()> {
        self.run(&["add".into(), SET_IP.into(), entry_ip(ip)])
            .inspect_err(|e| error!(%ip, error = %e, "add ip set entry failed"))
    }

    pub fn add_ip_port(&self, ip: Ipv4Addr, port: u16) -> ConduitResult<()> {
        self.run(&["add".into(), SET_IPPORT.into(), entry_ip_port(ip, port)])
            .inspect_err(|e| error!(%ip, port, error = %e, "add ip,port set entry failed"))
    }

    pub fn del_port(&self, port: u16) -> ConduitResult<()> {
        self.run(&["del".into(), SET_PORT.into(), entry_port(port)])
            .inspect_err(|e| error!(port, error = %e, "del port set entry failed"))
    }

    pub fn del_ip(&self, ip: Ipv4Addr) -> ConduitResult<()> {
        self.run(&["del".into(), SET_IP.into(), entry_ip(ip)])
            .inspect_err(|e| error!(%ip, error = %e, "del ip set entry failed"))
    }

    pub fn del_ip_port(&self, ip: Ipv4Addr, port: u16) -> ConduitResult<()> {
        self.run(&["del".into(), SET_IPPORT.into(), entry_ip_port(ip, port)])
            .inspect_err(|e| error!(%ip, port, error = %e, "del ip,port set entry failed"))
    }

    /// Flush and destroy all three sets. Missing sets are already-done.
    pub fn fini(&self) {
        for set in [SET_IPPORT, SET_PORT, SET_IP] {
            if let Err(e) = self.run(&["flush".into(), set.into()]) {
                debug!(set, error = %e, "flush match set");
            }
        }
        for set in [SET_IPPORT, SET_PORT, SET_IP] {
            if let Err(e) = self.run(&["destroy".into(), set.into()]) {
                debug!(set, error = %e, "destroy match set");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_vectors_name_the_three_sets() {
        let [port, ip_port, ip] = create_args();
        assert_eq!(port, ["create", "CONDUIT_PORT", "bitmap:port", "range", "0-65535"]);
        assert_eq!(ip_port, ["create", "CONDUIT_IPPORT", "hash:ip,port"]);
        assert_eq!(ip, ["create", "CONDUIT_IP", "hash:ip"]);
    }

    #[test]
    fn entry_formats() {
        assert_eq!(entry_port(9092), "9092");
        assert_eq!(entry_ip("10.0.0.2".parse().unwrap()), "10.0.0.2");
        assert_eq!(entry_ip_port("10.0.0.2".parse().unwrap(), 9092), "10.0.0.2,tcp:9092");
    }

    #[test]
    fn benign_error_classification() {
        assert!(is_benign("ipset v7.15: Set cannot be created: set with the same name already exists"));
        assert!(is_benign("ipset v7.15: The set with the given name does not exist"));
        assert!(is_benign("ipset v7.15: Element cannot be deleted from the set: it's not added"));
        assert!(is_benign("No such file or directory"));
        assert!(!is_benign("Kernel error received: Operation not permitted"));
        assert!(!is_benign("Syntax error: unknown argument"));
    }
}
