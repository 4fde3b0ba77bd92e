//! Kernel-plane programming: the nat-table rules and sysctls that steer
//! local traffic into the intercept listener.
//!
//! Layout installed at startup and healed by a background ticker:
//!
//! ```text
//! nat OUTPUT:      -m mark --mark MARK_IGNORE_SELF -j ACCEPT   (loop guard)
//!                  -d <manager ip> --dport <port> -j ACCEPT    (per manager addr)
//!                  ! -o br+ -j CONDUIT
//! nat PREROUTING:  -i br+ -j CONDUIT
//! nat CONDUIT:     three "-m set ... -j MARK --set-mark" rules (one per set)
//!                  three "-m set ... -j DNAT --to 127.0.0.1:<listen port>"
//!                  (DNAT order ip:port, port, ip realizes precedence)
//! ```
//!
//! Every insert is check-then-insert, so a second invocation leaves the
//! kernel state unchanged. Teardown errors that merely report absence are
//! demoted to debug logs.

use crate::repo::ipset::{SET_IP, SET_IPPORT, SET_PORT};
use crate::sock::{MARK_IGNORE_SELF, MARK_IP, MARK_IPPORT, MARK_PORT};
use conduit_core::{ConduitError, ConduitResult};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};

pub const CHAIN: &str = "CONDUIT";

const SYSCTL_ROUTE_LOCALNET: &str = "/proc/sys/net/ipv4/conf/all/route_localnet";
const SYSCTL_FWMARK_ACCEPT: &str = "/proc/sys/net/ipv4/tcp_fwmark_accept";

/// `iptables` stderr fragments that mean the object is already gone (or
/// already there, for creation).
const BENIGN_ERRORS: [&str; 5] = [
    "no chain/target/match by that name",
    "bad rule",
    "does a matching rule exist",
    "chain already exists",
    "no such file or directory",
];

fn is_benign(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    BENIGN_ERRORS.iter().any(|needle| lower.contains(needle))
}

fn mark_arg(mark: u32) -> String {
    format!("0x{mark:x}")
}

fn svec(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ── Rule specs ───────────────────────────────────────────────────────

fn rule_ignore_self() -> Vec<String> {
    svec(&[
        "-p", "tcp", "-m", "mark", "--mark", &mark_arg(MARK_IGNORE_SELF), "-j", "ACCEPT",
    ])
}

fn rule_manager_accept(ip: &str, port: u16) -> Vec<String> {
    svec(&[
        "-p", "tcp", "-d", ip, "--dport", &port.to_string(), "-j", "ACCEPT",
    ])
}

fn rule_jump_prerouting() -> Vec<String> {
    svec(&["-i", "br+", "-j", CHAIN])
}

fn rule_jump_output() -> Vec<String> {
    svec(&["!", "-o", "br+", "-j", CHAIN])
}

fn set_flags(set: &str) -> &'static str {
    // The pair set tests destination ip and destination port.
    if set == SET_IPPORT {
        "dst,dst"
    } else {
        "dst"
    }
}

fn rule_set_mark(set: &str, mark: u32) -> Vec<String> {
    svec(&[
        "-p", "tcp", "-m", "set", "--match-set", set, set_flags(set), "-j", "MARK",
        "--set-mark", &mark_arg(mark),
    ])
}

fn rule_dnat(set: &str, listen_port: u16) -> Vec<String> {
    svec(&[
        "-p", "tcp", "-m", "set", "--match-set", set, set_flags(set), "-j", "DNAT",
        "--to-destination", &format!("127.0.0.1:{listen_port}"),
    ])
}

// ── Programmer ───────────────────────────────────────────────────────

/// Installs, heals and removes the Conduit nat rules and sysctls.
pub struct KernelTables {
    /// Local port of the intercept listener (the DNAT target).
    listen_port: u16,
    /// Manager control-plane addresses that must never be intercepted.
    manager_addrs: Vec<(String, u16)>,
}

impl KernelTables {
    pub fn new(listen_port: u16, manager_addrs: Vec<(String, u16)>) -> Self {
        Self {
            listen_port,
            manager_addrs,
        }
    }

    fn run(&self, op: &str, chain: &str, spec: &[String]) -> ConduitResult<()> {
        let mut args = svec(&["-t", "nat", op, chain]);
        args.extend_from_slice(spec);
        let output = Command::new("iptables").args(&args).output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ConduitError::Other(format!(
            "iptables {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }

    fn exists(&self, chain: &str, spec: &[String]) -> ConduitResult<bool> {
        match self.run("-C", chain, spec) {
            Ok(()) => Ok(true),
            Err(e) if is_benign(&e.to_string()) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check-then-insert (`-I`) or check-then-append (`-A`).
    fn ensure(&self, chain: &str, spec: &[String], append: bool) -> ConduitResult<()> {
        if self.exists(chain, spec)? {
            return Ok(());
        }
        self.run(if append { "-A" } else { "-I" }, chain, spec)
    }

    /// Delete a rule; absence is already-done.
    fn remove(&self, chain: &str, spec: &[String]) {
        if let Err(e) = self.run("-D", chain, spec) {
            let message = e.to_string();
            if is_benign(&message) {
                debug!(chain, "rule already absent");
            } else {
                error!(chain, error = %message, "delete rule failed");
            }
        }
    }

    fn create_chain(&self) -> ConduitResult<()> {
        match self.run("-N", CHAIN, &[]) {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e.to_string()) => Ok(()),
            // Chain creation failing for any other reason leaves the
            // kernel plane inconsistent; that is fatal.
            Err(e) => Err(e),
        }
    }

    /// Install (or re-install) the whole rule set and the sysctls.
    /// Idempotent: a second invocation changes nothing.
    pub fn setup(&self) -> ConduitResult<()> {
        self.ensure("OUTPUT", &rule_ignore_self(), false)?;
        for (ip, port) in &self.manager_addrs {
            self.ensure("OUTPUT", &rule_manager_accept(ip, *port), false)?;
        }

        self.create_chain()?;
        self.ensure("PREROUTING", &rule_jump_prerouting(), true)?;
        self.ensure("OUTPUT", &rule_jump_output(), true)?;

        self.ensure(CHAIN, &rule_set_mark(SET_IP, MARK_IP), false)?;
        self.ensure(CHAIN, &rule_set_mark(SET_PORT, MARK_PORT), false)?;
        self.ensure(CHAIN, &rule_set_mark(SET_IPPORT, MARK_IPPORT), false)?;

        // DNAT precedence is rule order: ip:port first, ip last.
        self.ensure(CHAIN, &rule_dnat(SET_IPPORT, self.listen_port), true)?;
        self.ensure(CHAIN, &rule_dnat(SET_PORT, self.listen_port), true)?;
        self.ensure(CHAIN, &rule_dnat(SET_IP, self.listen_port), true)?;

        self.sysctl_enable()?;
        Ok(())
    }

    /// Remove whatever a previous instance may have left behind. Called
    /// before setup so a crashed process cannot leave duplicate rules.
    pub fn clear_legacy(&self) {
        debug!("clearing leftover kernel state");
        self.teardown_rules();
    }

    /// Reverse every setup step.
    pub fn teardown(&self) {
        self.teardown_rules();
        self.sysctl_restore();
    }

    fn teardown_rules(&self) {
        for (ip, port) in &self.manager_addrs {
            self.remove("OUTPUT", &rule_manager_accept(ip, *port));
        }
        self.remove("OUTPUT", &rule_ignore_self());

        self.remove(CHAIN, &rule_set_mark(SET_IP, MARK_IP));
        self.remove(CHAIN, &rule_set_mark(SET_PORT, MARK_PORT));
        self.remove(CHAIN, &rule_set_mark(SET_IPPORT, MARK_IPPORT));
        self.remove(CHAIN, &rule_dnat(SET_IPPORT, self.listen_port));
        self.remove(CHAIN, &rule_dnat(SET_PORT, self.listen_port));
        self.remove(CHAIN, &rule_dnat(SET_IP, self.listen_port));

        if let Err(e) = self.run("-F", CHAIN, &[]) {
            let message = e.to_string();
            if is_benign(&message) {
                debug!("chain already absent");
            } else {
                error!(error = %message, "flush chain failed");
            }
        }
        self.remove("PREROUTING", &rule_jump_prerouting());
        self.remove("OUTPUT", &rule_jump_output());
        if let Err(e) = self.run("-X", CHAIN, &[]) {
            let message = e.to_string();
            if is_benign(&message) {
                debug!("chain already deleted");
            } else {
                error!(error = %message, "delete chain failed");
            }
        }
    }

    fn sysctl_enable(&self) -> ConduitResult<()> {
        // DNAT to loopback across interfaces, and mark preservation on
        // accepted sockets.
        std::fs::write(SYSCTL_ROUTE_LOCALNET, "1")
            .map_err(|e| ConduitError::Other(format!("{SYSCTL_ROUTE_LOCALNET}: {e}")))?;
        std::fs::write(SYSCTL_FWMARK_ACCEPT, "1")
            .map_err(|e| ConduitError::Other(format!("{SYSCTL_FWMARK_ACCEPT}: {e}")))?;
        Ok(())
    }

    fn sysctl_restore(&self) {
        for path in [SYSCTL_ROUTE_LOCALNET, SYSCTL_FWMARK_ACCEPT] {
            if let Err(e) = std::fs::write(path, "0") {
                debug!(path, error = %e, "sysctl restore failed");
            }
        }
    }

    /// Periodically re-install the rule set to heal anything another agent
    /// removed. Runs until the shutdown signal.
    pub async fn run_heal(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // setup already ran; skip the immediate tick
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("kernel heal ticker stopped");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.setup() {
                        error!(error = %e, "kernel heal pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnat_rule_targets_loopback_listener() {
        let rule = rule_dnat(SET_IPPORT, 5052);
        assert_eq!(
            rule,
            [
                "-p", "tcp", "-m", "set", "--match-set", "CONDUIT_IPPORT", "dst,dst", "-j",
                "DNAT", "--to-destination", "127.0.0.1:5052"
            ]
        );
    }

    #[test]
    fn pair_set_matches_dst_twice() {
        assert_eq!(set_flags(SET_IPPORT), "dst,dst");
        assert_eq!(set_flags(SET_PORT), "dst");
        assert_eq!(set_flags(SET_IP), "dst");
    }

    #[test]
    fn mark_rule_uses_hex_mark() {
        let rule = rule_set_mark(SET_IP, MARK_IP);
        assert!(rule.contains(&format!("0x{MARK_IP:x}")));
        assert_eq!(rule[rule.len() - 3], "MARK");
    }

    #[test]
    fn jump_rules_split_on_bridge_interfaces() {
        assert_eq!(rule_jump_prerouting(), ["-i", "br+", "-j", "CONDUIT"]);
        assert_eq!(rule_jump_output(), ["!", "-o", "br+", "-j", "CONDUIT"]);
    }

    #[test]
    fn benign_error_classification() {
        assert!(is_benign("iptables: No chain/target/match by that name."));
        assert!(is_benign("iptables: Bad rule (does a matching rule exist in that chain?)."));
        assert!(is_benign("iptables: Chain already exists."));
        assert!(!is_benign("iptables v1.8.7: can't initialize iptables table `nat'"));
        assert!(!is_benign("Permission denied (you must be root)"));
    }

    #[test]
    fn manager_accept_rule_shape() {
        let rule = rule_manager_accept("10.0.0.10", 5053);
        assert_eq!(
            rule,
            ["-p", "tcp", "-d", "10.0.0.10", "--dport", "5053", "-j", "ACCEPT"]
        );
    }
}
