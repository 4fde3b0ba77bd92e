//! Address helpers and local network enumeration.

use crate::error::{ConduitError, ConduitResult};
use std::net::Ipv4Addr;

/// Split a `"host:port"` string. The host may be empty (`":9092"` means
/// "any IP, this port").
pub fn split_host_port(addr: &str) -> ConduitResult<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConduitError::InvalidAddress(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConduitError::InvalidAddress(addr.to_string()))?;
    Ok((host, port))
}

/// Enumerate this host's non-loopback IPv4 addresses.
#[cfg(unix)]
pub fn list_ipv4() -> ConduitResult<Vec<Ipv4Addr>> {
    let mut ips = Vec::new();
    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let Some(sin) = storage.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    Ok(ips)
}

#[cfg(not(unix))]
pub fn list_ipv4() -> ConduitResult<Vec<Ipv4Addr>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_shapes() {
        assert_eq!(split_host_port("10.0.0.1:9092").unwrap(), ("10.0.0.1", 9092));
        assert_eq!(split_host_port(":9092").unwrap(), ("", 9092));
        assert!(split_host_port("9092").is_err());
        assert!(split_host_port("10.0.0.1:notaport").is_err());
    }
}
