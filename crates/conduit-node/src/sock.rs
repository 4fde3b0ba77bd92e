//! Socket-level plumbing for the interception path: fwmark constants,
//! original-destination recovery and mark manipulation.
//!
//! The mark values tie the kernel plane to userspace: the packet-filter
//! rules tag intercepted packets with the set that matched them, and the
//! proxy tags its own outbound sockets so those rules skip them.

use conduit_core::ConduitResult;
use std::net::SocketAddrV4;

/// Applied to every socket the proxy dials; the nat-OUTPUT accept rule
/// matches it so our own connections are not re-intercepted (loops).
pub const MARK_IGNORE_SELF: u32 = 0xC0D10001;
/// The packet matched the IP match set.
pub const MARK_IP: u32 = 0xC0D10002;
/// The packet matched the port match set.
pub const MARK_PORT: u32 = 0xC0D10003;
/// The packet matched the ip,port match set.
pub const MARK_IPPORT: u32 = 0xC0D10004;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use nix::sys::socket::{getsockopt, setsockopt, sockopt};
    use std::net::Ipv4Addr;
    use std::os::fd::AsFd;

    /// Pre-NAT destination of an accepted connection
    /// (`SO_ORIGINAL_DST`, IPv4 only).
    pub fn original_dst(stream: &tokio::net::TcpStream) -> ConduitResult<SocketAddrV4> {
        let addr = getsockopt(stream, sockopt::OriginalDst).map_err(std::io::Error::from)?;
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(SocketAddrV4::new(ip, port))
    }

    /// The fwmark the kernel preserved on an accepted socket
    /// (requires `net.ipv4.tcp_fwmark_accept=1`).
    pub fn socket_mark(stream: &tokio::net::TcpStream) -> ConduitResult<u32> {
        Ok(getsockopt(stream, sockopt::Mark).map_err(std::io::Error::from)?)
    }

    /// Tag a socket with a fwmark before connecting.
    pub fn set_mark<F: AsFd>(socket: &F, mark: u32) -> ConduitResult<()> {
        setsockopt(socket, sockopt::Mark, &mark).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Raise RLIMIT_NOFILE to its hard limit; a proxy node holds two
    /// descriptors per tunneled connection.
    pub fn raise_nofile_limit() -> ConduitResult<u64> {
        use nix::sys::resource::{getrlimit, setrlimit, Resource};
        let (_soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(std::io::Error::from)?;
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard).map_err(std::io::Error::from)?;
        Ok(hard)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use conduit_core::ConduitError;

    pub fn original_dst(_stream: &tokio::net::TcpStream) -> ConduitResult<SocketAddrV4> {
        Err(ConduitError::Other(
            "SO_ORIGINAL_DST is only available on linux".to_string(),
        ))
    }

    pub fn socket_mark(_stream: &tokio::net::TcpStream) -> ConduitResult<u32> {
        Ok(0)
    }

    pub fn set_mark<F>(_socket: &F, _mark: u32) -> ConduitResult<()> {
        Ok(())
    }

    pub fn raise_nofile_limit() -> ConduitResult<u64> {
        Ok(0)
    }
}

pub use imp::{original_dst, raise_nofile_limit, set_mark, socket_mark};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_are_distinct() {
        let marks = [MARK_IGNORE_SELF, MARK_IP, MARK_PORT, MARK_IPPORT];
        for (i, a) in marks.iter().enumerate() {
            for b in &marks[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
