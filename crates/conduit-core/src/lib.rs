//! conduit-core: shared protocol library for Conduit.
//!
//! Provides the tunnel and control-channel codecs, the manager RPC session,
//! protocol payload types, TLS config assembly, machine identity, and
//! network helpers.

pub mod codec;
pub mod error;
pub mod machine;
pub mod netcfg;
pub mod netutil;
pub mod proto;
pub mod rpc;
pub mod tlsutil;

// Re-export commonly used items at crate root.
pub use codec::{read_tunnel_header, write_tunnel_header, TunnelHeader, MAX_FRAME_LEN};
pub use error::{ConduitError, ConduitResult};
pub use rpc::{BoxedStream, IncomingRequest, RpcSession};
