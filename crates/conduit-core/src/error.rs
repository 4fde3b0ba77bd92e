use thiserror::Error;

/// Errors produced by the Conduit protocol and control-plane layers.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("rpc method not found: {0}")]
    RpcMethodNotFound(String),

    #[error("session closed")]
    SessionClosed,

    #[error("policy not found for {0}")]
    PolicyNotFound(String),

    #[error("machine identity unavailable: {0}")]
    MachineId(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ConduitError {
    fn from(e: serde_json::Error) -> Self {
        ConduitError::Codec(e.to_string())
    }
}

impl From<rustls::Error> for ConduitError {
    fn from(e: rustls::Error) -> Self {
        ConduitError::Tls(e.to_string())
    }
}

pub type ConduitResult<T> = Result<T, ConduitError>;
