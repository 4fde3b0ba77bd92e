//! Shared listen/dial configuration shapes used by both binaries' YAML
//! configs.

use serde::Deserialize;

fn default_network() -> String {
    "tcp4".to_string()
}

/// A certificate/key PEM file pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertKeyFile {
    pub cert: String,
    pub key: String,
}

/// Wire-facing TLS switches, file-backed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsFileConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub mtls: bool,
    /// CA certificate PEM files; required when `mtls` is on.
    #[serde(default)]
    pub ca_certs: Vec<String>,
    /// Certificates presented to the peer.
    #[serde(default)]
    pub certs: Vec<CertKeyFile>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// A listening socket.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_network")]
    pub network: String,
    pub addr: String,
    #[serde(default)]
    pub tls: Option<TlsFileConfig>,
}

/// A dialable peer; one address is chosen uniformly at random per attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct DialConfig {
    #[serde(default = "default_network")]
    pub network: String,
    pub addresses: Vec<String>,
    #[serde(default)]
    pub tls: Option<TlsFileConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_defaults() {
        let dial: DialConfig = serde_yaml::from_str(
            r#"
addresses: ["10.0.0.2:443"]
tls:
  enable: true
  insecure_skip_verify: true
"#,
        )
        .unwrap();
        assert_eq!(dial.network, "tcp4");
        let tls = dial.tls.unwrap();
        assert!(tls.enable && !tls.mtls && tls.insecure_skip_verify);
        assert!(tls.ca_certs.is_empty());
    }
}
