//! Manager configuration: YAML file with `listen`, `cert`, `store` and
//! `log` sections.

use crate::cms::{CertProfile, CmsConfig};
use conduit_core::netcfg::ListenConfig;
use conduit_core::{ConduitError, ConduitResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_listen() -> ListenConfig {
    ListenConfig {
        network: "tcp4".to_string(),
        addr: "0.0.0.0:5053".to_string(),
        tls: None,
    }
}
fn default_ca_not_after() -> String {
    "1,0,0".to_string()
}
fn default_cert_not_after() -> String {
    "0,1,0".to_string()
}
fn default_ca_common_name() -> String {
    "Conduit CA".to_string()
}
fn default_cert_common_name() -> String {
    "Conduit".to_string()
}
fn default_organization() -> String {
    "Conduit".to_string()
}
fn default_renew_before() -> u64 {
    7 * 24 * 3600
}
fn default_store_path() -> String {
    "./conduit-manager-store.json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaSection {
    #[serde(default = "default_ca_not_after")]
    pub not_after: String,
    #[serde(default = "default_ca_common_name")]
    pub common_name: String,
    #[serde(default = "default_organization")]
    pub organization: String,
}

impl Default for CaSection {
    fn default() -> Self {
        Self {
            not_after: default_ca_not_after(),
            common_name: default_ca_common_name(),
            organization: default_organization(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeafSection {
    #[serde(default = "default_cert_not_after")]
    pub not_after: String,
    #[serde(default = "default_cert_common_name")]
    pub common_name: String,
    #[serde(default = "default_organization")]
    pub organization: String,
}

impl Default for LeafSection {
    fn default() -> Self {
        Self {
            not_after: default_cert_not_after(),
            common_name: default_cert_common_name(),
            organization: default_organization(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertSection {
    #[serde(default)]
    pub ca: CaSection,
    #[serde(default)]
    pub cert: LeafSection,
    /// Seconds before expiry at which certificates are re-issued.
    #[serde(default = "default_renew_before")]
    pub renew_before: u64,
}

impl Default for CertSection {
    fn default() -> Self {
        Self {
            ca: CaSection::default(),
            cert: LeafSection::default(),
            renew_before: default_renew_before(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
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

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: ListenConfig,
    #[serde(default)]
    pub cert: CertSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub log: LogSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cert: CertSection::default(),
            store: StoreSection::default(),
            log: LogSection::default(),
        }
    }
}

impl Config {
    /// Load the config file; a missing file falls back to defaults.
    pub fn load(path: &Path) -> ConduitResult<Config> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => {
                return Err(ConduitError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_yaml::from_str(&raw)
            .map_err(|e| ConduitError::Config(format!("{}: {e}", path.display())))
    }

    pub fn cms_config(&self) -> CmsConfig {
        CmsConfig {
            ca: CertProfile {
                not_after: self.cert.ca.not_after.clone(),
                common_name: self.cert.ca.common_name.clone(),
                organization: self.cert.ca.organization.clone(),
            },
            cert: CertProfile {
                not_after: self.cert.cert.not_after.clone(),
                common_name: self.cert.cert.common_name.clone(),
                organization: self.cert.cert.organization.clone(),
            },
            renew_before: Duration::from_secs(self.cert.renew_before),
        }
    }
}
