//! Persistent certificate store.
//!
//! Two record shapes, `CA` and `Cert`, kept in one JSON file that is
//! rewritten atomically on every mutation. Deletion is a tombstone flag;
//! lookups only see live records.

use conduit_core::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaRecord {
    pub id: u64,
    pub organization: String,
    pub common_name: String,
    /// The configured "Y,M,D" window this CA was issued with.
    pub not_after: String,
    /// Unix timestamp of expiry.
    pub expiration: i64,
    /// DER certificate.
    pub cert: Vec<u8>,
    /// DER private key (PKCS#8).
    pub key: Vec<u8>,
    pub deleted: bool,
    pub create_time: i64,
    pub update_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRecord {
    pub id: u64,
    pub organization: String,
    pub common_name: String,
    /// Canonical SAN key (sorted, comma-joined IPs; "client" for the
    /// shared client certificate).
    pub subject_alternative_name: String,
    pub not_after: String,
    pub expiration: i64,
    /// DER certificate.
    pub cert: Vec<u8>,
    /// DER private key (PKCS#1, as served to nodes).
    pub key: Vec<u8>,
    pub deleted: bool,
    pub create_time: i64,
    pub update_time: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    next_id: u64,
    ca: Option<CaRecord>,
    certs: Vec<CertRecord>,
}

/// File-backed store handle.
pub struct Store {
    path: PathBuf,
    data: Mutex<StoreData>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Store {
    /// Open (or create) the store file.
    pub fn open(path: impl Into<PathBuf>) -> ConduitResult<Store> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| ConduitError::Other(format!("corrupt store {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(ConduitError::Io(e)),
        };
        Ok(Store {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &StoreData) -> ConduitResult<()> {
        let raw = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn ca(&self) -> Option<CaRecord> {
        let data = self.data.lock().expect("store lock poisoned");
        data.ca.clone().filter(|ca| !ca.deleted)
    }

    /// Install a new CA, supplanting any previous one.
    pub fn put_ca(
        &self,
        organization: &str,
        common_name: &str,
        not_after: &str,
        expiration: i64,
        cert: Vec<u8>,
        key: Vec<u8>,
    ) -> ConduitResult<CaRecord> {
        let mut data = self.data.lock().expect("store lock poisoned");
        data.next_id += 1;
        let now = now_unix();
        let record = CaRecord {
            id: data.next_id,
            organization: organization.to_string(),
            common_name: common_name.to_string(),
            not_after: not_after.to_string(),
            expiration,
            cert,
            key,
            deleted: false,
            create_time: now,
            update_time: now,
        };
        data.ca = Some(record.clone());
        self.persist(&data)?;
        Ok(record)
    }

    pub fn cert_by_san(&self, san: &str) -> Option<CertRecord> {
        let data = self.data.lock().expect("store lock poisoned");
        data.certs
            .iter()
            .find(|cert| !cert.deleted && cert.subject_alternative_name == san)
            .cloned()
    }

    pub fn live_certs(&self) -> Vec<CertRecord> {
        let data = self.data.lock().expect("store lock poisoned");
        data.certs.iter().filter(|c| !c.deleted).cloned().collect()
    }

    /// Insert a certificate for a SAN key, tombstoning any previous record
    /// under the same key.
    #[allow(clippy::too_many_arguments)]
    pub fn put_cert(
        &self,
        organization: &str,
        common_name: &str,
        san: &str,
        not_after: &str,
        expiration: i64,
        cert: Vec<u8>,
        key: Vec<u8>,
    ) -> ConduitResult<CertRecord> {
        let mut data = self.data.lock().expect("store lock poisoned");
        let now = now_unix();
        for old in data.certs.iter_mut() {
            if old.subject_alternative_name == san && !old.deleted {
                old.deleted = true;
                old.update_time = now;
            }
        }
        data.next_id += 1;
        let record = CertRecord {
            id: data.next_id,
            organization: organization.to_string(),
            common_name: common_name.to_string(),
            subject_alternative_name: san.to_string(),
            not_after: not_after.to_string(),
            expiration,
            cert,
            key,
            deleted: false,
            create_time: now,
            update_time: now,
        };
        data.certs.push(record.clone());
        self.persist(&data)?;
        Ok(record)
    }

    /// Tombstone every live certificate (CA rotation: downstream certs are
    /// re-issued on demand under the new CA).
    pub fn delete_all_certs(&self) -> ConduitResult<usize> {
        let mut data = self.data.lock().expect("store lock poisoned");
        let now = now_unix();
        let mut count = 0;
        for cert in data.certs.iter_mut() {
            if !cert.deleted {
                cert.deleted = true;
                cert.update_time = now;
                count += 1;
            }
        }
        if count > 0 {
            self.persist(&data)?;
        }
        Ok(count)
    }
}
