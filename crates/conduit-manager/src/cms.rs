//! Certificate management service: one active CA plus a per-SAN
//! certificate cache, both persisted.
//!
//! Keys are 2048-bit RSA. Certificates are DER on the wire; private keys
//! travel as PKCS#1 DER (what nodes parse). The CA supplants itself at
//! expiration and tombstones every downstream certificate, which then
//! re-issue on demand under the new CA.

use crate::store::{CertRecord, Store};
use conduit_core::proto::TlsMaterial;
use conduit_core::{ConduitError, ConduitResult};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rand::Rng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::{Date, Month, OffsetDateTime};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// SAN cache key of the shared client certificate.
pub const CLIENT_SAN: &str = "client";

const MIN_CHECK: Duration = Duration::from_secs(60);
const MAX_CHECK: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct CertProfile {
    /// "Y,M,D" validity window (add-years/months/days).
    pub not_after: String,
    pub common_name: String,
    pub organization: String,
}

#[derive(Debug, Clone)]
pub struct CmsConfig {
    pub ca: CertProfile,
    pub cert: CertProfile,
    /// Re-issue certificates whose remaining lifetime is inside this
    /// window.
    pub renew_before: Duration,
}

struct CaState {
    cert: rcgen::Certificate,
    key: KeyPair,
    /// The persisted CA DER, the trust anchor distributed to nodes.
    der: Vec<u8>,
    expiration: i64,
}

pub struct Cms {
    store: Arc<Store>,
    config: CmsConfig,
    state: Mutex<CaState>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn cert_err(context: &str, e: impl std::fmt::Display) -> ConduitError {
    ConduitError::Tls(format!("{context}: {e}"))
}

/// Parse a `"Y,M,D"` window. Missing or malformed fields read as zero,
/// like the lenient reference parser; an all-zero window is rejected.
pub fn parse_not_after(window: &str) -> ConduitResult<(i32, i32, i64)> {
    let mut parts = window.split(',');
    let years = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    let months = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    let days = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    if years == 0 && months == 0 && days == 0 {
        return Err(ConduitError::Config(format!(
            "certificate window {window:?} adds no time"
        )));
    }
    Ok((years, months, days))
}

/// Calendar addition with day-overflow normalization: Jan 31 plus one
/// month lands in early March, not on a clamped Feb 28.
pub fn add_date(base: OffsetDateTime, years: i32, months: i32, days: i64) -> OffsetDateTime {
    let month0 = u8::from(base.month()) as i32 - 1 + months;
    let year = base.year() + years + month0.div_euclid(12);
    let month = Month::try_from((month0.rem_euclid(12) + 1) as u8).expect("month in 1..=12");
    let first = Date::from_calendar_date(year, month, 1).expect("first of month is valid");
    let date = first + time::Duration::days(base.day() as i64 - 1 + days);
    base.replace_date(date)
}

/// Canonical cache key for a SAN set.
fn canonical_san(ips: &[Ipv4Addr]) -> String {
    let mut ips: Vec<Ipv4Addr> = ips.to_vec();
    ips.sort();
    ips.dedup();
    ips.iter()
        .map(|ip| ip.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_san_key(san: &str) -> Vec<Ipv4Addr> {
    if san == CLIENT_SAN {
        return Vec::new();
    }
    san.split(',').filter_map(|part| part.parse().ok()).collect()
}

fn random_serial() -> SerialNumber {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    SerialNumber::from(bytes.to_vec())
}

fn new_rsa_key() -> ConduitResult<RsaPrivateKey> {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, 2048).map_err(|e| cert_err("rsa keygen", e))
}

fn rcgen_key(private_key: &RsaPrivateKey) -> ConduitResult<(KeyPair, Vec<u8>)> {
    let pkcs8 = private_key
        .to_pkcs8_der()
        .map_err(|e| cert_err("pkcs8 encode", e))?;
    let key_pair =
        KeyPair::try_from(pkcs8.as_bytes()).map_err(|e| cert_err("key import", e))?;
    Ok((key_pair, pkcs8.as_bytes().to_vec()))
}

impl Cms {
    /// Load or create the CA and return a ready service.
    pub fn init(store: Arc<Store>, config: CmsConfig) -> ConduitResult<Cms> {
        parse_not_after(&config.ca.not_after)?;
        parse_not_after(&config.cert.not_after)?;

        let state = match store.ca() {
            Some(record) if record.expiration > now_unix() => {
                info!(expiration = record.expiration, "loaded persisted CA");
                load_ca_state(&record)?
            }
            _ => {
                info!("generating fresh CA");
                generate_ca(&store, &config)?
            }
        };
        Ok(Cms {
            store,
            config,
            state: Mutex::new(state),
        })
    }

    /// The current CA certificate (DER).
    pub fn ca_der(&self) -> Vec<u8> {
        self.state.lock().expect("cms lock poisoned").der.clone()
    }

    /// Certificate for a server conduit, with every reported IP as a SAN.
    /// Cached per SAN set, issued lazily.
    pub fn server_material(&self, ips: &[Ipv4Addr]) -> ConduitResult<TlsMaterial> {
        if ips.is_empty() {
            return Err(ConduitError::Config(
                "server certificate needs at least one IP".to_string(),
            ));
        }
        self.material_for(&canonical_san(ips), ips)
    }

    /// The shared client certificate.
    pub fn client_material(&self) -> ConduitResult<TlsMaterial> {
        self.material_for(CLIENT_SAN, &[])
    }

    fn material_for(&self, san_key: &str, ips: &[Ipv4Addr]) -> ConduitResult<TlsMaterial> {
        let state = self.state.lock().expect("cms lock poisoned");
        if let Some(record) = self.store.cert_by_san(san_key) {
            if record.expiration > now_unix() {
                return Ok(TlsMaterial {
                    ca: state.der.clone(),
                    cert: record.cert,
                    key: record.key,
                });
            }
        }
        let record = self.issue(&state, san_key, ips)?;
        Ok(TlsMaterial {
            ca: state.der.clone(),
            cert: record.cert,
            key: record.key,
        })
    }

    /// Issue (and persist) a certificate signed by the current CA.
    fn issue(&self, state: &CaState, san_key: &str, ips: &[Ipv4Addr]) -> ConduitResult<CertRecord> {
        let profile = &self.config.cert;
        let (years, months, days) = parse_not_after(&profile.not_after)?;

        let private_key = new_rsa_key()?;
        let (key_pair, _pkcs8) = rcgen_key(&private_key)?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::OrganizationName, profile.organization.clone());
        params
            .distinguished_name
            .push(DnType::CommonName, profile.common_name.clone());
        params.subject_alt_names = ips
            .iter()
            .map(|ip| SanType::IpAddress(IpAddr::V4(*ip)))
            .collect();
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = if ips.is_empty() {
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        } else {
            vec![ExtendedKeyUsagePurpose::ServerAuth]
        };
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = add_date(now, years, months, days);
        let expiration = params.not_after.unix_timestamp();

        let cert = params
            .signed_by(&key_pair, &state.cert, &state.key)
            .map_err(|e| cert_err("sign", e))?;
        let key_pkcs1 = private_key
            .to_pkcs1_der()
            .map_err(|e| cert_err("pkcs1 encode", e))?;

        debug!(san = san_key, expiration, "issued certificate");
        self.store.put_cert(
            &profile.organization,
            &profile.common_name,
            san_key,
            &profile.not_after,
            expiration,
            cert.der().as_ref().to_vec(),
            key_pkcs1.as_bytes().to_vec(),
        )
    }

    /// Replace the CA if it has expired. Downstream certificates are
    /// tombstoned and re-issue on demand.
    pub fn rotate_ca_if_expired(&self) -> ConduitResult<bool> {
        let mut state = self.state.lock().expect("cms lock poisoned");
        if state.expiration > now_unix() {
            return Ok(false);
        }
        let fresh = generate_ca(&self.store, &self.config)?;
        let wiped = self.store.delete_all_certs()?;
        info!(wiped, "CA rotated");
        *state = fresh;
        Ok(true)
    }

    /// Re-issue every live certificate inside the renewal window.
    pub fn renew_expiring(&self) -> ConduitResult<usize> {
        let now = now_unix();
        let window = self.config.renew_before.as_secs() as i64;
        let mut renewed = 0;
        for record in self.store.live_certs() {
            if record.expiration - now > window {
                continue;
            }
            let ips = parse_san_key(&record.subject_alternative_name);
            let state = self.state.lock().expect("cms lock poisoned");
            self.issue(&state, &record.subject_alternative_name, &ips)?;
            renewed += 1;
        }
        Ok(renewed)
    }

    /// Delay until the next maintenance pass: the soonest certificate
    /// entering its renewal window, or the CA's own expiry, whichever
    /// comes first. Renewing one certificate pulls the next check
    /// earlier, so rotation cascades across the cache.
    pub fn next_check_delay(&self) -> Duration {
        let now = now_unix();
        let window = self.config.renew_before.as_secs() as i64;
        let ca_remaining = self.state.lock().expect("cms lock poisoned").expiration - now;

        let mut soonest = ca_remaining;
        for record in self.store.live_certs() {
            soonest = soonest.min(record.expiration - now - window);
        }
        let delay = Duration::from_secs(soonest.max(0) as u64);
        delay.clamp(MIN_CHECK, MAX_CHECK)
    }

    /// Background maintenance: CA rotation and certificate renewal.
    /// Failures keep the previous material active and retry next pass.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let delay = self.next_check_delay();
            debug!(secs = delay.as_secs(), "next certificate maintenance");
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.rotate_ca_if_expired() {
                Ok(true) => info!("certificate authority replaced"),
                Ok(false) => {}
                Err(e) => error!(error = %e, "CA rotation failed"),
            }
            match self.renew_expiring() {
                Ok(0) => {}
                Ok(count) => info!(count, "certificates renewed"),
                Err(e) => error!(error = %e, "certificate renewal failed"),
            }
        }
    }
}

fn generate_ca(store: &Store, config: &CmsConfig) -> ConduitResult<CaState> {
    let profile = &config.ca;
    let (years, months, days) = parse_not_after(&profile.not_after)?;

    let private_key = new_rsa_key()?;
    let (key_pair, pkcs8) = rcgen_key(&private_key)?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::OrganizationName, profile.organization.clone());
    params
        .distinguished_name
        .push(DnType::CommonName, profile.common_name.clone());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = add_date(now, years, months, days);
    let expiration = params.not_after.unix_timestamp();

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| cert_err("self-sign CA", e))?;
    let der = cert.der().as_ref().to_vec();

    store.put_ca(
        &profile.organization,
        &profile.common_name,
        &profile.not_after,
        expiration,
        der.clone(),
        pkcs8,
    )?;

    Ok(CaState {
        cert,
        key: key_pair,
        der,
        expiration,
    })
}

/// Rebuild signing state from a persisted CA. The issuer certificate is
/// re-assembled from the stored DER and key; subject and key material are
/// preserved, so chains anchored at the stored DER keep verifying.
fn load_ca_state(record: &crate::store::CaRecord) -> ConduitResult<CaState> {
    let key_pair =
        KeyPair::try_from(record.key.as_slice()).map_err(|e| cert_err("load CA key", e))?;
    let der = record.cert.clone().into();
    let params =
        CertificateParams::from_ca_cert_der(&der).map_err(|e| cert_err("parse CA cert", e))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| cert_err("rebuild CA", e))?;
    Ok(CaState {
        cert,
        key: key_pair,
        der: record.cert.clone(),
        expiration: record.expiration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn config() -> CmsConfig {
        CmsConfig {
            ca: CertProfile {
                not_after: "1,0,0".to_string(),
                common_name: "Conduit CA".to_string(),
                organization: "Conduit".to_string(),
            },
            cert: CertProfile {
                not_after: "0,1,0".to_string(),
                common_name: "Conduit".to_string(),
                organization: "Conduit".to_string(),
            },
            renew_before: Duration::from_secs(7 * 24 * 3600),
        }
    }

    #[test]
    fn window_parsing() {
        assert_eq!(parse_not_after("1,2,3").unwrap(), (1, 2, 3));
        assert_eq!(parse_not_after("0,1,0").unwrap(), (0, 1, 0));
        assert_eq!(parse_not_after("2").unwrap(), (2, 0, 0));
        // Malformed fields read as zero; an empty window is an error.
        assert_eq!(parse_not_after("1,x,5").unwrap(), (1, 0, 5));
        assert!(parse_not_after("0,0,0").is_err());
        assert!(parse_not_after("").is_err());
    }

    #[test]
    fn date_addition_normalizes_overflow() {
        let base = datetime!(2024-01-31 12:00 UTC);
        // Jan 31 + 1 month: Feb 1 + 30 days = Mar 2 (leap year).
        let bumped = add_date(base, 0, 1, 0);
        assert_eq!(bumped.date(), datetime!(2024-03-02 12:00 UTC).date());

        let bumped = add_date(base, 1, 0, 0);
        assert_eq!(bumped.date(), datetime!(2025-01-31 12:00 UTC).date());

        // Month arithmetic crosses year boundaries.
        let base = datetime!(2024-11-15 00:00 UTC);
        let bumped = add_date(base, 0, 3, 0);
        assert_eq!(bumped.date(), datetime!(2025-02-15 00:00 UTC).date());
    }

    #[test]
    fn san_keys_are_canonical() {
        let a: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let b: Ipv4Addr = "10.0.0.10".parse().unwrap();
        assert_eq!(canonical_san(&[b, a]), canonical_san(&[a, b, a]));
        assert_eq!(parse_san_key("10.0.0.2,10.0.0.10").len(), 2);
        assert!(parse_san_key(CLIENT_SAN).is_empty());
    }

    #[test]
    fn issue_cache_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = Arc::new(Store::open(&path).unwrap());
        let cms = Cms::init(store, config()).unwrap();

        let ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let issued = cms.server_material(&[ip]).unwrap();
        assert!(!issued.ca.is_empty());
        assert!(!issued.cert.is_empty());
        assert!(!issued.key.is_empty());
        assert_eq!(issued.ca, cms.ca_der());

        // Second request is served from the cache.
        let cached = cms.server_material(&[ip]).unwrap();
        assert_eq!(issued.cert, cached.cert);

        let client = cms.client_material().unwrap();
        assert_ne!(client.cert, issued.cert);

        // A restart reloads the same CA and keeps serving the same cert.
        let reloaded = Cms::init(Arc::new(Store::open(&path).unwrap()), config()).unwrap();
        assert_eq!(reloaded.ca_der(), issued.ca);
        let after_reload = reloaded.server_material(&[ip]).unwrap();
        assert_eq!(after_reload.cert, issued.cert);
    }
}
