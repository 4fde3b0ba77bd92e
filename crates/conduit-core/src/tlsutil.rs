//! rustls config assembly for the tunnel and control-plane endpoints.
//!
//! Two sources of identity material: PEM files named in the YAML config,
//! and DER material issued by the manager over RPC (`TlsMaterial`: DER
//! certificates plus a PKCS#1 RSA private key).

use crate::error::{ConduitError, ConduitResult};
use crate::netcfg::TlsFileConfig;
use crate::proto::TlsMaterial;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, ServerName, UnixTime,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;

/// Parse a `"host"` into a rustls server name (DNS name or IP literal).
pub fn server_name(host: &str) -> ConduitResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ConduitError::InvalidAddress(host.to_string()))
}

fn read_pem_certs(path: &str) -> ConduitResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| ConduitError::Tls(format!("cannot read cert {path}: {e}")))?;
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConduitError::Tls(format!("bad PEM in {path}: {e}")))
}

fn read_pem_key(path: &str) -> ConduitResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| ConduitError::Tls(format!("cannot read key {path}: {e}")))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| ConduitError::Tls(format!("bad PEM in {path}: {e}")))?
        .ok_or_else(|| ConduitError::Tls(format!("no private key found in {path}")))
}

fn root_store_from_files(paths: &[String]) -> ConduitResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for path in paths {
        for cert in read_pem_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| ConduitError::Tls(format!("bad CA cert in {path}: {e}")))?;
        }
    }
    Ok(roots)
}

/// The certificate chain and key the local side presents, if configured.
fn identity_from_files(
    tls: &TlsFileConfig,
) -> ConduitResult<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    let Some(pair) = tls.certs.first() else {
        return Ok(None);
    };
    let chain = read_pem_certs(&pair.cert)?;
    let key = read_pem_key(&pair.key)?;
    Ok(Some((chain, key)))
}

/// Build a dialing config from file-backed TLS settings.
///
/// Callers must have checked `tls.enable`; mtls vs tls vs skip-verify is
/// resolved here, once, into the returned config.
pub fn client_config_from_files(tls: &TlsFileConfig) -> ConduitResult<ClientConfig> {
    let identity = identity_from_files(tls)?;

    let builder = ClientConfig::builder();
    if tls.insecure_skip_verify {
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()));
        return Ok(match identity {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        });
    }

    let roots = root_store_from_files(&tls.ca_certs)?;
    let builder = builder.with_root_certificates(roots);
    Ok(match identity {
        Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
        None => builder.with_no_client_auth(),
    })
}

/// Build a listening config from file-backed TLS settings. `mtls` requires
/// client certificates chained to the configured CAs.
pub fn server_config_from_files(tls: &TlsFileConfig) -> ConduitResult<ServerConfig> {
    let (chain, key) = identity_from_files(tls)?
        .ok_or_else(|| ConduitError::Tls("tls listener needs a certificate".to_string()))?;

    if tls.mtls {
        let roots = root_store_from_files(&tls.ca_certs)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ConduitError::Tls(e.to_string()))?;
        Ok(ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?)
    } else {
        Ok(ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)?)
    }
}

/// Build the mutual-TLS dialing config from manager-issued DER material.
pub fn client_config_from_material(material: &TlsMaterial) -> ConduitResult<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(material.ca.clone()))
        .map_err(|e| ConduitError::Tls(format!("bad issued CA: {e}")))?;
    let chain = vec![CertificateDer::from(material.cert.clone())];
    let key = PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(material.key.clone()));
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?)
}

/// Build the mutual-TLS listening config from manager-issued DER material.
pub fn server_config_from_material(material: &TlsMaterial) -> ConduitResult<ServerConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(material.ca.clone()))
        .map_err(|e| ConduitError::Tls(format!("bad issued CA: {e}")))?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ConduitError::Tls(e.to_string()))?;
    let chain = vec![CertificateDer::from(material.cert.clone())];
    let key = PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(material.key.clone()));
    Ok(ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)?)
}

/// Certificate verifier that accepts any server certificate
/// (`insecure_skip_verify`). Signatures are still checked so the handshake
/// remains well-formed.
#[derive(Debug)]
pub struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl NoVerification {
    pub fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl Default for NoVerification {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
