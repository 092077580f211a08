use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use thiserror::Error;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{handler, ProxyState};
use crate::auth::Upstream;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to read CA material: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid CA material: {0}")]
    Material(#[from] rcgen::Error),
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}

#[derive(Debug, Error)]
pub enum MitmError {
    #[error(transparent)]
    Ca(#[from] CaError),
    #[error("TLS handshake with client failed: {0}")]
    Handshake(#[from] std::io::Error),
    #[error("intercepted connection failed: {0}")]
    Http(#[from] hyper::Error),
}

/// Local certificate authority used to terminate TLS in MITM mode. Leaf
/// certificates are minted per host and cached; issuance is cheap but not
/// free, and every tab re-CONNECTs.
pub struct MitmAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    leaf_configs: DashMap<String, Arc<ServerConfig>>,
}

impl std::fmt::Debug for MitmAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmAuthority").finish_non_exhaustive()
    }
}

impl MitmAuthority {
    /// Generates a fresh self-signed CA for this process.
    pub fn generate() -> Result<Self, CaError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "SmartProxy CA");
        dn.push(DnType::OrganizationName, "SmartProxy");
        params.distinguished_name = dn;

        let cert = params.self_signed(&key)?;
        Ok(Self {
            ca_cert: cert,
            ca_key: key,
            leaf_configs: DashMap::new(),
        })
    }

    /// Loads a custom CA key pair saved as PEM files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let cert = params.self_signed(&key)?;
        Ok(Self {
            ca_cert: cert,
            ca_key: key,
            leaf_configs: DashMap::new(),
        })
    }

    /// PEM of the CA certificate, for clients that need to trust it.
    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Returns the TLS server config presenting a leaf certificate for
    /// `host`, minting and caching it on first use.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        let key = host.to_ascii_lowercase();
        if let Some(config) = self.leaf_configs.get(&key) {
            return Ok(config.value().clone());
        }

        debug!(host = %key, "issuing leaf certificate");
        let mut params = CertificateParams::new(vec![key.clone()])?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params
            .distinguished_name
            .push(DnType::CommonName, key.as_str());

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;
        let key_der = PrivateKeyDer::Pkcs8(leaf_key.serialized_der().to_vec().into());

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf_cert.der().clone()], key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.leaf_configs.insert(key, config.clone());
        Ok(config)
    }
}

/// Terminates TLS on an upgraded CONNECT stream and serves the inner
/// requests with the upstream chosen during the CONNECT phase, so inner
/// requests skip re-authentication.
pub(crate) async fn serve_intercepted(
    state: Arc<ProxyState>,
    authority: Arc<MitmAuthority>,
    upgraded: Upgraded,
    upstream: Upstream,
    host: String,
) -> Result<(), MitmError> {
    let config = authority.server_config(&host)?;
    let acceptor = TlsAcceptor::from(config);
    let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await?;
    debug!(%host, "TLS terminated for intercepted tunnel");

    let service = service_fn(move |req| {
        handler::handle_request(state.clone(), req, Some(upstream.clone()), "https")
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), service)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ca_issues_cached_leaves() {
        let authority = MitmAuthority::generate().expect("generate CA");
        assert!(authority
            .ca_cert_pem()
            .starts_with("-----BEGIN CERTIFICATE-----"));

        let first = authority.server_config("example.com").expect("mint leaf");
        let again = authority
            .server_config("EXAMPLE.COM")
            .expect("cached leaf");
        assert!(Arc::ptr_eq(&first, &again), "leaf config must be cached");

        let other = authority.server_config("other.test").expect("second leaf");
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn custom_ca_round_trips_through_pem_files() {
        let generated = MitmAuthority::generate().expect("generate CA");
        let dir = tempfile::tempdir().expect("temp dir");
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca.key");
        std::fs::write(&cert_path, generated.ca_cert_pem()).expect("write cert");
        std::fs::write(&key_path, generated.ca_key.serialize_pem()).expect("write key");

        let loaded = MitmAuthority::from_pem_files(&cert_path, &key_path).expect("load CA");
        loaded
            .server_config("inner.example.com")
            .expect("loaded CA signs leaves");
    }

    #[test]
    fn missing_ca_files_fail_loading() {
        let err = MitmAuthority::from_pem_files(
            Path::new("/nonexistent/ca.pem"),
            Path::new("/nonexistent/ca.key"),
        )
        .expect_err("missing files must fail");
        assert!(matches!(err, CaError::Io(_)));
    }
}
