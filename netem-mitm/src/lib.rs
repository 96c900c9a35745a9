#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! TLS interception for the netem emulator.
//!
//! [`MitmConfig`] owns a throwaway root certificate authority. Clients under test trust it
//! through [`MitmConfig::cert_pool`], and servers or relays inside the emulation terminate TLS
//! with [`MitmConfig::tls_config`], which impersonates whatever host the client asks for.

use std::{fmt, net::IpAddr, sync::Arc};

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};
use rustc_hash::FxHashMap;
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::{self, CertifiedKey},
    RootCertStore, ServerConfig,
};
use thiserror::Error;
use time::OffsetDateTime;

const ROOT_COMMON_NAME: &str = "netem MITM root";

/// How far back certificates are valid from, to tolerate clock skew.
const BACKDATE: time::Duration = time::Duration::minutes(5);
/// How long certificates stay valid for.
const LIFETIME: time::Duration = time::Duration::hours(24);

#[derive(Debug, Error)]
pub enum Error {
    /// rcgen could not build or sign a certificate.
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    /// rustls cannot sign with the generated key.
    #[error("unsupported private key: {0}")]
    Key(#[from] sign::SignError),
}

/// A root certificate authority plus the material minted from it.
pub struct MitmConfig {
    resolver: Arc<LeafResolver>,
}

impl fmt::Debug for MitmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MitmConfig").field("resolver", &self.resolver).finish()
    }
}

impl MitmConfig {
    /// Generates a fresh root certificate authority, valid for the next 24 hours.
    ///
    /// # Panics
    ///
    /// If the certificate cannot be generated. Use [`MitmConfig::try_new`] to handle the error.
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(config) => config,
            Err(e) => panic!("cannot generate MITM root certificate: {e}"),
        }
    }

    pub fn try_new() -> Result<Self, Error> {
        let (not_before, not_after) = validity();

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name = distinguished_name(ROOT_COMMON_NAME);
        params.not_before = not_before;
        params.not_after = not_after;

        let root = Certificate::from_params(params)?;
        // Every serialization re-signs the certificate, so the DER is produced exactly once.
        let root_der = root.serialize_der()?;

        tracing::debug!(?not_before, ?not_after, "generated MITM root certificate");

        Ok(Self { resolver: Arc::new(LeafResolver::new(root, root_der)) })
    }

    /// The DER-encoded root certificate.
    pub fn root_certificate(&self) -> rustls::Certificate {
        rustls::Certificate(self.resolver.root_der.clone())
    }

    /// A trust store containing only the root certificate.
    pub fn cert_pool(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(&[self.resolver.root_der.clone()]);
        debug_assert_eq!((added, ignored), (1, 0));
        roots
    }

    /// A server configuration presenting, for whatever server name the client requests, a leaf
    /// certificate signed by the root.
    ///
    /// Leaves are cached by name and shared by every configuration returned from this instance.
    /// Clients that don't send a server name fail the handshake.
    pub fn tls_config(&self) -> Arc<ServerConfig> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(&self.resolver) as Arc<dyn ResolvesServerCert>);

        Arc::new(config)
    }
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn validity() -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    (now - BACKDATE, now + LIFETIME)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}

/// Mints leaf certificates on demand during the handshake.
struct LeafResolver {
    root: Certificate,
    root_der: Vec<u8>,
    leaves: Mutex<FxHashMap<String, Arc<CertifiedKey>>>,
}

impl fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafResolver").field("leaves", &self.leaves.lock().len()).finish()
    }
}

impl LeafResolver {
    fn new(root: Certificate, root_der: Vec<u8>) -> Self {
        Self { root, root_der, leaves: Mutex::default() }
    }

    /// Returns the leaf for `server_name`, minting it on first use.
    fn certified_key(&self, server_name: &str) -> Result<Arc<CertifiedKey>, Error> {
        let server_name = server_name.to_ascii_lowercase();

        let mut leaves = self.leaves.lock();
        if let Some(leaf) = leaves.get(&server_name) {
            return Ok(Arc::clone(leaf));
        }

        let leaf = Arc::new(self.mint(&server_name)?);
        leaves.insert(server_name, Arc::clone(&leaf));
        Ok(leaf)
    }

    fn mint(&self, server_name: &str) -> Result<CertifiedKey, Error> {
        let (not_before, not_after) = validity();

        let san = match server_name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(server_name.to_owned()),
        };

        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![san];
        params.distinguished_name = distinguished_name(server_name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = not_before;
        params.not_after = not_after;

        let leaf = Certificate::from_params(params)?;
        let leaf_der = leaf.serialize_der_with_signer(&self.root)?;
        let key = sign::any_supported_type(&rustls::PrivateKey(leaf.serialize_private_key_der()))?;

        tracing::debug!(server_name, "minted leaf certificate");

        let chain = vec![rustls::Certificate(leaf_der), rustls::Certificate(self.root_der.clone())];
        Ok(CertifiedKey::new(chain, key))
    }
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            tracing::debug!("ClientHello without server name, no certificate to present");
            return None;
        };

        match self.certified_key(server_name) {
            Ok(leaf) => Some(leaf),
            Err(e) => {
                tracing::warn!(%e, server_name, "cannot mint leaf certificate");
                None
            }
        }
    }
}
