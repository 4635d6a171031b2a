//! Root-certificate trust bootstrap.
//!
//! The device serves its own root certificate at `config/rootcertificate`.
//! Fetching tries https first and falls back to http exactly once; a
//! certificate is only handed back when its issuer names the expected
//! authority.
//!
//! Trust is established one of two ways:
//!
//! - installed into a [`TrustStore`] (persists beyond this session)
//! - pinned into the transport's TLS-validation hook, with the raw bytes
//!   returned to the caller for its own validation callback

use crate::connection::ConnectionDescriptor;
use crate::error::{PortalError, PortalResult};
use crate::rest::USER_AGENT_HEADER;
use crate::transport::{PortalRequest, PortalTransport};
use base64::Engine;
use log::{debug, info, warn};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use url::Url;
use x509_parser::parse_x509_certificate;

pub const ROOT_CERTIFICATE_PATH: &str = "config/rootcertificate";

/// Issuer substring a device root certificate must carry.
pub const EXPECTED_ISSUER: &str = "Microsoft Windows Web Management";

// ─── Certificate ────────────────────────────────────────────────────────────

/// A DER certificate with the identity fields read from it.
#[derive(Clone, PartialEq)]
pub struct Certificate {
    der: Vec<u8>,
    issuer: String,
    subject: String,
}

impl Certificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> PortalResult<Self> {
        let der = der.into();
        let (issuer, subject) = {
            let (_, cert) = parse_x509_certificate(&der)
                .map_err(|e| PortalError::trust(format!("Unreadable certificate: {}", e)))?;
            (cert.issuer().to_string(), cert.subject().to_string())
        };
        Ok(Self {
            der,
            issuer,
            subject,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn into_der(self) -> Vec<u8> {
        self.der
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Hex SHA-256 of the DER bytes.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    pub fn to_pem(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(&self.der);
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for line in b64.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    fn ensure_issuer(&self, expected: &str) -> PortalResult<()> {
        if self.issuer.contains(expected) {
            Ok(())
        } else {
            Err(PortalError::trust(format!(
                "issuer '{}' does not contain '{}'",
                self.issuer, expected
            )))
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("issuer", &self.issuer)
            .field("subject", &self.subject)
            .field("len", &self.der.len())
            .finish()
    }
}

// ─── Trust stores ───────────────────────────────────────────────────────────

/// A place certificates can be installed as trust anchors.
///
/// Installing is a side effect outside the session's lifecycle: the
/// anchor stays trusted after the session is dropped, for every consumer
/// of the store.
pub trait TrustStore: Send + Sync {
    fn install(&self, certificate: &Certificate) -> PortalResult<()>;
}

/// Writes anchors as PEM files into a directory, one file per
/// fingerprint (e.g. `/usr/local/share/ca-certificates`).
#[derive(Debug, Clone)]
pub struct DirectoryTrustStore {
    dir: PathBuf,
}

impl DirectoryTrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, certificate: &Certificate) -> PathBuf {
        self.dir.join(format!("devportal-{}.crt", certificate.fingerprint()))
    }
}

impl TrustStore for DirectoryTrustStore {
    fn install(&self, certificate: &Certificate) -> PortalResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            PortalError::TrustStore(format!("cannot create {}: {}", self.dir.display(), e))
        })?;
        let path = self.path_for(certificate);
        if path.exists() {
            debug!("Trust anchor already present at {}", path.display());
            return Ok(());
        }
        std::fs::write(&path, certificate.to_pem()).map_err(|e| {
            PortalError::TrustStore(format!("cannot write {}: {}", path.display(), e))
        })?;
        info!("Installed device root certificate at {}", path.display());
        Ok(())
    }
}

/// How trust was established.
#[derive(Debug, Clone, PartialEq)]
pub enum TrustOutcome {
    /// Written to a trust store.
    Installed,
    /// Pinned into the transport; the DER bytes are returned for any
    /// other TLS validation callback the caller maintains.
    Pinned(Vec<u8>),
}

// ─── Bootstrapper ───────────────────────────────────────────────────────────

pub struct CertificateTrustBootstrapper {
    transport: Arc<dyn PortalTransport>,
    connection: Arc<RwLock<ConnectionDescriptor>>,
    user_agent: String,
    expected_issuer: String,
}

impl CertificateTrustBootstrapper {
    pub fn new(
        transport: Arc<dyn PortalTransport>,
        connection: Arc<RwLock<ConnectionDescriptor>>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            connection,
            user_agent: user_agent.into(),
            expected_issuer: EXPECTED_ISSUER.to_string(),
        }
    }

    /// Override the expected issuer substring.
    pub fn with_expected_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = issuer.into();
        self
    }

    /// Fetch and validate the device root certificate.
    ///
    /// Any failure over https (transport, status, unreadable or untrusted
    /// certificate) triggers one http attempt, whose failure is returned.
    pub async fn fetch_root_certificate(&self, allow_untrusted: bool) -> PortalResult<Certificate> {
        let (https_url, http_url) = {
            let conn = self
                .connection
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (
                conn.with_scheme("https")?.join(ROOT_CERTIFICATE_PATH)?,
                conn.with_scheme("http")?.join(ROOT_CERTIFICATE_PATH)?,
            )
        };

        match self.fetch_from(https_url.clone(), allow_untrusted).await {
            Ok(cert) => Ok(cert),
            Err(e) => {
                warn!(
                    "Root certificate fetch over {} failed ({}); retrying over http",
                    https_url, e
                );
                self.fetch_from(http_url, false).await
            }
        }
    }

    async fn fetch_from(&self, url: Url, allow_untrusted: bool) -> PortalResult<Certificate> {
        let credentials = self
            .connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .credentials()
            .clone();
        let mut request = PortalRequest::new(Method::GET, url.clone())
            .header(USER_AGENT_HEADER, self.user_agent.as_str());
        request.credentials = Some(credentials);
        request.allow_untrusted = allow_untrusted;

        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(PortalError::protocol(
                response.status,
                response.reason,
                url.as_str(),
            ));
        }
        if response.body.is_empty() {
            return Err(PortalError::protocol(response.status, "no content", url.as_str()));
        }

        let cert = Certificate::from_der(response.body.to_vec())?;
        cert.ensure_issuer(&self.expected_issuer)?;
        debug!("Fetched root certificate from {} (issuer {})", url, cert.issuer());
        Ok(cert)
    }

    /// Establish trust in a validated certificate.
    pub fn trust(
        &self,
        certificate: Certificate,
        store: Option<&dyn TrustStore>,
    ) -> PortalResult<TrustOutcome> {
        match store {
            Some(store) => {
                store.install(&certificate)?;
                Ok(TrustOutcome::Installed)
            }
            None => {
                self.transport.trust_root(certificate.der())?;
                Ok(TrustOutcome::Pinned(certificate.into_der()))
            }
        }
    }
}
