//! HTTP transport abstraction.
//!
//! Everything above this module talks to the device through
//! [`PortalTransport`]; which HTTP/TLS stack sits underneath is decided
//! once, when the session is built. [`ReqwestTransport`] is the stock
//! adapter.

use crate::error::{PortalError, PortalResult};
use crate::types::Credentials;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{verify_server_cert_signed_by_trust_anchor, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

// ─── Request / response ─────────────────────────────────────────────────────

/// One file in a multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl MultipartPart {
    pub fn file(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let file_name = file_name.into();
        Self {
            name: file_name.clone(),
            file_name,
            content_type: "application/octet-stream".to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Bytes),
    Multipart(Vec<MultipartPart>),
}

#[derive(Debug, Clone)]
pub struct PortalRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub credentials: Option<Credentials>,
    pub body: RequestBody,
    /// Skip TLS validation for this request only.
    pub allow_untrusted: bool,
}

impl PortalRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            credentials: None,
            body: RequestBody::Empty,
            allow_untrusted: false,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortalResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// `Set-Cookie` pairs, in the order received.
    pub cookies: Vec<(String, String)>,
    pub body: Bytes,
}

impl PortalResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or_default()
                .to_string(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Last value of the named cookie.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ─── Transport trait ────────────────────────────────────────────────────────

#[async_trait]
pub trait PortalTransport: Send + Sync {
    /// Send one request and return the response, whatever its status.
    /// Only connection-level failures are errors here.
    async fn execute(&self, request: PortalRequest) -> PortalResult<PortalResponse>;

    /// TLS-validation hook: accept server chains rooted at this DER
    /// certificate from now on.
    fn trust_root(&self, der: &[u8]) -> PortalResult<()>;

    async fn get(&self, url: Url, headers: Vec<(String, String)>) -> PortalResult<PortalResponse> {
        self.send_simple(Method::GET, url, headers, RequestBody::Empty).await
    }

    async fn post(
        &self,
        url: Url,
        headers: Vec<(String, String)>,
        body: RequestBody,
    ) -> PortalResult<PortalResponse> {
        self.send_simple(Method::POST, url, headers, body).await
    }

    async fn put(
        &self,
        url: Url,
        headers: Vec<(String, String)>,
        body: RequestBody,
    ) -> PortalResult<PortalResponse> {
        self.send_simple(Method::PUT, url, headers, body).await
    }

    async fn delete(&self, url: Url, headers: Vec<(String, String)>) -> PortalResult<PortalResponse> {
        self.send_simple(Method::DELETE, url, headers, RequestBody::Empty).await
    }

    #[doc(hidden)]
    async fn send_simple(
        &self,
        method: Method,
        url: Url,
        headers: Vec<(String, String)>,
        body: RequestBody,
    ) -> PortalResult<PortalResponse> {
        let mut request = PortalRequest::new(method, url);
        request.headers = headers;
        request.body = body;
        self.execute(request).await
    }
}

// ─── reqwest adapter ────────────────────────────────────────────────────────

/// [`PortalTransport`] over `reqwest` + rustls.
///
/// Two clients are kept: a validating one and a lenient one for requests
/// flagged `allow_untrusted`. Once a root is pinned through
/// [`trust_root`](PortalTransport::trust_root) the validating client
/// accepts chains ending in that root for any host name, since devices
/// are usually dialed by IP.
pub struct ReqwestTransport {
    timeout: Duration,
    pinned_roots: RwLock<Vec<Vec<u8>>>,
    strict: RwLock<Client>,
    lenient: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> PortalResult<Self> {
        let strict = Self::build_client(timeout, &[], false)?;
        let lenient = Self::build_client(timeout, &[], true)?;
        Ok(Self {
            timeout,
            pinned_roots: RwLock::new(Vec::new()),
            strict: RwLock::new(strict),
            lenient,
        })
    }

    fn build_client(timeout: Duration, roots: &[Vec<u8>], lenient: bool) -> PortalResult<Client> {
        let mut builder = Client::builder().timeout(timeout);
        if lenient {
            builder = builder.danger_accept_invalid_certs(true);
        } else if !roots.is_empty() {
            builder = builder.use_preconfigured_tls(pinned_tls_config(roots)?);
        }
        builder
            .build()
            .map_err(|e| PortalError::transport(format!("Failed to build HTTP client: {}", e)))
    }

    fn client_for(&self, allow_untrusted: bool) -> Client {
        if allow_untrusted {
            return self.lenient.clone();
        }
        self.strict
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn to_form(parts: Vec<MultipartPart>) -> PortalResult<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for part in parts {
            let file = reqwest::multipart::Part::bytes(part.data.to_vec())
                .file_name(part.file_name)
                .mime_str(&part.content_type)
                .map_err(|e| PortalError::Serialization(format!("Invalid content type: {}", e)))?;
            form = form.part(part.name, file);
        }
        Ok(form)
    }
}

#[async_trait]
impl PortalTransport for ReqwestTransport {
    async fn execute(&self, request: PortalRequest) -> PortalResult<PortalResponse> {
        let client = self.client_for(request.allow_untrusted);
        debug!("HTTP {} {}", request.method, request.url);

        let mut builder = client.request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(creds) = request.credentials.as_ref().filter(|c| !c.is_empty()) {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(bytes) => builder.header(CONTENT_TYPE, "application/json").body(bytes),
            RequestBody::Multipart(parts) => builder.multipart(Self::to_form(parts)?),
        };

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PortalError::Timeout(format!(
                    "{} {} exceeded {:?}",
                    request.method, request.url, self.timeout
                ))
            } else {
                PortalError::transport(format!("{} {}: {}", request.method, request.url, e))
            }
        })?;

        let status = resp.status();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let cookies = resp
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let body = resp.bytes().await?;

        debug!("HTTP {} {} -> {}", request.method, request.url, status.as_u16());
        Ok(PortalResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            cookies,
            body,
        })
    }

    fn trust_root(&self, der: &[u8]) -> PortalResult<()> {
        let mut roots = self
            .pinned_roots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if roots.iter().any(|r| r.as_slice() == der) {
            return Ok(());
        }
        let mut candidate = roots.clone();
        candidate.push(der.to_vec());
        let client = Self::build_client(self.timeout, &candidate, false)?;
        *roots = candidate;
        *self
            .strict
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = client;
        info!("Pinned device root certificate ({} pinned)", roots.len());
        Ok(())
    }
}

// ─── Pinned-root verification ──────────────────────────────────────────────

fn pinned_tls_config(roots: &[Vec<u8>]) -> PortalResult<rustls::ClientConfig> {
    let verifier = PinnedRootVerifier::new(roots)?;
    let config = rustls::ClientConfig::builder_with_provider(verifier.provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| PortalError::trust(format!("TLS configuration rejected: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// Platform roots with full host-name checks, then pinned device roots
/// with the chain checked but the host name ignored.
#[derive(Debug)]
struct PinnedRootVerifier {
    platform: Option<Arc<WebPkiServerVerifier>>,
    pinned: RootCertStore,
    provider: Arc<CryptoProvider>,
}

impl PinnedRootVerifier {
    fn new(roots: &[Vec<u8>]) -> PortalResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut pinned = RootCertStore::empty();
        for der in roots {
            pinned
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| PortalError::trust(format!("Unusable root certificate: {}", e)))?;
        }

        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            debug!("Skipping platform root: {}", err);
        }
        let mut platform_roots = RootCertStore::empty();
        platform_roots.add_parsable_certificates(native.certs);
        let platform = if platform_roots.is_empty() {
            None
        } else {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(platform_roots), provider.clone())
                    .build()
                    .map_err(|e| {
                        PortalError::trust(format!("Cannot build platform verifier: {}", e))
                    })?;
            Some(verifier)
        };

        Ok(Self {
            platform,
            pinned,
            provider,
        })
    }
}

impl ServerCertVerifier for PinnedRootVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let platform_error = match &self.platform {
            Some(platform) => match platform.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(verified) => return Ok(verified),
                Err(e) => Some(e),
            },
            None => None,
        };

        let parsed = ParsedCertificate::try_from(end_entity)?;
        match verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.pinned,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        ) {
            Ok(()) => {
                debug!("{:?} presented a chain ending in a pinned root", server_name);
                Ok(ServerCertVerified::assertion())
            }
            Err(pinned_error) => Err(platform_error.unwrap_or(pinned_error)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

// ─── Test double ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = dyn Fn(&PortalRequest) -> PortalResult<PortalResponse> + Send + Sync;

    /// Transport answering from a closure and recording every request.
    pub(crate) struct ScriptedTransport {
        responder: Box<Responder>,
        pub(crate) requests: Mutex<Vec<PortalRequest>>,
        pub(crate) trusted: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new<F>(responder: F) -> Self
        where
            F: Fn(&PortalRequest) -> PortalResult<PortalResponse> + Send + Sync + 'static,
        {
            Self {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
                trusted: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn recorded(&self) -> Vec<PortalRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PortalTransport for ScriptedTransport {
        async fn execute(&self, request: PortalRequest) -> PortalResult<PortalResponse> {
            let result = (self.responder)(&request);
            self.requests.lock().unwrap().push(request);
            result
        }

        fn trust_root(&self, der: &[u8]) -> PortalResult<()> {
            self.trusted.lock().unwrap().push(der.to_vec());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_cookie_last_wins() {
        let resp = PortalResponse::new(200)
            .with_cookie("CSRF-Token", "one")
            .with_cookie("Other", "x")
            .with_cookie("CSRF-Token", "two");
        assert_eq!(resp.cookie("CSRF-Token"), Some("two"));
        assert_eq!(resp.cookie("Missing"), None);
    }

    #[test]
    fn response_reason_from_status() {
        assert_eq!(PortalResponse::new(404).reason, "Not Found");
        assert!(PortalResponse::new(204).is_success());
        assert!(!PortalResponse::new(302).is_success());
    }

    #[test]
    fn request_header_lookup_is_case_insensitive() {
        let req = PortalRequest::new(Method::GET, Url::parse("http://h/").unwrap())
            .header("X-CSRF-Token", "abc");
        assert_eq!(req.header_value("x-csrf-token"), Some("abc"));
    }

    #[test]
    fn multipart_part_defaults() {
        let part = MultipartPart::file("app.appx", vec![1u8, 2, 3]);
        assert_eq!(part.name, "app.appx");
        assert_eq!(part.content_type, "application/octet-stream");
        assert_eq!(part.data.len(), 3);
    }

    #[test]
    fn reqwest_transport_builds() {
        assert!(ReqwestTransport::new(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn reqwest_transport_rejects_garbage_root() {
        let t = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        assert!(t.trust_root(b"not a certificate").is_err());
    }
}
