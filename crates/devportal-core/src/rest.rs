//! Generic CSRF-protected REST invocation.
//!
//! Every call carries the client identifier and a CSRF header:
//!
//! | Verb                | Header         | Value                              |
//! |---------------------|----------------|------------------------------------|
//! | `GET`               | `CSRF-Token`   | stored token, or `Fetch` if none   |
//! | `POST`/`PUT`/`DELETE` | `X-CSRF-Token` | stored token (possibly empty)    |
//!
//! A successful response carrying a `CSRF-Token` cookie replaces the
//! stored token. Failures are mapped to [`PortalError::Protocol`],
//! enriched from the device's error envelope when one can be parsed.

use crate::connection::ConnectionDescriptor;
use crate::error::{PortalError, PortalResult, ProtocolFailure};
use crate::transport::{MultipartPart, PortalRequest, PortalResponse, PortalTransport, RequestBody};
use crate::types::ErrorEnvelope;
use bytes::Bytes;
use log::{debug, warn};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Name of the CSRF cookie and of the GET request header.
pub const CSRF_TOKEN_NAME: &str = "CSRF-Token";

/// Header carrying the token on mutating verbs.
pub const CSRF_MUTATING_HEADER: &str = "X-CSRF-Token";

/// GET header value before any token has been observed.
pub const CSRF_FETCH_SENTINEL: &str = "Fetch";

pub const USER_AGENT_HEADER: &str = "User-Agent";

/// Most recently observed CSRF token. Writers replace the whole value.
#[derive(Debug, Default)]
pub struct CsrfToken {
    cell: RwLock<Option<String>>,
}

impl CsrfToken {
    pub fn get(&self) -> Option<String> {
        self.cell
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, token: impl Into<String>) {
        *self
            .cell
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.into());
    }

    pub fn clear(&self) {
        *self
            .cell
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

/// Append URL-encoded query parameters to an API path.
pub fn path_with_query(path: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{}{}{}", path, sep, query)
}

/// Serialize a value as a JSON request body.
pub fn json_body<B: Serialize + ?Sized>(body: &B) -> PortalResult<RequestBody> {
    Ok(RequestBody::Json(Bytes::from(serde_json::to_vec(body)?)))
}

/// Executes REST calls against one device.
pub struct RestInvoker {
    transport: Arc<dyn PortalTransport>,
    connection: Arc<RwLock<ConnectionDescriptor>>,
    csrf: CsrfToken,
    user_agent: String,
}

impl RestInvoker {
    pub fn new(
        transport: Arc<dyn PortalTransport>,
        connection: Arc<RwLock<ConnectionDescriptor>>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            connection,
            csrf: CsrfToken::default(),
            user_agent: user_agent.into(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn PortalTransport> {
        &self.transport
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.csrf.get()
    }

    // ── Core ────────────────────────────────────────────────────────

    /// Execute a request; any non-success status becomes an error.
    pub async fn invoke(
        &self,
        method: Method,
        path_or_uri: &str,
        body: RequestBody,
    ) -> PortalResult<PortalResponse> {
        let (request_uri, response) = self.send(method, path_or_uri, body).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(Self::failure(&request_uri, &response))
        }
    }

    /// Execute a request and hand back the response whatever its status.
    /// Transport failures are still errors.
    pub async fn invoke_unchecked(
        &self,
        method: Method,
        path_or_uri: &str,
        body: RequestBody,
    ) -> PortalResult<PortalResponse> {
        self.send(method, path_or_uri, body).await.map(|(_, r)| r)
    }

    /// Execute a request and decode the JSON body.
    pub async fn invoke_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path_or_uri: &str,
        body: RequestBody,
    ) -> PortalResult<T> {
        let (request_uri, response) = self.send(method, path_or_uri, body).await?;
        if !response.is_success() {
            return Err(Self::failure(&request_uri, &response));
        }
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Err(PortalError::protocol(response.status, "no content", request_uri));
        }
        serde_json::from_slice(&response.body).map_err(|e| {
            PortalError::Serialization(format!("{} returned undecodable body: {}", request_uri, e))
        })
    }

    async fn send(
        &self,
        method: Method,
        path_or_uri: &str,
        body: RequestBody,
    ) -> PortalResult<(String, PortalResponse)> {
        let (url, credentials) = {
            let conn = self
                .connection
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (conn.resolve(path_or_uri)?, conn.credentials().clone())
        };
        let request_uri = url.to_string();

        let mut request = PortalRequest::new(method.clone(), url)
            .header(USER_AGENT_HEADER, self.user_agent.as_str());
        let token = self.csrf.get();
        request = if method == Method::GET {
            request.header(
                CSRF_TOKEN_NAME,
                token.unwrap_or_else(|| CSRF_FETCH_SENTINEL.to_string()),
            )
        } else {
            request.header(CSRF_MUTATING_HEADER, token.unwrap_or_default())
        };
        request.credentials = Some(credentials);
        request.body = body;

        let response = self.transport.execute(request).await?;

        if response.is_success() {
            if let Some(token) = response.cookie(CSRF_TOKEN_NAME) {
                debug!("CSRF token refreshed by {}", request_uri);
                self.csrf.replace(token);
            }
        }
        Ok((request_uri, response))
    }

    fn failure(request_uri: &str, response: &PortalResponse) -> PortalError {
        let envelope = ErrorEnvelope::parse(&response.body);
        warn!(
            "Device portal call {} failed: {} {}{}",
            request_uri,
            response.status,
            response.reason,
            envelope
                .as_ref()
                .and_then(|e| e.message.as_deref())
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        );
        PortalError::Protocol(Box::new(ProtocolFailure {
            status: response.status,
            reason: response.reason.clone(),
            vendor_code: envelope.as_ref().and_then(|e| e.code),
            vendor_message: envelope.and_then(|e| e.message),
            request_uri: request_uri.to_string(),
        }))
    }

    // ── Convenience verbs ───────────────────────────────────────────

    pub async fn get(&self, path: &str) -> PortalResult<Bytes> {
        Ok(self.invoke(Method::GET, path, RequestBody::Empty).await?.body)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> PortalResult<T> {
        self.invoke_json(Method::GET, path, RequestBody::Empty).await
    }

    /// Status code of a GET, without treating failures as errors.
    pub async fn get_status(&self, path: &str) -> PortalResult<u16> {
        Ok(self
            .invoke_unchecked(Method::GET, path, RequestBody::Empty)
            .await?
            .status)
    }

    pub async fn post(&self, path: &str, body: RequestBody) -> PortalResult<Bytes> {
        Ok(self.invoke(Method::POST, path, body).await?.body)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> PortalResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.invoke_json(Method::POST, path, json_body(body)?).await
    }

    pub async fn put(&self, path: &str, body: RequestBody) -> PortalResult<Bytes> {
        Ok(self.invoke(Method::PUT, path, body).await?.body)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> PortalResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.invoke_json(Method::PUT, path, json_body(body)?).await
    }

    pub async fn delete(&self, path: &str) -> PortalResult<()> {
        self.invoke(Method::DELETE, path, RequestBody::Empty).await?;
        Ok(())
    }

    pub async fn post_multipart(
        &self,
        path: &str,
        parts: Vec<MultipartPart>,
    ) -> PortalResult<PortalResponse> {
        self.invoke(Method::POST, path, RequestBody::Multipart(parts)).await
    }
}
