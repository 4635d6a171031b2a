//! Error types for the Device Portal client.

use std::fmt;
use thiserror::Error;

/// Failure details for a non-success HTTP response.
///
/// `vendor_code` / `vendor_message` are only filled in when the response
/// body carried a parseable error envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolFailure {
    pub status: u16,
    pub reason: String,
    pub vendor_code: Option<i64>,
    pub vendor_message: Option<String>,
    pub request_uri: String,
}

impl fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {} {} ({})", self.status, self.reason, self.request_uri)?;
        match (&self.vendor_code, &self.vendor_message) {
            (Some(code), Some(msg)) => write!(f, "; device error {}: {}", code, msg),
            (Some(code), None) => write!(f, "; device error {}", code),
            (None, Some(msg)) => write!(f, "; {}", msg),
            (None, None) => Ok(()),
        }
    }
}

/// Unified error type for all Device Portal operations.
#[derive(Debug, Error)]
pub enum PortalError {
    /// Address text could not be turned into a usable URL.
    #[error("Invalid address: {0}")]
    AddressFormat(String),
    /// Connection / IO failure talking to the device.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The device answered with a non-success status.
    #[error("Protocol error: {0}")]
    Protocol(Box<ProtocolFailure>),
    /// The device certificate could not be trusted.
    #[error("Certificate not trusted: {0}")]
    CertificateTrust(String),
    /// A pushed WebSocket frame could not be understood.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    /// The connected device family does not support the operation.
    #[error("Operation '{operation}' is not supported on {family}")]
    UnsupportedOperation { operation: String, family: String },
    /// A caller-supplied deadline elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),
    /// The caller cancelled the operation.
    #[error("Cancelled: {0}")]
    Cancelled(String),
    /// JSON encode / decode failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Writing to a certificate trust store failed.
    #[error("Trust store error: {0}")]
    TrustStore(String),
    /// No live event channel.
    #[error("Not connected: {0}")]
    NotConnected(String),
    /// Configuration could not be loaded or is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PortalError {
    pub fn protocol(
        status: u16,
        reason: impl Into<String>,
        request_uri: impl Into<String>,
    ) -> Self {
        Self::Protocol(Box::new(ProtocolFailure {
            status,
            reason: reason.into(),
            vendor_code: None,
            vendor_message: None,
            request_uri: request_uri.into(),
        }))
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn trust(msg: impl Into<String>) -> Self {
        Self::CertificateTrust(msg.into())
    }

    pub fn unsupported(operation: impl Into<String>, family: impl fmt::Display) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            family: family.to_string(),
        }
    }

    /// Protocol failure details, if this is a protocol error.
    pub fn protocol_failure(&self) -> Option<&ProtocolFailure> {
        match self {
            Self::Protocol(failure) => Some(failure),
            _ => None,
        }
    }

    /// HTTP status carried by a protocol error.
    pub fn status(&self) -> Option<u16> {
        self.protocol_failure().map(|f| f.status)
    }
}

impl From<reqwest::Error> for PortalError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(format!("HTTP timeout: {e}"))
        } else if e.is_decode() {
            Self::Serialization(format!("Response decode failed: {e}"))
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for PortalError {
    fn from(e: url::ParseError) -> Self {
        Self::AddressFormat(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PortalError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(format!("WebSocket: {e}"))
    }
}

/// Convenience alias.
pub type PortalResult<T> = Result<T, PortalError>;

/// Convert PortalError to a String for UI command returns.
impl From<PortalError> for String {
    fn from(e: PortalError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_display_includes_vendor_details() {
        let err = PortalError::Protocol(Box::new(ProtocolFailure {
            status: 422,
            reason: "Unprocessable Entity".into(),
            vendor_code: Some(-123),
            vendor_message: Some("bad".into()),
            request_uri: "http://10.0.0.5/api/x".into(),
        }));
        let text = err.to_string();
        assert!(text.contains("422"));
        assert!(text.contains("-123"));
        assert!(text.contains("bad"));
        assert_eq!(err.status(), Some(422));
    }

    #[test]
    fn protocol_without_envelope() {
        let err = PortalError::protocol(500, "Internal Server Error", "http://h/api");
        let failure = err.protocol_failure().unwrap();
        assert!(failure.vendor_code.is_none());
        assert!(failure.vendor_message.is_none());
    }

    #[test]
    fn unsupported_names_family() {
        let err = PortalError::unsupported("install events", "Windows.Desktop");
        assert_eq!(
            err.to_string(),
            "Operation 'install events' is not supported on Windows.Desktop"
        );
    }

    #[test]
    fn into_string() {
        let s: String = PortalError::transport("refused").into();
        assert_eq!(s, "Transport error: refused");
    }
}
