//! # Device Portal client core
//!
//! Transport and session layer for a device's management portal, spoken
//! over HTTP(S) and WebSocket.
//!
//! ## Modules
//!
//! - **types**: Wire types (device family, OS info, network config, install status)
//! - **error**: Crate-specific error types
//! - **config**: Session configuration
//! - **connection**: Base address, scheme and WebSocket address resolution
//! - **transport**: HTTP transport trait + reqwest adapter
//! - **rest**: CSRF-protected REST invocation
//! - **certificate**: Device root-certificate fetch and trust
//! - **events**: WebSocket event channel with typed subscriptions
//! - **install**: Package install workflow (polling or event-driven)
//! - **service**: Session façade

pub mod types;
pub mod error;
pub mod config;
pub mod connection;
pub mod transport;
pub mod rest;
pub mod certificate;
pub mod events;
pub mod install;
pub mod service;

pub use certificate::{Certificate, CertificateTrustBootstrapper, DirectoryTrustStore, TrustOutcome, TrustStore};
pub use config::PortalConfig;
pub use connection::ConnectionDescriptor;
pub use error::{PortalError, PortalResult, ProtocolFailure};
pub use events::{ChannelState, EventChannel, SubscriptionId};
pub use install::{InstallRequest, InstallStrategy, OperationTracker, WaitOptions};
pub use rest::RestInvoker;
pub use service::PortalSession;
pub use transport::{MultipartPart, PortalRequest, PortalResponse, PortalTransport, ReqwestTransport, RequestBody};
pub use types::*;
