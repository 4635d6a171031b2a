//! # devportal
//!
//! Entry crate for the Device Portal client. Re-exports
//! [`devportal_core`] and owns process-wide setup: logging and the TLS
//! crypto provider.

pub use devportal_core::*;

use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install the `tracing` subscriber and route `log` records into it.
///
/// `RUST_LOG` wins over `default_filter` when set. With the `logs-json`
/// feature lines are written as JSON objects. Fails if a global
/// subscriber is already installed.
pub fn init_logging(default_filter: &str) -> PortalResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    #[cfg(feature = "logs-json")]
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
    #[cfg(not(feature = "logs-json"))]
    let result = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    result.map_err(|e| PortalError::Config(format!("logging already initialised: {}", e)))?;
    tracing::debug!("Logging initialised");
    Ok(())
}

/// Select rustls' ring backend as the process default. The WebSocket
/// stack builds its TLS config from the process default; calling this
/// more than once is harmless.
pub fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }
}

/// Load a JSON configuration file and build a session from it.
pub fn open_session(config_path: impl AsRef<Path>) -> PortalResult<PortalSession> {
    install_crypto_provider();
    let config = PortalConfig::load(config_path)?;
    log::info!("Opening device portal session for '{}'", config.address);
    PortalSession::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn second_logging_init_fails() {
        let _ = init_logging("debug");
        assert_err!(init_logging("debug"));
    }

    #[test]
    fn crypto_provider_install_is_idempotent() {
        install_crypto_provider();
        install_crypto_provider();
    }

    #[test]
    fn open_session_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"address":"10.0.0.7","username":"admin","password":"pw"}}"#).unwrap();
        let session = assert_ok!(open_session(file.path()));
        assert_eq!(
            session.connection().address().as_deref(),
            Some("https://10.0.0.7")
        );
    }

    #[test]
    fn open_session_rejects_bad_address() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"address":"not a host"}}"#).unwrap();
        assert!(matches!(
            open_session(file.path()),
            Err(PortalError::AddressFormat(_))
        ));
    }
}
