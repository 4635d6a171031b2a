//! Session configuration.

use crate::error::{PortalError, PortalResult};
use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client identifier sent on every request.
pub const DEFAULT_USER_AGENT: &str = concat!("DevicePortalClient/", env!("CARGO_PKG_VERSION"));

/// Configuration for one device portal session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Device address, with or without scheme (blank = local default).
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Use https for non-loopback devices.
    #[serde(default = "default_true")]
    pub requires_https: bool,
    /// Per-request timeout in seconds (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// WebSocket connect timeout in seconds (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Install-state poll interval in milliseconds (default 500).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for an install; `None` waits until cancelled.
    #[serde(default)]
    pub install_timeout_secs: Option<u64>,
    /// Re-point the connection at the device's own reported address on connect.
    #[serde(default)]
    pub update_from_network: bool,
    /// Keep the current port when re-pointing from network configuration.
    #[serde(default = "default_true")]
    pub preserve_port: bool,
    /// JSON field naming the tag of an event-channel frame.
    #[serde(default = "default_tag_field")]
    pub event_tag_field: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_true() -> bool {
    true
}
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    500
}
fn default_tag_field() -> String {
    "Type".to_string()
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            password: String::new(),
            requires_https: true,
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
            install_timeout_secs: None,
            update_from_network: false,
            preserve_port: true,
            event_tag_field: default_tag_field(),
            user_agent: default_user_agent(),
        }
    }
}

impl PortalConfig {
    pub fn new(address: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            username: credentials.username,
            password: credentials.password,
            ..Default::default()
        }
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> PortalResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PortalError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: PortalConfig = serde_json::from_str(&text)
            .map_err(|e| PortalError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PortalResult<()> {
        if self.request_timeout_secs == 0 {
            return Err(PortalError::Config("request_timeout_secs must be > 0".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(PortalError::Config("connect_timeout_secs must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(PortalError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.event_tag_field.trim().is_empty() {
            return Err(PortalError::Config("event_tag_field must not be empty".into()));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn install_timeout(&self) -> Option<Duration> {
        self.install_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_from_empty_json() {
        let cfg: PortalConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.requires_https);
        assert_eq!(cfg.request_timeout_secs, 30);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.event_tag_field, "Type");
        assert!(cfg.install_timeout().is_none());
        assert!(cfg.user_agent.starts_with("DevicePortalClient/"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"address":"192.168.1.5","username":"admin","install_timeout_secs":120}}"#
        )
        .unwrap();
        let cfg = PortalConfig::load(file.path()).unwrap();
        assert_eq!(cfg.address, "192.168.1.5");
        assert_eq!(cfg.credentials().username, "admin");
        assert_eq!(cfg.install_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn load_rejects_zero_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"request_timeout_secs":0}}"#).unwrap();
        assert!(matches!(
            PortalConfig::load(file.path()),
            Err(PortalError::Config(_))
        ));
    }

    #[test]
    fn load_missing_file() {
        assert!(matches!(
            PortalConfig::load("/definitely/not/here.json"),
            Err(PortalError::Config(_))
        ));
    }

    #[test]
    fn validate_rules() {
        tokio_test::assert_ok!(PortalConfig::default().validate());
        let mut cfg = PortalConfig::default();
        cfg.event_tag_field = "  ".into();
        tokio_test::assert_err!(cfg.validate());
        let mut cfg = PortalConfig::default();
        cfg.connect_timeout_secs = 0;
        tokio_test::assert_err!(cfg.validate());
    }
}
