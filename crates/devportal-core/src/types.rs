//! Data structures exchanged with the device portal.

use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Credentials ────────────────────────────────────────────────────────────

/// Username / password pair sent as HTTP basic auth.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

// ─── Device identity ────────────────────────────────────────────────────────

/// Device family reported by `api/os/devicefamily`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFamily {
    Desktop,
    Holographic,
    Xbox,
    IoT,
    Mobile,
    Unknown(String),
}

impl DeviceFamily {
    /// Parse the portal's `DeviceType` string (e.g. `Windows.Xbox`).
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Windows.Desktop" | "Windows.Team" => Self::Desktop,
            "Windows.Holographic" => Self::Holographic,
            "Windows.Xbox" => Self::Xbox,
            "Windows.IoT" | "Windows.IoTUAP" => Self::IoT,
            "Windows.Mobile" => Self::Mobile,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether the device pushes install progress over the event channel.
    pub fn pushes_install_events(&self) -> bool {
        matches!(self, Self::Holographic | Self::Xbox)
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Desktop => write!(f, "Windows.Desktop"),
            Self::Holographic => write!(f, "Windows.Holographic"),
            Self::Xbox => write!(f, "Windows.Xbox"),
            Self::IoT => write!(f, "Windows.IoT"),
            Self::Mobile => write!(f, "Windows.Mobile"),
            Self::Unknown(raw) if raw.is_empty() => write!(f, "unknown device family"),
            Self::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

/// Body of `api/os/devicefamily`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFamilyInfo {
    #[serde(rename = "DeviceType", default)]
    pub device_type: String,
}

/// Body of `api/os/info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OsInfo {
    #[serde(default)]
    pub computer_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub os_edition: Option<String>,
    #[serde(default)]
    pub os_edition_id: Option<u32>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

// ─── Network configuration ──────────────────────────────────────────────────

/// Body of `api/networking/ipconfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    #[serde(rename = "Adapters", default)]
    pub adapters: Vec<NetworkAdapter>,
}

/// One network adapter; addresses are kept in the order the device lists them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkAdapter {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub hardware_address: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub adapter_type: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpAddressInfo {
    #[serde(rename = "IpAddress", default)]
    pub address: String,
    #[serde(rename = "Mask", default)]
    pub subnet_mask: String,
}

impl NetworkConfiguration {
    /// Convenience for building a single-adapter configuration.
    pub fn single_adapter<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            adapters: vec![NetworkAdapter {
                ip_addresses: addresses
                    .into_iter()
                    .map(|a| IpAddressInfo {
                        address: a.into(),
                        subnet_mask: String::new(),
                    })
                    .collect(),
                ..Default::default()
            }],
        }
    }
}

// ─── Install status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    #[default]
    None,
    InProgress,
    Completed,
    Failed,
}

impl InstallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Map the polled `api/app/packagemanager/state` status code.
    pub fn from_poll_status(status: u16) -> Self {
        match status {
            200 => Self::Completed,
            204 => Self::InProgress,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallPhase {
    #[default]
    Idle,
    UninstallingPreviousVersion,
    CopyingFile,
    Installing,
}

/// Progress of a package installation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallStatusEvent {
    #[serde(rename = "Status", alias = "status", default)]
    pub status: InstallStatus,
    #[serde(rename = "Phase", alias = "phase", default)]
    pub phase: InstallPhase,
    #[serde(rename = "Message", alias = "message", default)]
    pub message: String,
}

impl InstallStatusEvent {
    pub fn new(status: InstallStatus, phase: InstallPhase, message: impl Into<String>) -> Self {
        Self {
            status,
            phase,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ─── Error envelope ─────────────────────────────────────────────────────────

/// Error body some portal endpoints return alongside a failure status.
///
/// Two field spellings exist in the wild: `ErrorCode`/`ErrorMessage` and
/// the older `Code`/`Reason`. When a body carries both, the `Error*`
/// spelling wins.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawErrorEnvelope")]
pub struct ErrorEnvelope {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub success: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawErrorEnvelope {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    success: Option<bool>,
}

impl From<RawErrorEnvelope> for ErrorEnvelope {
    fn from(raw: RawErrorEnvelope) -> Self {
        Self {
            code: raw.error_code.or(raw.code),
            message: raw.error_message.or(raw.reason),
            success: raw.success,
        }
    }
}

impl ErrorEnvelope {
    /// Parse an envelope from a response body; anything unparseable or
    /// empty yields `None`.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let env: ErrorEnvelope = serde_json::from_slice(body).ok()?;
        if env.code.is_none() && env.message.is_none() {
            return None;
        }
        Some(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_family_parse() {
        assert_eq!(DeviceFamily::parse("Windows.Xbox"), DeviceFamily::Xbox);
        assert_eq!(DeviceFamily::parse("Windows.IoTUAP"), DeviceFamily::IoT);
        assert_eq!(
            DeviceFamily::parse("Windows.Fridge"),
            DeviceFamily::Unknown("Windows.Fridge".into())
        );
        assert_eq!(DeviceFamily::Holographic.to_string(), "Windows.Holographic");
    }

    #[test]
    fn install_events_capability() {
        assert!(DeviceFamily::Holographic.pushes_install_events());
        assert!(!DeviceFamily::Desktop.pushes_install_events());
    }

    #[test]
    fn poll_status_mapping() {
        assert_eq!(InstallStatus::from_poll_status(200), InstallStatus::Completed);
        assert_eq!(InstallStatus::from_poll_status(204), InstallStatus::InProgress);
        for code in [201, 202, 400, 404, 500] {
            assert_eq!(InstallStatus::from_poll_status(code), InstallStatus::Failed);
        }
        assert!(!InstallStatus::InProgress.is_terminal());
        assert!(InstallStatus::Failed.is_terminal());
    }

    #[test]
    fn envelope_both_spellings() {
        let a = ErrorEnvelope::parse(br#"{"ErrorCode":-123,"ErrorMessage":"bad"}"#).unwrap();
        assert_eq!(a.code, Some(-123));
        assert_eq!(a.message.as_deref(), Some("bad"));

        let b = ErrorEnvelope::parse(br#"{"Code":7,"Reason":"nope","Success":false}"#).unwrap();
        assert_eq!(b.code, Some(7));
        assert_eq!(b.message.as_deref(), Some("nope"));
        assert_eq!(b.success, Some(false));
    }

    #[test]
    fn envelope_with_both_spellings_merges() {
        let env = ErrorEnvelope::parse(
            br#"{"ErrorCode":-2147024891,"Code":5,"ErrorMessage":"Access is denied","Reason":"Forbidden"}"#,
        )
        .unwrap();
        assert_eq!(env.code, Some(-2147024891));
        assert_eq!(env.message.as_deref(), Some("Access is denied"));

        let partial = ErrorEnvelope::parse(br#"{"ErrorCode":3,"Reason":"from old field"}"#).unwrap();
        assert_eq!(partial.code, Some(3));
        assert_eq!(partial.message.as_deref(), Some("from old field"));
    }

    #[test]
    fn envelope_garbage_is_none() {
        assert!(ErrorEnvelope::parse(b"<html>oops</html>").is_none());
        assert!(ErrorEnvelope::parse(b"").is_none());
        assert!(ErrorEnvelope::parse(br#"{"Unrelated":1}"#).is_none());
    }

    #[test]
    fn install_event_decodes_lowercase_and_pascal() {
        let a: InstallStatusEvent = serde_json::from_str(
            r#"{"Status":"Failed","Phase":"Installing","Message":"disk full"}"#,
        )
        .unwrap();
        assert_eq!(a.status, InstallStatus::Failed);
        assert_eq!(a.phase, InstallPhase::Installing);

        let b: InstallStatusEvent =
            serde_json::from_str(r#"{"status":"InProgress","phase":"CopyingFile"}"#).unwrap();
        assert_eq!(b.status, InstallStatus::InProgress);
        assert_eq!(b.message, "");
    }

    #[test]
    fn network_config_decodes() {
        let cfg: NetworkConfiguration = serde_json::from_str(
            r#"{"Adapters":[{"Description":"Wi-Fi","Index":3,"Type":"Wireless",
                "IpAddresses":[{"IpAddress":"10.0.0.5","Mask":"255.255.255.0"}]}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.adapters.len(), 1);
        assert_eq!(cfg.adapters[0].ip_addresses[0].address, "10.0.0.5");
        assert_eq!(cfg.adapters[0].adapter_type, "Wireless");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let c = Credentials::new("admin", "hunter2");
        assert!(!format!("{:?}", c).contains("hunter2"));
    }
}
