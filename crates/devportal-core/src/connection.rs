//! Connection descriptor: device address, scheme and credentials.
//!
//! Scheme resolution rules:
//!
//! - loopback / `localhost` devices always use `http`
//! - everything else uses `https` when the caller requires it, else `http`
//!
//! The descriptor never performs I/O; the session feeds it device data
//! (device family, OS info, network configuration) fetched elsewhere.

use crate::error::{PortalError, PortalResult};
use crate::types::{Credentials, DeviceFamily, NetworkConfiguration, OsInfo};
use log::{debug, info};
use std::net::IpAddr;
use url::{Host, Url};

/// Address used when the caller supplies none.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:10080";

/// Unspecified address the portal reports for unbound adapters.
const UNSPECIFIED_ADDRESS: &str = "0.0.0.0";

/// Prefix of link-local (APIPA) addresses.
const LINK_LOCAL_PREFIX: &str = "169.";

/// Address, scheme and identity of one device portal.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDescriptor {
    base: Option<Url>,
    /// Port as written or preserved; `Url` drops a scheme's default port.
    port: Option<u16>,
    credentials: Credentials,
    device_family: Option<DeviceFamily>,
    os_info: Option<OsInfo>,
}

impl ConnectionDescriptor {
    /// Build a descriptor for `address` (blank = [`DEFAULT_ADDRESS`]).
    pub fn create(
        address: &str,
        credentials: Credentials,
        requires_https: bool,
    ) -> PortalResult<Self> {
        let address = if address.trim().is_empty() {
            DEFAULT_ADDRESS
        } else {
            address.trim()
        };
        let authority = parse_authority(address)?;
        let base = build_base(&authority, requires_https)?;
        debug!("Device portal address resolved to {}", base);
        Ok(Self {
            base: Some(base),
            port: authority.port,
            credentials,
            device_family: None,
            os_info: None,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn base_address(&self) -> Option<&Url> {
        self.base.as_ref()
    }

    /// `scheme://authority` without the trailing slash.
    pub fn address(&self) -> Option<String> {
        self.base
            .as_ref()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
    }

    pub fn scheme(&self) -> Option<&str> {
        self.base.as_ref().map(|u| u.scheme())
    }

    pub fn is_https(&self) -> bool {
        self.scheme() == Some("https")
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }

    pub fn device_family(&self) -> Option<&DeviceFamily> {
        self.device_family.as_ref()
    }

    pub fn set_device_family(&mut self, family: DeviceFamily) {
        self.device_family = Some(family);
    }

    pub fn os_info(&self) -> Option<&OsInfo> {
        self.os_info.as_ref()
    }

    pub fn set_os_info(&mut self, info: OsInfo) {
        self.os_info = Some(info);
    }

    // ── Updates ─────────────────────────────────────────────────────

    /// Re-apply the scheme rules to the current authority.
    pub fn update_connection(&mut self, requires_https: bool) -> PortalResult<()> {
        let authority = self.authority()?;
        let rebuilt = build_base(&authority, requires_https)?;
        debug!(
            "Connection scheme updated: {} -> {}",
            self.require_base()?,
            rebuilt
        );
        self.base = Some(rebuilt);
        Ok(())
    }

    /// Point the descriptor at a new address.
    pub fn update_address(&mut self, address: &str, requires_https: bool) -> PortalResult<()> {
        let authority = parse_authority(address)?;
        let rebuilt = build_base(&authority, requires_https)?;
        info!("Connection address updated to {}", rebuilt);
        self.base = Some(rebuilt);
        self.port = authority.port;
        Ok(())
    }

    /// Re-point at the first usable address reported by the device.
    ///
    /// Adapters are scanned in order, then each adapter's addresses in
    /// order; `0.0.0.0` and `169.*` are skipped. Returns whether the
    /// connection changed. With `preserve_port` the current port is kept,
    /// including an implicit 80/443 when the scheme changes.
    pub fn update_connection_from_network(
        &mut self,
        config: &NetworkConfiguration,
        requires_https: bool,
        preserve_port: bool,
    ) -> PortalResult<bool> {
        let Some(candidate) = select_address(config) else {
            debug!("No usable adapter address; connection left unchanged");
            return Ok(false);
        };

        let host = if candidate.contains(':') && !candidate.starts_with('[') {
            format!("[{}]", candidate)
        } else {
            candidate.to_string()
        };
        let mut authority = parse_authority(&host)?;
        if preserve_port {
            let target = scheme_for(&authority, requires_https);
            authority.port = self.port.or_else(|| {
                self.base
                    .as_ref()
                    .filter(|u| u.scheme() != target)
                    .and_then(|u| u.port_or_known_default())
            });
        }

        let rebuilt = build_base(&authority, requires_https)?;
        info!("Connection re-pointed from network configuration to {}", rebuilt);
        self.base = Some(rebuilt);
        self.port = authority.port;
        Ok(true)
    }

    // ── Derived addresses ───────────────────────────────────────────

    /// WebSocket twin of the base address (`http`→`ws`, `https`→`wss`).
    pub fn web_socket_address(&self) -> Option<Url> {
        let base = self.base.as_ref()?;
        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        let authority = self.authority().ok()?;
        Url::parse(&format!("{}://{}/", scheme, authority.render())).ok()
    }

    /// Resolve a relative API path against the base address; absolute
    /// URIs pass through untouched.
    pub fn resolve(&self, path_or_uri: &str) -> PortalResult<Url> {
        if let Ok(absolute) = Url::parse(path_or_uri) {
            if matches!(absolute.scheme(), "http" | "https" | "ws" | "wss") {
                return Ok(absolute);
            }
        }
        let base = self.require_base()?;
        Ok(base.join(path_or_uri.trim_start_matches('/'))?)
    }

    /// Same as [`resolve`](Self::resolve) but on the WebSocket address.
    pub fn resolve_web_socket(&self, path: &str) -> PortalResult<Url> {
        let base = self
            .web_socket_address()
            .ok_or_else(|| PortalError::AddressFormat("no base address set".into()))?;
        Ok(base.join(path.trim_start_matches('/'))?)
    }

    /// Base URL with an explicit scheme, used by the certificate fetch.
    pub fn with_scheme(&self, scheme: &str) -> PortalResult<Url> {
        let authority = self.authority()?;
        Ok(Url::parse(&format!("{}://{}/", scheme, authority.render()))?)
    }

    fn authority(&self) -> PortalResult<Authority> {
        let base = self.require_base()?;
        let host = base
            .host()
            .map(|h| h.to_owned())
            .ok_or_else(|| PortalError::AddressFormat(format!("'{}' has no host", base)))?;
        Ok(Authority {
            host,
            port: self.port.or_else(|| base.port()),
        })
    }

    fn require_base(&self) -> PortalResult<&Url> {
        self.base
            .as_ref()
            .ok_or_else(|| PortalError::AddressFormat("no base address set".into()))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parsed host + optional port.
struct Authority {
    host: Host<String>,
    port: Option<u16>,
}

impl Authority {
    fn render(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.to_string(),
        }
    }

    fn is_loopback(&self) -> bool {
        match &self.host {
            Host::Domain(d) => d.eq_ignore_ascii_case("localhost"),
            Host::Ipv4(ip) => IpAddr::V4(*ip).is_loopback(),
            Host::Ipv6(ip) => IpAddr::V6(*ip).is_loopback(),
        }
    }
}

/// Accepts `host`, `host:port`, `[v6]:port`, or any of these prefixed by
/// a scheme and optionally followed by a path (which is discarded).
fn parse_authority(address: &str) -> PortalResult<Authority> {
    let trimmed = address.trim();
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    if authority.is_empty() || authority.contains(char::is_whitespace) {
        return Err(PortalError::AddressFormat(format!(
            "'{}' has no usable host",
            address
        )));
    }

    let parsed = Url::parse(&format!("http://{}/", authority))
        .map_err(|e| PortalError::AddressFormat(format!("'{}': {}", address, e)))?;
    let host = parsed
        .host()
        .map(|h| h.to_owned())
        .ok_or_else(|| PortalError::AddressFormat(format!("'{}' has no host", address)))?;
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(PortalError::AddressFormat(format!(
            "'{}' must not embed credentials",
            address
        )));
    }
    // `port()` drops http's default 80; keep whatever the caller wrote.
    let port = parsed.port().or_else(|| {
        authority
            .rsplit_once(':')
            .filter(|(h, _)| !h.ends_with(':') && (h.starts_with('[') || !h.contains(':')))
            .and_then(|(_, p)| p.parse::<u16>().ok())
    });
    Ok(Authority { host, port })
}

fn scheme_for(authority: &Authority, requires_https: bool) -> &'static str {
    if authority.is_loopback() || !requires_https {
        "http"
    } else {
        "https"
    }
}

fn build_base(authority: &Authority, requires_https: bool) -> PortalResult<Url> {
    let scheme = scheme_for(authority, requires_https);
    Ok(Url::parse(&format!("{}://{}/", scheme, authority.render()))?)
}

fn select_address(config: &NetworkConfiguration) -> Option<&str> {
    config
        .adapters
        .iter()
        .flat_map(|adapter| adapter.ip_addresses.iter())
        .map(|ip| ip.address.trim())
        .find(|addr| {
            !addr.is_empty() && *addr != UNSPECIFIED_ADDRESS && !addr.starts_with(LINK_LOCAL_PREFIX)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IpAddressInfo, NetworkAdapter};

    fn create(address: &str, https: bool) -> ConnectionDescriptor {
        ConnectionDescriptor::create(address, Credentials::default(), https).unwrap()
    }

    #[test]
    fn https_for_remote_device() {
        let c = create("192.168.1.5", true);
        assert_eq!(c.address().as_deref(), Some("https://192.168.1.5"));
    }

    #[test]
    fn http_when_not_required() {
        let c = create("192.168.1.5", false);
        assert_eq!(c.address().as_deref(), Some("http://192.168.1.5"));
    }

    #[test]
    fn loopback_always_http() {
        for addr in ["127.0.0.1:50443", "localhost", "LOCALHOST:8080", "[::1]:10080", "https://127.0.0.1"] {
            let c = create(addr, true);
            assert_eq!(c.scheme(), Some("http"), "address {}", addr);
        }
    }

    #[test]
    fn blank_uses_default() {
        let c = create("   ", true);
        assert_eq!(c.address().as_deref(), Some("http://127.0.0.1:10080"));
    }

    #[test]
    fn explicit_scheme_is_overridden() {
        let c = create("http://10.1.1.1:8443/some/path", true);
        assert_eq!(c.address().as_deref(), Some("https://10.1.1.1:8443"));
    }

    #[test]
    fn explicit_port_80_is_kept_across_scheme_change() {
        let c = create("10.1.1.1:80", true);
        assert_eq!(c.address().as_deref(), Some("https://10.1.1.1:80"));
    }

    #[test]
    fn explicit_port_survives_scheme_round_trip() {
        let mut c = create("10.1.1.1:80", true);
        c.update_connection(false).unwrap();
        assert_eq!(c.address().as_deref(), Some("http://10.1.1.1"));
        c.update_connection(true).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://10.1.1.1:80"));
    }

    #[test]
    fn implicit_port_not_invented_on_scheme_change() {
        let mut c = create("10.1.1.1", false);
        c.update_connection(true).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://10.1.1.1"));
    }

    #[test]
    fn malformed_address_rejected() {
        for bad in ["http://", "bad host", "host:99999", "user:pw@10.0.0.1"] {
            assert!(
                matches!(
                    ConnectionDescriptor::create(bad, Credentials::default(), true),
                    Err(PortalError::AddressFormat(_))
                ),
                "address {}",
                bad
            );
        }
    }

    #[test]
    fn update_connection_changes_scheme_only() {
        let mut c = create("192.168.1.5:11443", false);
        c.update_connection(true).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://192.168.1.5:11443"));
        c.update_connection(false).unwrap();
        assert_eq!(c.address().as_deref(), Some("http://192.168.1.5:11443"));
    }

    #[test]
    fn update_address_scenario() {
        let mut c = create("10.9.9.9", false);
        c.update_address("192.168.1.5", true).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://192.168.1.5"));
    }

    #[test]
    fn update_without_base_fails() {
        let mut c = ConnectionDescriptor::default();
        assert!(matches!(c.update_connection(true), Err(PortalError::AddressFormat(_))));
        assert!(c.web_socket_address().is_none());
    }

    #[test]
    fn network_selection_skips_unusable() {
        let mut c = create("192.168.1.5", true);
        let cfg = NetworkConfiguration::single_adapter(["0.0.0.0", "169.254.1.1", "10.0.0.5"]);
        assert!(c.update_connection_from_network(&cfg, false, false).unwrap());
        assert_eq!(c.address().as_deref(), Some("http://10.0.0.5"));
    }

    #[test]
    fn network_selection_respects_adapter_order() {
        let mut c = create("192.168.1.5", true);
        let cfg = NetworkConfiguration {
            adapters: vec![
                NetworkAdapter {
                    name: "a".into(),
                    ip_addresses: vec![IpAddressInfo {
                        address: "169.254.3.3".into(),
                        subnet_mask: String::new(),
                    }],
                    ..Default::default()
                },
                NetworkAdapter {
                    name: "b".into(),
                    ip_addresses: vec![
                        IpAddressInfo {
                            address: "10.0.0.7".into(),
                            subnet_mask: String::new(),
                        },
                        IpAddressInfo {
                            address: "10.0.0.8".into(),
                            subnet_mask: String::new(),
                        },
                    ],
                    ..Default::default()
                },
            ],
        };
        c.update_connection_from_network(&cfg, true, false).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://10.0.0.7"));
    }

    #[test]
    fn network_selection_none_qualifies() {
        let mut c = create("192.168.1.5:443", true);
        let before = c.address();
        let cfg = NetworkConfiguration::single_adapter(["0.0.0.0", "169.254.9.9"]);
        assert!(!c.update_connection_from_network(&cfg, false, true).unwrap());
        assert_eq!(c.address(), before);

        let empty = NetworkConfiguration::default();
        assert!(!c.update_connection_from_network(&empty, false, true).unwrap());
        assert_eq!(c.address(), before);
    }

    #[test]
    fn network_selection_preserves_port() {
        let mut c = create("192.168.1.5:11443", true);
        let cfg = NetworkConfiguration::single_adapter(["10.0.0.5"]);
        c.update_connection_from_network(&cfg, true, true).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://10.0.0.5:11443"));
    }

    #[test]
    fn network_selection_preserves_default_port_across_scheme_change() {
        let mut c = create("192.168.1.5", true);
        let cfg = NetworkConfiguration::single_adapter(["10.0.0.5"]);
        c.update_connection_from_network(&cfg, false, true).unwrap();
        assert_eq!(c.address().as_deref(), Some("http://10.0.0.5:443"));
        c.update_connection(true).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://10.0.0.5"));
    }

    #[test]
    fn network_selection_same_scheme_keeps_default_port_implicit() {
        let mut c = create("192.168.1.5", true);
        let cfg = NetworkConfiguration::single_adapter(["10.0.0.5"]);
        c.update_connection_from_network(&cfg, true, true).unwrap();
        assert_eq!(c.address().as_deref(), Some("https://10.0.0.5"));
        assert_eq!(c.with_scheme("http").unwrap().as_str(), "http://10.0.0.5/");
    }

    #[test]
    fn web_socket_address_mapping() {
        let c = create("192.168.1.5:11443", true);
        assert_eq!(
            c.web_socket_address().unwrap().as_str(),
            "wss://192.168.1.5:11443/"
        );
        let c = create("localhost:10080", true);
        assert_eq!(c.web_socket_address().unwrap().as_str(), "ws://localhost:10080/");
    }

    #[test]
    fn resolve_relative_and_absolute() {
        let c = create("192.168.1.5", true);
        assert_eq!(
            c.resolve("/api/os/info").unwrap().as_str(),
            "https://192.168.1.5/api/os/info"
        );
        assert_eq!(
            c.resolve("api/app/packagemanager/package?package=a.appx").unwrap().as_str(),
            "https://192.168.1.5/api/app/packagemanager/package?package=a.appx"
        );
        assert_eq!(
            c.resolve("http://other:1234/x").unwrap().as_str(),
            "http://other:1234/x"
        );
        assert_eq!(
            c.resolve_web_socket("api/events").unwrap().as_str(),
            "wss://192.168.1.5/api/events"
        );
    }

    #[test]
    fn with_scheme_keeps_authority() {
        let c = create("192.168.1.5:50443", true);
        assert_eq!(c.with_scheme("http").unwrap().as_str(), "http://192.168.1.5:50443/");
    }
}
