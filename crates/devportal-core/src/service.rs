//! Session façade.
//!
//! `PortalSession` owns the connection descriptor, the transport and the
//! REST invoker for one device, and hands out the trust bootstrapper,
//! event channels and install tracker bound to them.

use crate::certificate::{CertificateTrustBootstrapper, TrustOutcome, TrustStore};
use crate::config::PortalConfig;
use crate::connection::ConnectionDescriptor;
use crate::error::PortalResult;
use crate::events::EventChannel;
use crate::install::{OperationTracker, WaitOptions};
use crate::rest::RestInvoker;
use crate::transport::{PortalTransport, ReqwestTransport};
use crate::types::{DeviceFamily, DeviceFamilyInfo, NetworkConfiguration, OsInfo};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

pub const DEVICE_FAMILY_PATH: &str = "api/os/devicefamily";
pub const OS_INFO_PATH: &str = "api/os/info";
pub const IP_CONFIG_PATH: &str = "api/networking/ipconfig";

pub struct PortalSession {
    config: PortalConfig,
    connection: Arc<RwLock<ConnectionDescriptor>>,
    transport: Arc<dyn PortalTransport>,
    invoker: Arc<RestInvoker>,
    channels: Mutex<HashMap<String, Arc<EventChannel>>>,
}

impl PortalSession {
    /// Build a session over the stock reqwest transport.
    pub fn new(config: PortalConfig) -> PortalResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
        Self::with_transport(config, transport)
    }

    /// Build a session over a caller-supplied transport.
    pub fn with_transport(
        config: PortalConfig,
        transport: Arc<dyn PortalTransport>,
    ) -> PortalResult<Self> {
        config.validate()?;
        let descriptor = ConnectionDescriptor::create(
            &config.address,
            config.credentials(),
            config.requires_https,
        )?;
        let connection = Arc::new(RwLock::new(descriptor));
        let invoker = Arc::new(RestInvoker::new(
            transport.clone(),
            connection.clone(),
            config.user_agent.clone(),
        ));
        Ok(Self {
            config,
            connection,
            transport,
            invoker,
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Snapshot of the current connection state.
    pub fn connection(&self) -> ConnectionDescriptor {
        self.read_connection().clone()
    }

    pub fn device_family(&self) -> Option<DeviceFamily> {
        self.read_connection().device_family().cloned()
    }

    pub fn invoker(&self) -> &Arc<RestInvoker> {
        &self.invoker
    }

    fn read_connection(&self) -> std::sync::RwLockReadGuard<'_, ConnectionDescriptor> {
        self.connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_connection(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionDescriptor> {
        self.connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Identify the device, then optionally re-point the session at the
    /// address the device reports for itself.
    pub async fn connect(&self) -> PortalResult<()> {
        info!(
            "Connecting to device portal at {}",
            self.read_connection().address().unwrap_or_default()
        );

        let family: DeviceFamilyInfo = self.invoker.get_json(DEVICE_FAMILY_PATH).await?;
        let family = DeviceFamily::parse(&family.device_type);
        info!("Device family: {}", family);
        self.write_connection().set_device_family(family);

        let os_info: OsInfo = self.invoker.get_json(OS_INFO_PATH).await?;
        debug!(
            "OS info: {} {}",
            os_info.computer_name.as_deref().unwrap_or("?"),
            os_info.os_version.as_deref().unwrap_or("?")
        );
        self.write_connection().set_os_info(os_info);

        if self.config.update_from_network {
            let network = self.network_configuration().await?;
            let changed = self.write_connection().update_connection_from_network(
                &network,
                self.config.requires_https,
                self.config.preserve_port,
            )?;
            if changed {
                info!(
                    "Connection moved to {}",
                    self.read_connection().address().unwrap_or_default()
                );
                self.drop_channels().await;
            }
        }
        Ok(())
    }

    pub async fn network_configuration(&self) -> PortalResult<NetworkConfiguration> {
        self.invoker.get_json(IP_CONFIG_PATH).await
    }

    // ── Trust ───────────────────────────────────────────────────────

    /// Fetch the device root certificate and trust it, either by
    /// installing it into `store` or by pinning it into the transport.
    pub async fn bootstrap_trust(
        &self,
        allow_untrusted: bool,
        store: Option<&dyn TrustStore>,
    ) -> PortalResult<TrustOutcome> {
        let bootstrapper = self.trust_bootstrapper();
        let certificate = bootstrapper.fetch_root_certificate(allow_untrusted).await?;
        info!("Trusting device root certificate {}", certificate.fingerprint());
        bootstrapper.trust(certificate, store)
    }

    pub fn trust_bootstrapper(&self) -> CertificateTrustBootstrapper {
        CertificateTrustBootstrapper::new(
            self.transport.clone(),
            self.connection.clone(),
            self.config.user_agent.clone(),
        )
    }

    // ── Events / installs ───────────────────────────────────────────

    /// Event channel for `path` on the current WebSocket address, created
    /// on first use. The channel is not connected here.
    pub async fn events(&self, path: &str) -> PortalResult<Arc<EventChannel>> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(path) {
            return Ok(channel.clone());
        }
        let (url, credentials) = {
            let conn = self.read_connection();
            (conn.resolve_web_socket(path)?, conn.credentials().clone())
        };
        debug!("Creating event channel for {}", url);
        let channel = Arc::new(
            EventChannel::new(url, credentials)
                .with_tag_field(self.config.event_tag_field.clone())
                .with_connect_timeout(self.config.connect_timeout())
                .with_user_agent(self.config.user_agent.clone()),
        );
        channels.insert(path.to_string(), channel.clone());
        Ok(channel)
    }

    pub fn installer(&self) -> OperationTracker {
        OperationTracker::new(self.invoker.clone(), self.connection.clone())
    }

    /// Install wait bounds from `poll_interval_ms` and `install_timeout_secs`.
    pub fn wait_options(&self) -> WaitOptions {
        let options = WaitOptions::default().with_poll_interval(self.config.poll_interval());
        match self.config.install_timeout() {
            Some(limit) => options.with_timeout(limit),
            None => options,
        }
    }

    /// Disconnect every event channel handed out by this session.
    pub async fn close(&self) {
        self.drop_channels().await;
    }

    async fn drop_channels(&self) {
        let drained: Vec<_> = self.channels.lock().await.drain().collect();
        for (_, channel) in drained {
            channel.disconnect().await;
        }
    }
}
