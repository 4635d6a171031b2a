//! Package install workflow.
//!
//! An install is one multipart upload followed by a wait for a terminal
//! status, observed either by polling `api/app/packagemanager/state` or
//! from `InstallStatus` frames pushed over the event channel. Every
//! status transition is published on a [`watch`] channel.

use crate::connection::ConnectionDescriptor;
use crate::error::{PortalError, PortalResult};
use crate::events::{ChannelState, EventChannel, SubscriptionId};
use crate::rest::{path_with_query, RestInvoker};
use crate::transport::{MultipartPart, RequestBody};
use crate::types::{ErrorEnvelope, InstallPhase, InstallStatus, InstallStatusEvent};
use log::{debug, info, warn};
use reqwest::Method;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub const PACKAGE_PATH: &str = "api/app/packagemanager/package";
pub const INSTALL_STATE_PATH: &str = "api/app/packagemanager/state";

/// Event-channel tag of pushed install progress.
pub const INSTALL_STATUS_TAG: &str = "InstallStatus";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Files making up one install.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub package: MultipartPart,
    pub dependencies: Vec<MultipartPart>,
    pub certificate: Option<MultipartPart>,
    /// Package full name to remove before uploading.
    pub previous_package: Option<String>,
}

impl InstallRequest {
    pub fn new(package: MultipartPart) -> Self {
        Self {
            package,
            dependencies: Vec::new(),
            certificate: None,
            previous_package: None,
        }
    }

    pub fn with_dependency(mut self, dependency: MultipartPart) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_certificate(mut self, certificate: MultipartPart) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn with_previous_package(mut self, full_name: impl Into<String>) -> Self {
        self.previous_package = Some(full_name.into());
        self
    }

    pub fn package_name(&self) -> &str {
        &self.package.file_name
    }

    fn parts(&self) -> Vec<MultipartPart> {
        std::iter::once(&self.package)
            .chain(&self.dependencies)
            .chain(&self.certificate)
            .cloned()
            .collect()
    }
}

/// How to learn that an install finished.
#[derive(Debug, Clone, Copy)]
pub enum InstallStrategy<'a> {
    /// Poll the install-state endpoint.
    Polling,
    /// Follow pushed `InstallStatus` frames.
    EventDriven(&'a EventChannel),
}

/// Bounds on waiting for an install.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: CancellationToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

pub struct OperationTracker {
    invoker: Arc<RestInvoker>,
    connection: Arc<RwLock<ConnectionDescriptor>>,
    status: watch::Sender<InstallStatusEvent>,
}

impl OperationTracker {
    pub fn new(invoker: Arc<RestInvoker>, connection: Arc<RwLock<ConnectionDescriptor>>) -> Self {
        let (status, _) = watch::channel(InstallStatusEvent::default());
        Self {
            invoker,
            connection,
            status,
        }
    }

    /// Observe status transitions.
    pub fn watch_status(&self) -> watch::Receiver<InstallStatusEvent> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> InstallStatusEvent {
        self.status.borrow().clone()
    }

    // ── Start ───────────────────────────────────────────────────────

    /// Upload the package and its companions; returns once the device
    /// has accepted the upload.
    pub async fn start(&self, request: &InstallRequest) -> PortalResult<()> {
        if let Some(previous) = &request.previous_package {
            self.publish(InstallStatusEvent::new(
                InstallStatus::InProgress,
                InstallPhase::UninstallingPreviousVersion,
                format!("Uninstalling {}", previous),
            ));
            let path = path_with_query(PACKAGE_PATH, &[("package", previous.as_str())]);
            if let Err(e) = self.invoker.delete(&path).await {
                return Err(self.fail(InstallPhase::UninstallingPreviousVersion, e));
            }
        }

        self.publish(InstallStatusEvent::new(
            InstallStatus::InProgress,
            InstallPhase::CopyingFile,
            format!("Uploading {}", request.package_name()),
        ));
        let path = path_with_query(PACKAGE_PATH, &[("package", request.package_name())]);
        let parts = request.parts();
        debug!("Uploading {} file(s) to {}", parts.len(), path);
        if let Err(e) = self.invoker.post_multipart(&path, parts).await {
            return Err(self.fail(InstallPhase::CopyingFile, e));
        }

        self.publish(InstallStatusEvent::new(
            InstallStatus::InProgress,
            InstallPhase::Installing,
            String::new(),
        ));
        Ok(())
    }

    // ── Wait ────────────────────────────────────────────────────────

    /// One poll of the install-state endpoint. A transport failure
    /// counts as a failed install.
    pub async fn poll_status(&self) -> InstallStatusEvent {
        match self
            .invoker
            .invoke_unchecked(Method::GET, INSTALL_STATE_PATH, RequestBody::Empty)
            .await
        {
            Ok(response) => {
                let status = InstallStatus::from_poll_status(response.status);
                let message = if status == InstallStatus::Failed {
                    ErrorEnvelope::parse(&response.body)
                        .and_then(|env| env.message)
                        .unwrap_or_else(|| format!("{} {}", response.status, response.reason))
                } else {
                    String::new()
                };
                InstallStatusEvent::new(status, InstallPhase::Installing, message)
            }
            Err(e) => {
                warn!("Install state poll failed: {}", e);
                InstallStatusEvent::new(InstallStatus::Failed, InstallPhase::Installing, e.to_string())
            }
        }
    }

    /// Wait for an already-started install to reach a terminal status.
    pub async fn wait_for_completion(
        &self,
        strategy: InstallStrategy<'_>,
        options: &WaitOptions,
    ) -> PortalResult<InstallStatusEvent> {
        self.check_strategy(strategy)?;
        match strategy {
            InstallStrategy::Polling => {
                Self::bounded(options, self.poll_until_terminal(options.poll_interval)).await
            }
            InstallStrategy::EventDriven(channel) => {
                let (id, rx) = Self::listen(channel);
                let result = Self::bounded(
                    options,
                    self.follow_events(channel, rx, options.poll_interval),
                )
                .await;
                channel.unsubscribe(INSTALL_STATUS_TAG, id);
                result
            }
        }
    }

    /// Start an install and wait for it. The event subscription, when
    /// used, is registered before the upload so no frame is missed.
    pub async fn install(
        &self,
        request: &InstallRequest,
        strategy: InstallStrategy<'_>,
        options: &WaitOptions,
    ) -> PortalResult<InstallStatusEvent> {
        self.check_strategy(strategy)?;
        info!("Installing {}", request.package_name());
        let outcome = match strategy {
            InstallStrategy::Polling => {
                Self::bounded(options, async {
                    self.start(request).await?;
                    self.poll_until_terminal(options.poll_interval).await
                })
                .await
            }
            InstallStrategy::EventDriven(channel) => {
                channel.connect().await?;
                let (id, rx) = Self::listen(channel);
                let result = Self::bounded(options, async {
                    self.start(request).await?;
                    self.follow_events(channel, rx, options.poll_interval).await
                })
                .await;
                channel.unsubscribe(INSTALL_STATUS_TAG, id);
                result
            }
        };
        if let Ok(event) = &outcome {
            info!(
                "Install of {} finished: {:?} {}",
                request.package_name(),
                event.status,
                event.message
            );
        }
        outcome
    }

    fn check_strategy(&self, strategy: InstallStrategy<'_>) -> PortalResult<()> {
        let InstallStrategy::EventDriven(_) = strategy else {
            return Ok(());
        };
        let family = self
            .connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .device_family()
            .cloned();
        match family {
            Some(f) if f.pushes_install_events() => Ok(()),
            Some(f) => Err(PortalError::unsupported("event-driven install tracking", f)),
            None => Err(PortalError::unsupported(
                "event-driven install tracking",
                "an undetected device family",
            )),
        }
    }

    async fn poll_until_terminal(&self, interval: Duration) -> PortalResult<InstallStatusEvent> {
        loop {
            let event = self.poll_status().await;
            self.publish(event.clone());
            if event.is_terminal() {
                return Ok(event);
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn listen(
        channel: &EventChannel,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<InstallStatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = channel.subscribe(INSTALL_STATUS_TAG, move |event: InstallStatusEvent| {
            let _ = tx.send(event);
        });
        (id, rx)
    }

    async fn follow_events(
        &self,
        channel: &EventChannel,
        mut rx: mpsc::UnboundedReceiver<InstallStatusEvent>,
        check_interval: Duration,
    ) -> PortalResult<InstallStatusEvent> {
        let mut check = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    self.publish(event.clone());
                    if event.is_terminal() {
                        return Ok(event);
                    }
                }
                _ = check.tick() => match channel.state() {
                    ChannelState::Connected => {}
                    ChannelState::Disconnected => {
                        return Err(PortalError::NotConnected("event channel disconnected".into()));
                    }
                    ChannelState::Closed(reason) => {
                        return Err(PortalError::NotConnected(format!("event channel closed: {}", reason)));
                    }
                },
            }
        }
    }

    async fn bounded<T>(
        options: &WaitOptions,
        work: impl Future<Output = PortalResult<T>>,
    ) -> PortalResult<T> {
        let cancellable = async {
            tokio::select! {
                result = work => result,
                _ = options.cancel.cancelled() => {
                    Err(PortalError::Cancelled("install wait cancelled".into()))
                }
            }
        };
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, cancellable).await.map_err(|_| {
                PortalError::Timeout(format!("install did not finish within {:?}", limit))
            })?,
            None => cancellable.await,
        }
    }

    fn publish(&self, event: InstallStatusEvent) {
        debug!("Install status: {:?} / {:?}", event.status, event.phase);
        self.status.send_replace(event);
    }

    fn fail(&self, phase: InstallPhase, error: PortalError) -> PortalError {
        warn!("Install failed during {:?}: {}", phase, error);
        self.publish(InstallStatusEvent::new(
            InstallStatus::Failed,
            phase,
            error.to_string(),
        ));
        error
    }
}
