//! WebSocket event channel with a per-tag subscriber registry.
//!
//! Frames are JSON objects; the string value of the tag field (`Type` by
//! default) selects the subscribers. Each subscriber decodes the frame
//! into its own type. Handlers run inline in the single receive loop, in
//! registration order, so they must return quickly.

use crate::error::{PortalError, PortalResult};
use crate::rest::USER_AGENT_HEADER;
use crate::types::Credentials;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_TAG_FIELD: &str = "Type";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle returned by [`EventChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connected,
    /// The socket ended on its own (server close or error).
    Closed(String),
}

type Handler = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    by_tag: HashMap<String, Vec<Subscription>>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct EventChannel {
    url: Url,
    credentials: Credentials,
    user_agent: Option<String>,
    tag_field: String,
    connect_timeout: Duration,
    registry: Arc<RwLock<Registry>>,
    state: Arc<RwLock<ChannelState>>,
    running: Mutex<Option<Running>>,
}

impl EventChannel {
    pub fn new(url: Url, credentials: Credentials) -> Self {
        Self {
            url,
            credentials,
            user_agent: None,
            tag_field: DEFAULT_TAG_FIELD.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            registry: Arc::new(RwLock::new(Registry::default())),
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            running: Mutex::new(None),
        }
    }

    pub fn with_tag_field(mut self, field: impl Into<String>) -> Self {
        self.tag_field = field.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register a handler for frames carrying `tag`. Frames that do not
    /// decode into `T` are logged and skipped for this handler only.
    pub fn subscribe<T, F>(&self, tag: impl Into<String>, handler: F) -> SubscriptionId
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let wrapped: Handler = Arc::new(move |value: &Value| {
            let decoded = <T as Deserialize>::deserialize(value).map_err(|e| e.to_string())?;
            handler(decoded);
            Ok(())
        });
        let id = SubscriptionId(Uuid::new_v4());
        let tag = tag.into();
        debug!("Subscribed {} to '{}'", id, tag);
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .by_tag
            .entry(tag)
            .or_default()
            .push(Subscription {
                id,
                handler: wrapped,
            });
        id
    }

    /// Remove one handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, tag: &str, id: SubscriptionId) -> bool {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(subs) = registry.by_tag.get_mut(tag) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            registry.by_tag.remove(tag);
        }
        removed
    }

    pub fn handler_count(&self, tag: &str) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .by_tag
            .get(tag)
            .map_or(0, Vec::len)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the socket and start the receive loop. A no-op while
    /// connected; after the channel closed on its own this reconnects.
    pub async fn connect(&self) -> PortalResult<()> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            if !r.task.is_finished() && self.is_connected() {
                debug!("Event channel {} already connected", self.url);
                return Ok(());
            }
        }
        if let Some(stale) = running.take() {
            let _ = stale.shutdown.send(());
            let _ = stale.task.await;
        }

        let request = self.build_request()?;
        info!("Connecting event channel to {}", self.url);
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    PortalError::Timeout(format!(
                        "event channel connect to {} after {:?}",
                        self.url, self.connect_timeout
                    ))
                })??;
        info!("Event channel connected");

        let (write, read) = ws_stream.split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.set_state(ChannelState::Connected);

        let registry = self.registry.clone();
        let state = self.state.clone();
        let tag_field = self.tag_field.clone();
        let task = tokio::spawn(async move {
            Self::message_loop(read, write, shutdown_rx, registry, state, tag_field).await;
        });

        *running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop the receive loop and close the socket. Safe to call any
    /// number of times.
    pub async fn disconnect(&self) {
        let mut running = self.running.lock().await;
        if let Some(r) = running.take() {
            let _ = r.shutdown.send(());
            if let Err(e) = r.task.await {
                warn!("Event channel loop ended abnormally: {}", e);
            }
            self.set_state(ChannelState::Disconnected);
            info!("Event channel {} disconnected", self.url);
        }
    }

    fn set_state(&self, new_state: ChannelState) {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_state;
    }

    fn build_request(
        &self,
    ) -> PortalResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if !self.credentials.is_empty() {
            let raw = format!("{}:{}", self.credentials.username, self.credentials.password);
            let auth = format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(raw)
            );
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&auth)
                    .map_err(|e| PortalError::transport(format!("bad credentials header: {}", e)))?,
            );
        }
        if let Some(agent) = &self.user_agent {
            headers.insert(
                USER_AGENT_HEADER,
                HeaderValue::from_str(agent)
                    .map_err(|e| PortalError::transport(format!("bad user agent: {}", e)))?,
            );
        }
        Ok(request)
    }

    async fn message_loop(
        mut read: impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
        mut write: impl SinkExt<WsMessage> + Unpin,
        mut shutdown: oneshot::Receiver<()>,
        registry: Arc<RwLock<Registry>>,
        state: Arc<RwLock<ChannelState>>,
        tag_field: String,
    ) {
        let closed = loop {
            let msg_result = tokio::select! {
                _ = &mut shutdown => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    let _ = write.close().await;
                    return;
                }
                next = read.next() => next,
            };

            match msg_result {
                Some(Ok(WsMessage::Text(text))) => {
                    Self::dispatch_logged(&registry, &tag_field, text.as_str());
                }
                Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => Self::dispatch_logged(&registry, &tag_field, text),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(WsMessage::Close(_))) => {
                    info!("Event channel closed by server");
                    break "closed by server".to_string();
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    // tungstenite answers pings itself
                    debug!("Received ping ({} bytes)", payload.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Event channel error: {}", e);
                    break e.to_string();
                }
                None => break "stream ended".to_string(),
            }
        };
        *state.write().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            ChannelState::Closed(closed);
    }

    fn dispatch_logged(registry: &RwLock<Registry>, tag_field: &str, text: &str) {
        if let Err(e) = dispatch_frame(registry, tag_field, text) {
            warn!("{}", e);
        }
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("url", &self.url.as_str())
            .field("tag_field", &self.tag_field)
            .field("state", &self.state())
            .finish()
    }
}

/// Route one text frame to its subscribers; returns how many handlers
/// accepted it. Handler-level decode failures are logged, not returned.
fn dispatch_frame(registry: &RwLock<Registry>, tag_field: &str, text: &str) -> PortalResult<usize> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| PortalError::MalformedMessage(format!("frame is not JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| PortalError::MalformedMessage("frame is not a JSON object".into()))?;
    let tag = object
        .get(tag_field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            PortalError::MalformedMessage(format!("frame has no string '{}' field", tag_field))
        })?;

    let handlers: Vec<Handler> = registry
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .by_tag
        .get(tag)
        .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
        .unwrap_or_default();
    if handlers.is_empty() {
        debug!("No subscribers for '{}'", tag);
        return Ok(0);
    }

    let mut delivered = 0;
    for handler in handlers {
        // Isolate subscriber panics from the receive loop.
        match panic::catch_unwind(AssertUnwindSafe(|| handler(&value))) {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(e)) => warn!("Dropping '{}' frame for one subscriber: {}", tag, e),
            Err(payload) => error!(
                "Subscriber for '{}' panicked: {}",
                tag,
                panic_message(payload.as_ref())
            ),
        }
    }
    Ok(delivered)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstallStatus, InstallStatusEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn channel() -> EventChannel {
        EventChannel::new(Url::parse("ws://127.0.0.1:1/").unwrap(), Credentials::default())
    }

    #[test]
    fn dispatch_in_registration_order() {
        let ch = channel();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            ch.subscribe("Ping", move |_: Value| order.lock().unwrap().push(n));
        }
        let count = dispatch_frame(&ch.registry, "Type", r#"{"Type":"Ping"}"#).unwrap();
        assert_eq!(count, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_dispatch() {
        let ch = channel();
        let seen = Arc::new(AtomicUsize::new(0));
        ch.subscribe("Ping", |_: Value| panic!("subscriber bug"));
        let counter = seen.clone();
        ch.subscribe("Ping", move |_: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let count = dispatch_frame(&ch.registry, "Type", r#"{"Type":"Ping"}"#).unwrap();
        assert_eq!(count, 1);
        let count = dispatch_frame(&ch.registry, "Type", r#"{"Type":"Ping"}"#).unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_frames_are_errors() {
        let ch = channel();
        for bad in ["not json", "[1,2]", r#"{"Other":"x"}"#, r#"{"Type":5}"#] {
            assert!(matches!(
                dispatch_frame(&ch.registry, "Type", bad),
                Err(PortalError::MalformedMessage(_))
            ));
        }
    }

    #[test]
    fn unknown_tag_is_ignored() {
        let ch = channel();
        assert_eq!(
            dispatch_frame(&ch.registry, "Type", r#"{"Type":"Nobody"}"#).unwrap(),
            0
        );
    }

    #[test]
    fn undecodable_payload_skips_only_that_handler() {
        let ch = channel();
        let raw = Arc::new(AtomicUsize::new(0));
        let typed = Arc::new(AtomicUsize::new(0));
        let r = raw.clone();
        ch.subscribe("InstallStatus", move |_: Value| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let t = typed.clone();
        ch.subscribe("InstallStatus", move |_: InstallStatusEvent| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = dispatch_frame(
            &ch.registry,
            "Type",
            r#"{"Type":"InstallStatus","Status":"Nonsense"}"#,
        )
        .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(raw.load(Ordering::SeqCst), 1);
        assert_eq!(typed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn typed_handler_receives_decoded_value() {
        let ch = channel();
        let seen = Arc::new(StdMutex::new(None));
        let s = seen.clone();
        ch.subscribe("InstallStatus", move |e: InstallStatusEvent| {
            *s.lock().unwrap() = Some(e.status);
        });
        dispatch_frame(
            &ch.registry,
            "Type",
            r#"{"Type":"InstallStatus","Status":"Completed","Phase":"Installing","Message":""}"#,
        )
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(InstallStatus::Completed));
    }

    #[test]
    fn custom_tag_field() {
        let ch = channel().with_tag_field("Kind");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ch.subscribe("Tick", move |_: Value| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        dispatch_frame(&ch.registry, &ch.tag_field, r#"{"Kind":"Tick"}"#).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_one_handler() {
        let ch = channel();
        let a = ch.subscribe("T", |_: Value| {});
        let _b = ch.subscribe("T", |_: Value| {});
        assert_eq!(ch.handler_count("T"), 2);
        assert!(ch.unsubscribe("T", a));
        assert!(!ch.unsubscribe("T", a));
        assert!(!ch.unsubscribe("Other", a));
        assert_eq!(ch.handler_count("T"), 1);
    }

    #[test]
    fn request_carries_basic_auth() {
        let ch = EventChannel::new(
            Url::parse("wss://192.168.1.5/api/events").unwrap(),
            Credentials::new("admin", "pw"),
        )
        .with_user_agent("TestAgent/1");
        let req = ch.build_request().unwrap();
        assert_eq!(
            req.headers().get("Authorization").unwrap(),
            "Basic YWRtaW46cHc="
        );
        assert_eq!(req.headers().get("User-Agent").unwrap(), "TestAgent/1");
    }

    #[tokio::test]
    async fn connect_failure_leaves_channel_disconnected() {
        let ch = channel().with_connect_timeout(Duration::from_secs(2));
        assert!(ch.connect().await.is_err());
        assert_eq!(ch.state(), ChannelState::Disconnected);
        // nothing running, still fine
        ch.disconnect().await;
    }
}
