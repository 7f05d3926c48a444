//! Channel transport capability.
//!
//! The channel manager treats the transport as an opaque capability:
//! anything that can connect, deliver push events, and answer correlated
//! calls satisfies it. Two implementations live here:
//!
//! - [`WebSocketTransport`] — the production transport over
//!   tokio-tungstenite. The stream is split into a writer fed by an mpsc
//!   queue and a reader that routes frames, with one driver task per link.
//! - [`MemoryTransport`] — an in-process hub for tests: scriptable connect
//!   failures, captured invokes, push injection and forced link drops.
//!
//! Call correlation: each outgoing call gets a link-unique id and a
//! `oneshot` reply slot; the driver resolves the slot when the matching
//! `Reply` frame arrives. A dropped link resolves every pending slot with
//! `ConnectionClosed` — a hung call is simply still pending until then.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEnvelope, ProtocolError, PushEvent, RemoteCall, ServerEnvelope};

/// Reply to one correlated call.
pub type InvokeReply = Result<Option<u64>, InvokeError>;

type PendingReply = oneshot::Sender<InvokeReply>;

/// Why a call did not succeed.
#[derive(Debug, Clone)]
pub enum InvokeError {
    /// The server executed the call and rejected it.
    Remote(String),
    /// The link dropped before a reply arrived.
    ConnectionClosed,
    /// The call could not be encoded for the wire.
    Encode(String),
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeError::Remote(e) => write!(f, "Remote call failed: {e}"),
            InvokeError::ConnectionClosed => write!(f, "Connection closed"),
            InvokeError::Encode(e) => write!(f, "Call encoding failed: {e}"),
        }
    }
}

impl std::error::Error for InvokeError {}

/// Outgoing half of a live link. Cheap to clone.
#[derive(Clone)]
pub struct CallHandle {
    call_tx: mpsc::Sender<(RemoteCall, PendingReply)>,
}

impl CallHandle {
    /// Issue a call and await its correlated reply.
    pub async fn invoke(&self, call: RemoteCall) -> InvokeReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.call_tx.send((call, reply_tx)).await.is_err() {
            return Err(InvokeError::ConnectionClosed);
        }
        reply_rx
            .await
            .unwrap_or(Err(InvokeError::ConnectionClosed))
    }

    /// Whether the link behind this handle is still alive.
    pub fn is_open(&self) -> bool {
        !self.call_tx.is_closed()
    }
}

/// One established link: the call handle plus the push-event stream.
///
/// The event stream ending (`recv()` → `None`) is the disconnect signal.
pub struct TransportLink {
    caller: CallHandle,
    event_rx: mpsc::Receiver<PushEvent>,
}

impl TransportLink {
    pub fn split(self) -> (CallHandle, mpsc::Receiver<PushEvent>) {
        (self.caller, self.event_rx)
    }
}

/// The transport capability: connect a URL to a live link.
pub trait Transport: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportLink, ProtocolError>>;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket transport
// ───────────────────────────────────────────────────────────────────

/// Production transport over tokio-tungstenite.
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportLink, ProtocolError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| ProtocolError::ConnectFailed(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (call_tx, mut call_rx) = mpsc::channel::<(RemoteCall, PendingReply)>(64);
            let (event_tx, event_rx) = mpsc::channel::<PushEvent>(256);

            // Driver: multiplexes outgoing calls and incoming frames until
            // either side closes, then fails every pending call.
            tokio::spawn(async move {
                let mut pending: HashMap<u64, PendingReply> = HashMap::new();
                let mut next_id: u64 = 1;
                loop {
                    tokio::select! {
                        outgoing = call_rx.recv() => {
                            let Some((call, reply_tx)) = outgoing else { break };
                            let id = next_id;
                            next_id += 1;
                            let envelope = ClientEnvelope { id, call };
                            match envelope.encode() {
                                Ok(bytes) => {
                                    if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                                        let _ = reply_tx.send(Err(InvokeError::ConnectionClosed));
                                        break;
                                    }
                                    pending.insert(id, reply_tx);
                                }
                                Err(e) => {
                                    let _ = reply_tx.send(Err(InvokeError::Encode(e.to_string())));
                                }
                            }
                        }
                        incoming = ws_reader.next() => {
                            match incoming {
                                Some(Ok(Message::Binary(data))) => {
                                    match ServerEnvelope::decode(&data) {
                                        Ok(ServerEnvelope::Reply { id, result }) => {
                                            match pending.remove(&id) {
                                                Some(reply_tx) => {
                                                    let _ = reply_tx
                                                        .send(result.map_err(InvokeError::Remote));
                                                }
                                                None => log::warn!("reply for unknown call id {id}"),
                                            }
                                        }
                                        Ok(ServerEnvelope::Event(event)) => {
                                            if event_tx.send(event).await.is_err() {
                                                break;
                                            }
                                        }
                                        Err(e) => log::warn!("malformed server frame: {e}"),
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    log::warn!("WebSocket read error: {e}");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
                for (_, reply_tx) in pending.drain() {
                    let _ = reply_tx.send(Err(InvokeError::ConnectionClosed));
                }
                // event_tx drops here, ending the event stream downstream.
            });

            Ok(TransportLink {
                caller: CallHandle { call_tx },
                event_rx,
            })
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory transport (test hub)
// ───────────────────────────────────────────────────────────────────

enum HubCommand {
    Deliver(PushEvent),
    Close,
}

#[derive(Default)]
struct HubScript {
    /// Fail this many upcoming connect attempts.
    connect_failures: usize,
    /// Methods whose invokes are rejected.
    failing_methods: HashSet<&'static str>,
}

#[derive(Default)]
struct HubShared {
    script: Mutex<HubScript>,
    calls: Mutex<Vec<RemoteCall>>,
    links: Mutex<Vec<mpsc::UnboundedSender<HubCommand>>>,
    view_counts: Mutex<HashMap<String, u64>>,
    connect_attempts: AtomicUsize,
}

/// In-process hub standing in for the server side.
///
/// Create one hub per test, hand its [`MemoryTransport`] to the registry,
/// then script failures, inject pushes and inspect captured calls.
#[derive(Clone, Default)]
pub struct MemoryHub {
    shared: Arc<HubShared>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport side of this hub.
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock_script().connect_failures = n;
    }

    /// Reject every invoke of the given hub method.
    pub fn fail_method(&self, method: &'static str) {
        self.lock_script().failing_methods.insert(method);
    }

    /// Stop rejecting the given hub method.
    pub fn restore_method(&self, method: &'static str) {
        self.lock_script().failing_methods.remove(method);
    }

    /// Deliver a push event to every live link.
    pub fn push(&self, event: PushEvent) {
        self.lock_links()
            .retain(|link| link.send(HubCommand::Deliver(event.clone())).is_ok());
    }

    /// Forcibly drop every live link, as a transport failure would.
    pub fn drop_links(&self) {
        let mut links = self.lock_links();
        for link in links.drain(..) {
            let _ = link.send(HubCommand::Close);
        }
    }

    /// All calls captured so far, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock_calls().clone()
    }

    /// How many captured calls used the given hub method.
    pub fn calls_for(&self, method: &str) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| c.method() == method)
            .count()
    }

    /// Total connect attempts seen, including scripted failures.
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Live link count (prunes links whose driver has exited).
    pub fn live_links(&self) -> usize {
        let mut links = self.lock_links();
        links.retain(|link| !link.is_closed());
        links.len()
    }

    /// Server-side view counter for a resource.
    pub fn view_count(&self, resource_id: &str) -> u64 {
        self.lock_views().get(resource_id).copied().unwrap_or(0)
    }

    /// Seed the server-side view counter for a resource.
    pub fn set_view_count(&self, resource_id: &str, count: u64) {
        self.lock_views().insert(resource_id.to_string(), count);
    }

    fn reply_for(&self, call: &RemoteCall) -> InvokeReply {
        if self.lock_script().failing_methods.contains(call.method()) {
            return Err(InvokeError::Remote(format!(
                "scripted failure for {}",
                call.method()
            )));
        }
        match call {
            RemoteCall::IncreaseViewCount { resource_id } => {
                let mut views = self.lock_views();
                let count = views.entry(resource_id.clone()).or_insert(0);
                *count += 1;
                Ok(None)
            }
            RemoteCall::GetCurrentViewCount { resource_id } => {
                Ok(Some(self.view_count(resource_id)))
            }
            _ => Ok(None),
        }
    }

    fn connect_link(&self) -> Result<TransportLink, ProtocolError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.lock_script();
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(ProtocolError::ConnectFailed(
                    "scripted connect failure".into(),
                ));
            }
        }

        let (call_tx, mut call_rx) = mpsc::channel::<(RemoteCall, PendingReply)>(64);
        let (event_tx, event_rx) = mpsc::channel::<PushEvent>(256);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<HubCommand>();
        self.lock_links().push(cmd_tx);

        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = call_rx.recv() => {
                        let Some((call, reply_tx)) = outgoing else { break };
                        hub.lock_calls().push(call.clone());
                        let _ = reply_tx.send(hub.reply_for(&call));
                    }
                    command = cmd_rx.recv() => {
                        match command {
                            Some(HubCommand::Deliver(event)) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Some(HubCommand::Close) | None => break,
                        }
                    }
                }
            }
            // event_tx drops here; the channel sees a disconnect.
        });

        Ok(TransportLink {
            caller: CallHandle { call_tx },
            event_rx,
        })
    }

    // Lock helpers that recover from poisoning instead of panicking;
    // all critical sections are short and await-free.
    fn lock_script(&self) -> std::sync::MutexGuard<'_, HubScript> {
        self.shared
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<RemoteCall>> {
        self.shared
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_links(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<HubCommand>>> {
        self.shared
            .links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_views(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.shared
            .view_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Transport side of a [`MemoryHub`].
pub struct MemoryTransport {
    shared: Arc<HubShared>,
}

impl Transport for MemoryTransport {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<TransportLink, ProtocolError>> {
        let hub = MemoryHub {
            shared: Arc::clone(&self.shared),
        };
        Box::pin(async move { hub.connect_link() })
    }
}
