//! Per-channel connection lifecycle.
//!
//! Each logical channel owns its own supervisor task and fails
//! independently: the notifications channel going terminal never touches
//! presence. The supervisor drives the state machine
//!
//! ```text
//! Disconnected → Connecting → Connected ⇄ Reconnecting
//! ```
//!
//! with the channel's backoff schedule between attempts and a terminal
//! Disconnected once the retry budget is exhausted. State is published
//! through a `watch` channel so callers await transitions instead of
//! polling.
//!
//! Listener registration is guarded twice: one handler slot per event name,
//! and a one-shot flag for whole-set registration, so re-running UI setup
//! after a reconnect never stacks duplicate handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::watch;

use crate::backoff::{BackoffSchedule, DEFAULT_MAX_RETRIES};
use crate::groups::GroupMembership;
use crate::protocol::{ChannelName, ProtocolError, PushEvent, RemoteCall};
use crate::registry::Session;
use crate::transport::{CallHandle, InvokeError, Transport};

/// Connection state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected: initial, or terminal after the retry budget ran out.
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Live link established; calls and events flow.
    Connected,
    /// Link lost after having been Connected; attempts in flight.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Errors surfaced to channel callers.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// The channel is not in the Connected state.
    NotConnected,
    /// The server executed the call and rejected it.
    Remote(String),
    /// The call could not be put on the wire.
    Transport(ProtocolError),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::NotConnected => write!(f, "Channel not connected"),
            ChannelError::Remote(e) => write!(f, "Remote call failed: {e}"),
            ChannelError::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Configuration for one channel connection.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Endpoint URL for this channel.
    pub url: String,
    /// Whether the channel only runs for an authenticated session.
    pub requires_auth: bool,
    /// Retry budget before the channel goes terminal.
    pub max_retries: u32,
    /// Delay schedule between attempts.
    pub backoff: BackoffSchedule,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            requires_auth: false,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffSchedule::default(),
        }
    }

    /// Config for tests: short backoff, small retry budget.
    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            requires_auth: false,
            max_retries: 3,
            backoff: BackoffSchedule::for_testing(),
        }
    }
}

/// Counters for one channel's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub events_dispatched: u64,
    pub invokes_sent: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct AtomicStats {
    events_dispatched: AtomicU64,
    invokes_sent: AtomicU64,
    reconnects: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            invokes_sent: self.invokes_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

type Handler = Box<dyn Fn(&PushEvent) + Send + Sync>;

/// One independently-supervised channel connection.
pub struct ChannelConnection {
    name: ChannelName,
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ConnectionState>,
    /// Outgoing handle for the current link; `None` while not Connected.
    caller: Mutex<Option<CallHandle>>,
    handlers: RwLock<HashMap<&'static str, Handler>>,
    /// One-shot guard for whole-set handler registration.
    listeners_registered: AtomicBool,
    /// Supervisor liveness; `start` is a no-op while this is set.
    running: AtomicBool,
    /// Failed attempts since the last successful connect.
    retry_count: AtomicU32,
    groups: Mutex<GroupMembership>,
    stats: AtomicStats,
}

impl ChannelConnection {
    pub fn new(
        name: ChannelName,
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            name,
            config,
            transport,
            state_tx,
            caller: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            listeners_registered: AtomicBool::new(false),
            running: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            groups: Mutex::new(GroupMembership::new()),
            stats: AtomicStats::default(),
        })
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Failed attempts since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats.snapshot()
    }

    /// Spawn the supervisor for this channel.
    ///
    /// No-op for an auth-required channel under an anonymous session, and
    /// for a channel whose supervisor is already running.
    pub fn start(self: &Arc<Self>, session: &Session) {
        if self.config.requires_auth && !session.is_authenticated() {
            log::info!(
                "channel {}: requires authentication; not starting for anonymous session",
                self.name
            );
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            log::debug!("channel {}: already running", self.name);
            return;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.supervise().await });
    }

    /// Restart a terminal channel with a fresh retry budget.
    pub fn restart(self: &Arc<Self>, session: &Session) {
        self.retry_count.store(0, Ordering::SeqCst);
        self.start(session);
    }

    async fn supervise(self: &Arc<Self>) {
        let mut was_connected = false;
        loop {
            self.set_state(if was_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            match self.transport.connect(&self.config.url).await {
                Ok(link) => {
                    let (caller, mut event_rx) = link.split();
                    *self.lock_caller() = Some(caller.clone());
                    self.retry_count.store(0, Ordering::SeqCst);
                    if was_connected {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    self.set_state(ConnectionState::Connected);
                    log::info!("channel {}: connected", self.name);

                    self.replay_groups(&caller).await;

                    while let Some(event) = event_rx.recv().await {
                        self.dispatch(&event);
                    }

                    *self.lock_caller() = None;
                    log::warn!("channel {}: transport dropped", self.name);
                    was_connected = true;
                }
                Err(e) => {
                    let attempt = self.retry_count.load(Ordering::SeqCst);
                    if attempt >= self.config.max_retries {
                        // Clear the liveness flag before the terminal state
                        // becomes observable so a restart is never lost.
                        self.running.store(false, Ordering::SeqCst);
                        self.set_state(ConnectionState::Disconnected);
                        log::error!(
                            "channel {}: giving up after {attempt} retries: {e}",
                            self.name
                        );
                        return;
                    }
                    let delay = self.config.backoff.delay_for(attempt);
                    self.retry_count.store(attempt + 1, Ordering::SeqCst);
                    log::warn!(
                        "channel {}: connect failed ({e}); retry {} of {} in {delay:?}",
                        self.name,
                        attempt + 1,
                        self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous != next {
            log::debug!("channel {}: {previous} -> {next}", self.name);
        }
        self.state_tx.send_replace(next);
    }

    /// Wait until the channel reaches Connected. Callers that need a bound
    /// wrap this in `tokio::time::timeout`.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if *rx.borrow() == ConnectionState::Connected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ─── calls ───────────────────────────────────────────────────────

    /// Issue a hub call on the live link.
    pub async fn invoke(&self, call: RemoteCall) -> Result<Option<u64>, ChannelError> {
        if self.state() != ConnectionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let caller = self
            .lock_caller()
            .clone()
            .ok_or(ChannelError::NotConnected)?;
        self.stats.invokes_sent.fetch_add(1, Ordering::Relaxed);
        match caller.invoke(call).await {
            Ok(value) => Ok(value),
            Err(InvokeError::Remote(message)) => Err(ChannelError::Remote(message)),
            Err(InvokeError::ConnectionClosed) => Err(ChannelError::NotConnected),
            Err(InvokeError::Encode(e)) => Err(ChannelError::Transport(
                ProtocolError::SerializationError(e),
            )),
        }
    }

    // ─── listeners ───────────────────────────────────────────────────

    /// Register a handler for one event name.
    ///
    /// Idempotent: a second registration for the same name is ignored with
    /// a warning, so event processing can never double up.
    pub fn on<F>(&self, event_name: &'static str, handler: F) -> bool
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.write_handlers();
        if handlers.contains_key(event_name) {
            log::warn!(
                "channel {}: handler for {event_name} already registered; ignoring duplicate",
                self.name
            );
            return false;
        }
        handlers.insert(event_name, Box::new(handler));
        true
    }

    /// Run a whole-set registration exactly once per connection.
    ///
    /// Returns `false` (and skips `register`) on every call after the
    /// first, so UI re-initialization after a reconnect is harmless.
    pub fn register_handlers_once<F>(&self, register: F) -> bool
    where
        F: FnOnce(&Self),
    {
        if self.listeners_registered.swap(true, Ordering::SeqCst) {
            log::debug!(
                "channel {}: handlers already registered; skipping",
                self.name
            );
            return false;
        }
        register(self);
        true
    }

    /// Whether a handler is registered for the given event name.
    pub fn has_handler(&self, event_name: &str) -> bool {
        self.read_handlers().contains_key(event_name)
    }

    fn dispatch(&self, event: &PushEvent) {
        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
        let handlers = self.read_handlers();
        match handlers.get(event.name()) {
            Some(handler) => handler(event),
            None => log::debug!("channel {}: no handler for {}", self.name, event.name()),
        }
    }

    // ─── groups ──────────────────────────────────────────────────────

    /// Ensure membership in a named group.
    ///
    /// Sends the join immediately when Connected; otherwise (or on a failed
    /// call) the group stays pending and is replayed on the next Connected
    /// transition. Idempotent per group name.
    pub async fn ensure_joined(&self, group: &str) {
        let call = RemoteCall::JoinGroup {
            name: group.to_string(),
        };
        self.ensure_joined_with(group, call).await;
    }

    /// Ensure membership in a question's scoped group.
    pub async fn join_question(&self, question_id: u64) {
        let group = crate::groups::question_group(question_id);
        let call = RemoteCall::JoinQuestionGroup { question_id };
        self.ensure_joined_with(&group, call).await;
    }

    async fn ensure_joined_with(&self, group: &str, call: RemoteCall) {
        if !self.lock_groups().request(group) {
            return;
        }
        if self.state() != ConnectionState::Connected {
            log::debug!("channel {}: group {group} queued until connected", self.name);
            return;
        }
        match self.invoke(call).await {
            Ok(_) => self.lock_groups().confirm(group),
            // Stays pending; the replay on the next Connected covers it.
            Err(e) => log::warn!("channel {}: join {group} failed: {e}", self.name),
        }
    }

    /// Leave a named group. Local membership is dropped even when the
    /// remote call fails; the server forgets on its own at link loss.
    pub async fn leave_group(&self, group: &str) {
        if !self.lock_groups().forget(group) {
            return;
        }
        if self.state() == ConnectionState::Connected {
            let call = RemoteCall::LeaveGroup {
                name: group.to_string(),
            };
            if let Err(e) = self.invoke(call).await {
                log::warn!("channel {}: leave {group} failed: {e}", self.name);
            }
        }
    }

    /// Whether the group is tracked (pending or confirmed).
    pub fn is_group_member(&self, group: &str) -> bool {
        self.lock_groups().is_member(group)
    }

    async fn replay_groups(&self, caller: &CallHandle) {
        let replay = self.lock_groups().replay_set();
        if replay.is_empty() {
            return;
        }
        log::info!(
            "channel {}: rejoining {} group(s) after connect",
            self.name,
            replay.len()
        );
        for group in replay {
            let call = RemoteCall::JoinGroup { name: group.clone() };
            match caller.invoke(call).await {
                Ok(_) => self.lock_groups().confirm(&group),
                Err(e) => {
                    log::warn!("channel {}: rejoin {group} failed: {e}", self.name);
                }
            }
        }
    }

    // Lock helpers that recover from poisoning instead of panicking; all
    // critical sections are short and await-free.
    fn lock_caller(&self) -> MutexGuard<'_, Option<CallHandle>> {
        self.caller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_groups(&self) -> MutexGuard<'_, GroupMembership> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<&'static str, Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<&'static str, Handler>> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryHub;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{timeout, Duration};

    fn test_channel(hub: &MemoryHub) -> Arc<ChannelConnection> {
        ChannelConnection::new(
            ChannelName::Presence,
            ChannelConfig::for_testing("memory://presence"),
            hub.transport(),
        )
    }

    async fn connected_channel(hub: &MemoryHub) -> Arc<ChannelConnection> {
        let channel = test_channel(hub);
        channel.start(&Session::anonymous());
        timeout(Duration::from_secs(1), channel.wait_until_connected())
            .await
            .expect("channel should connect");
        channel
    }

    #[tokio::test]
    async fn test_connects_and_resets_retry_count() {
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;

        assert_eq!(channel.state(), ConnectionState::Connected);
        assert_eq!(channel.retry_count(), 0);
        assert_eq!(hub.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retries_through_failures_then_connects() {
        let hub = MemoryHub::new();
        hub.fail_next_connects(2);
        let channel = connected_channel(&hub).await;

        assert_eq!(channel.state(), ConnectionState::Connected);
        assert_eq!(channel.retry_count(), 0);
        assert_eq!(hub.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_terminal_after_retry_budget() {
        let hub = MemoryHub::new();
        hub.fail_next_connects(100);
        let channel = test_channel(&hub);
        let mut states = channel.state_watch();
        channel.start(&Session::anonymous());

        // max_retries = 3: initial attempt plus three retries, then terminal.
        timeout(Duration::from_secs(2), async {
            loop {
                states.changed().await.unwrap();
                if *states.borrow() == ConnectionState::Disconnected {
                    break;
                }
            }
        })
        .await
        .expect("channel should go terminal");

        assert_eq!(hub.connect_attempts(), 4);
        assert!(matches!(
            channel.invoke(RemoteCall::MarkAllAsRead).await,
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_restart_after_terminal() {
        let hub = MemoryHub::new();
        hub.fail_next_connects(100);
        let channel = test_channel(&hub);
        channel.start(&Session::anonymous());

        timeout(Duration::from_secs(2), async {
            let mut states = channel.state_watch();
            loop {
                states.changed().await.unwrap();
                if *states.borrow() == ConnectionState::Disconnected {
                    break;
                }
            }
        })
        .await
        .unwrap();

        hub.fail_next_connects(0);
        channel.restart(&Session::anonymous());
        timeout(Duration::from_secs(1), channel.wait_until_connected())
            .await
            .expect("restarted channel should connect");
    }

    #[tokio::test]
    async fn test_auth_gated_channel_does_not_start_anonymous() {
        let hub = MemoryHub::new();
        let mut config = ChannelConfig::for_testing("memory://notifications");
        config.requires_auth = true;
        let channel =
            ChannelConnection::new(ChannelName::Notifications, config, hub.transport());

        channel.start(&Session::anonymous());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(hub.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_auth_gated_channel_starts_authenticated() {
        let hub = MemoryHub::new();
        let mut config = ChannelConfig::for_testing("memory://notifications");
        config.requires_auth = true;
        let channel =
            ChannelConnection::new(ChannelName::Notifications, config, hub.transport());

        channel.start(&Session::authenticated(uuid::Uuid::new_v4()));
        timeout(Duration::from_secs(1), channel.wait_until_connected())
            .await
            .expect("authenticated channel should connect");
    }

    #[tokio::test]
    async fn test_invoke_requires_connected() {
        let hub = MemoryHub::new();
        let channel = test_channel(&hub);
        assert!(matches!(
            channel.invoke(RemoteCall::MarkAllAsRead).await,
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_invoke_surfaces_remote_error() {
        let hub = MemoryHub::new();
        hub.fail_method("MarkAllAsRead");
        let channel = connected_channel(&hub).await;

        let result = channel.invoke(RemoteCall::MarkAllAsRead).await;
        assert!(matches!(result, Err(ChannelError::Remote(_))));
    }

    #[tokio::test]
    async fn test_duplicate_handler_ignored() {
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;
        let hits = Arc::new(AtomicUsize::new(0));

        let first_hits = Arc::clone(&hits);
        assert!(channel.on("OnlineCount", move |_| {
            first_hits.fetch_add(1, Ordering::SeqCst);
        }));
        let second_hits = Arc::clone(&hits);
        assert!(!channel.on("OnlineCount", move |_| {
            second_hits.fetch_add(100, Ordering::SeqCst);
        }));

        hub.push(PushEvent::OnlineCount { count: 3 });
        timeout(Duration::from_secs(1), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler should fire");

        // Only the first handler ran, exactly once.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_handlers_once_guard() {
        let hub = MemoryHub::new();
        let channel = test_channel(&hub);
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            channel.register_handlers_once(move |ch| {
                runs.fetch_add(1, Ordering::SeqCst);
                ch.on("UserOnline", |_| {});
            });
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(channel.has_handler("UserOnline"));
    }

    #[tokio::test]
    async fn test_group_join_sent_when_connected() {
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;

        channel.ensure_joined("question-42").await;
        channel.ensure_joined("question-42").await;

        assert_eq!(hub.calls_for("JoinGroup"), 1);
        assert!(channel.is_group_member("question-42"));
    }

    #[tokio::test]
    async fn test_group_join_queued_until_connected() {
        let hub = MemoryHub::new();
        hub.fail_next_connects(1);
        let channel = test_channel(&hub);

        // Requested before the supervisor ever connects.
        channel.ensure_joined("question-7").await;
        assert!(channel.is_group_member("question-7"));

        channel.start(&Session::anonymous());
        timeout(Duration::from_secs(1), channel.wait_until_connected())
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while hub.calls_for("JoinGroup") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queued group should be joined on connect");
        assert_eq!(hub.calls_for("JoinGroup"), 1);
    }

    #[tokio::test]
    async fn test_groups_replayed_after_reconnect() {
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;
        channel.ensure_joined("question-1").await;
        channel.ensure_joined("question-2").await;
        assert_eq!(hub.calls_for("JoinGroup"), 2);

        hub.drop_links();
        timeout(Duration::from_secs(1), channel.wait_until_connected())
            .await
            .expect("channel should reconnect");

        timeout(Duration::from_secs(1), async {
            while hub.calls_for("JoinGroup") < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both groups should be rejoined");
        // Each group re-sent exactly once.
        assert_eq!(hub.calls_for("JoinGroup"), 4);
        assert_eq!(channel.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_leave_group_stops_replay() {
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;
        channel.ensure_joined("question-9").await;
        channel.leave_group("question-9").await;
        assert_eq!(hub.calls_for("LeaveGroup"), 1);

        hub.drop_links();
        timeout(Duration::from_secs(2), async {
            while channel.stats().reconnects == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel should reconnect");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No rejoin for a group we left.
        assert_eq!(hub.calls_for("JoinGroup"), 1);
        assert!(!channel.is_group_member("question-9"));
    }
}
