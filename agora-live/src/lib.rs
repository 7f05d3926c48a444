//! # agora-live — Real-time channel layer for Agora
//!
//! Client-side manager for the live-update channels of a community Q&A
//! app: independently-failing connections, idempotent listener wiring,
//! push-driven state sinks and exactly-once view reporting.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  get_or_create   ┌───────────────────┐
//! │ ChannelRegistry  │ ───────────────► │ ChannelConnection │  × N
//! │ (per session)    │                  │ (own supervisor)  │
//! └──────────────────┘                  └─────────┬─────────┘
//!                                                 │ Transport
//!                                                 ▼
//!                                       ┌───────────────────┐
//!          push events ◄─────────────── │ WebSocket / hub   │
//!          hub calls   ───────────────► │ (binary protocol) │
//!                                       └───────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────────────────────┐
//! │ SinkSet: badge · presence · reputation ·     │
//! │ badges · view counts · chat · activity       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded envelopes)
//! - [`transport`] — Transport capability: WebSocket and in-memory hub
//! - [`channel`] — Per-channel supervisor with backoff and reconnect
//! - [`registry`] — One connection per channel name, injected not global
//! - [`groups`] — Group membership with replay across reconnects
//! - [`sinks`] — Push-driven render state
//! - [`view`] — Engagement-gated, at-most-once view reporting
//! - [`store`] — Session-durable record log
//! - [`backoff`] — Retry delay schedule

pub mod backoff;
pub mod channel;
pub mod groups;
pub mod protocol;
pub mod registry;
pub mod sinks;
pub mod store;
pub mod transport;
pub mod view;

// Re-exports for convenience
pub use backoff::{BackoffSchedule, DEFAULT_MAX_RETRIES, DEFAULT_SCHEDULE_MS};
pub use channel::{
    ChannelConfig, ChannelConnection, ChannelError, ChannelStats, ConnectionState,
};
pub use groups::{question_group, GroupMembership};
pub use protocol::{
    ChannelName, ClientEnvelope, NotificationEvent, ProtocolError, PushEvent, RemoteCall,
    ServerEnvelope,
};
pub use registry::{ChannelRegistry, RegistryConfig, Session};
pub use sinks::{
    ActivityRow, BadgeProgress, BadgeRender, ChatLine, Feed, NotificationBadge, PresenceRender,
    PresenceSet, Progress, ProgressRender, Reputation, ReputationRender, SinkSet, ViewCounts,
};
pub use store::{SessionRecord, SessionStore, StoreError};
pub use transport::{
    CallHandle, InvokeError, MemoryHub, MemoryTransport, Transport, TransportLink,
    WebSocketTransport,
};
pub use view::{
    ReportOutcome, ScrollMetrics, ViewPhase, ViewTracker, DWELL_DELAY, SCROLL_REPORT_FRACTION,
    SHORT_DOCUMENT_RATIO,
};
