//! Engagement-gated view tracking.
//!
//! A view only counts once the reader actually engaged with the resource:
//! either they scrolled past half of the scrollable height, or the
//! document is too short to scroll meaningfully and they dwelled on it.
//! Each resource is reported at most once per durable session, across
//! reconnects and reloads, enforced by three independent gates:
//!
//! 1. phase — `Reported` is set before the call leaves, so a hung call
//!    can never let a second report slip through;
//! 2. the session store's view record, consulted at arming and again at
//!    report time;
//! 3. the server's own idempotence, which this layer does not rely on.
//!
//! A failed or impossible remote report still writes the record and bumps
//! the optimistic overlay instead; it is never retried. The next
//! authoritative count from the server overwrites the overlay.

use std::time::{Duration, Instant};

use crate::channel::{ChannelConnection, ConnectionState};
use crate::protocol::RemoteCall;
use crate::sinks::ViewCounts;
use crate::store::{SessionStore, StoreError};

/// Fraction of the scrollable height that counts as engagement.
pub const SCROLL_REPORT_FRACTION: f64 = 0.5;

/// Documents at most this many viewports tall use the dwell gate instead
/// of the scroll gate.
pub const SHORT_DOCUMENT_RATIO: f64 = 1.2;

/// Dwell time before a short document counts as viewed.
pub const DWELL_DELAY: Duration = Duration::from_secs(4);

/// A scroll-position snapshot from the rendering surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    /// Pixels scrolled from the top.
    pub scroll_top: f64,
    /// Visible height.
    pub viewport_height: f64,
    /// Total document height.
    pub document_height: f64,
}

impl ScrollMetrics {
    /// Height the reader can actually scroll through.
    pub fn scrollable_height(&self) -> f64 {
        (self.document_height - self.viewport_height).max(0.0)
    }

    /// Whether the reader has scrolled past the engagement threshold.
    pub fn past_report_threshold(&self) -> bool {
        let scrollable = self.scrollable_height();
        scrollable > 0.0 && self.scroll_top >= scrollable * SCROLL_REPORT_FRACTION
    }

    /// Whether the document is too short for scrolling to mean anything.
    pub fn is_short_document(&self) -> bool {
        self.document_height <= self.viewport_height * SHORT_DOCUMENT_RATIO
    }
}

/// Tracker phase. Strictly forward: `NotArmed → Armed → Reported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    NotArmed,
    Armed,
    Reported,
}

/// How a report resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The server accepted the call; the view record was written.
    Remote,
    /// The call failed or the channel was down; the record was written
    /// and the local overlay bumped instead. No retry follows.
    LocalFallback,
    /// A record already existed; nothing was sent or written.
    AlreadyReported,
}

/// Per-resource view tracker for one rendered page.
#[derive(Debug)]
pub struct ViewTracker {
    resource_id: String,
    phase: ViewPhase,
    short_document: bool,
    armed_at: Option<Instant>,
}

impl ViewTracker {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            phase: ViewPhase::NotArmed,
            short_document: false,
            armed_at: None,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn phase(&self) -> ViewPhase {
        self.phase
    }

    /// Arm the tracker once the page has rendered.
    ///
    /// Consults the durable store first: a resource viewed earlier in this
    /// session jumps straight to `Reported` and returns `false`. Returns
    /// `true` when armed (already-armed calls are a no-op `true`).
    pub fn arm(&mut self, store: &SessionStore, metrics: &ScrollMetrics) -> bool {
        match self.phase {
            ViewPhase::Armed => return true,
            ViewPhase::Reported => return false,
            ViewPhase::NotArmed => {}
        }
        if store.has_viewed(&self.resource_id) {
            log::debug!("view {}: already recorded this session", self.resource_id);
            self.phase = ViewPhase::Reported;
            return false;
        }
        self.short_document = metrics.is_short_document();
        self.armed_at = Some(Instant::now());
        self.phase = ViewPhase::Armed;
        true
    }

    /// Feed a scroll snapshot; `true` means the report should fire now.
    pub fn on_scroll(&mut self, metrics: &ScrollMetrics) -> bool {
        self.phase == ViewPhase::Armed && metrics.past_report_threshold()
    }

    /// Deadline at which dwell fires, for short documents only.
    pub fn dwell_deadline(&self) -> Option<Instant> {
        if self.phase == ViewPhase::Armed && self.short_document {
            self.armed_at.map(|armed| armed + DWELL_DELAY)
        } else {
            None
        }
    }

    /// Whether the dwell gate has elapsed at `now`.
    pub fn dwell_elapsed(&self, now: Instant) -> bool {
        self.dwell_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Fire the report.
    ///
    /// The phase flips to `Reported` before the call leaves, so nothing
    /// this tracker does afterwards can produce a second submission. When
    /// the channel is Connected the count goes to the server; any failure
    /// (or a disconnected channel) falls back to the durable record plus
    /// a local overlay bump, without retrying.
    pub async fn report(
        &mut self,
        channel: &ChannelConnection,
        views: &mut ViewCounts,
        store: &mut SessionStore,
    ) -> Result<ReportOutcome, StoreError> {
        if self.phase == ViewPhase::Reported {
            return Ok(ReportOutcome::AlreadyReported);
        }
        if store.has_viewed(&self.resource_id) {
            self.phase = ViewPhase::Reported;
            return Ok(ReportOutcome::AlreadyReported);
        }
        self.phase = ViewPhase::Reported;

        if channel.state() == ConnectionState::Connected {
            let call = RemoteCall::IncreaseViewCount {
                resource_id: self.resource_id.clone(),
            };
            match channel.invoke(call).await {
                Ok(_) => {
                    store.record_view(&self.resource_id)?;
                    log::debug!("view {}: reported remotely", self.resource_id);
                    return Ok(ReportOutcome::Remote);
                }
                Err(e) => {
                    log::warn!(
                        "view {}: remote report failed ({e}); applying locally",
                        self.resource_id
                    );
                }
            }
        } else {
            log::debug!(
                "view {}: channel not connected; applying locally",
                self.resource_id
            );
        }

        store.record_view(&self.resource_id)?;
        views.bump_local(&self.resource_id);
        Ok(ReportOutcome::LocalFallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelConnection};
    use crate::protocol::ChannelName;
    use crate::registry::Session;
    use crate::transport::MemoryHub;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn tall_page() -> ScrollMetrics {
        ScrollMetrics {
            scroll_top: 0.0,
            viewport_height: 800.0,
            document_height: 4000.0,
        }
    }

    fn short_page() -> ScrollMetrics {
        ScrollMetrics {
            scroll_top: 0.0,
            viewport_height: 800.0,
            document_height: 900.0,
        }
    }

    async fn connected_channel(hub: &MemoryHub) -> Arc<ChannelConnection> {
        let channel = ChannelConnection::new(
            ChannelName::ViewCount,
            ChannelConfig::for_testing("memory://view-count"),
            hub.transport(),
        );
        channel.start(&Session::anonymous());
        timeout(Duration::from_secs(1), channel.wait_until_connected())
            .await
            .expect("channel should connect");
        channel
    }

    #[test]
    fn test_scroll_threshold_math() {
        // Scrollable height 3200, threshold at 1600.
        let mut metrics = tall_page();
        assert!(!metrics.past_report_threshold());
        metrics.scroll_top = 1599.0;
        assert!(!metrics.past_report_threshold());
        metrics.scroll_top = 1600.0;
        assert!(metrics.past_report_threshold());
    }

    #[test]
    fn test_short_document_classification() {
        assert!(short_page().is_short_document());
        assert!(!tall_page().is_short_document());
        // Exactly at the ratio boundary still counts as short.
        let boundary = ScrollMetrics {
            scroll_top: 0.0,
            viewport_height: 800.0,
            document_height: 960.0,
        };
        assert!(boundary.is_short_document());
    }

    #[test]
    fn test_unscrollable_document_never_passes_scroll_gate() {
        let metrics = ScrollMetrics {
            scroll_top: 0.0,
            viewport_height: 800.0,
            document_height: 600.0,
        };
        assert_eq!(metrics.scrollable_height(), 0.0);
        assert!(!metrics.past_report_threshold());
    }

    #[test]
    fn test_arm_skips_already_viewed_resource() {
        let mut store = SessionStore::in_memory();
        store.record_view("question-5").unwrap();

        let mut tracker = ViewTracker::new("question-5");
        assert!(!tracker.arm(&store, &tall_page()));
        assert_eq!(tracker.phase(), ViewPhase::Reported);
    }

    #[test]
    fn test_arm_then_scroll_fires_once() {
        let store = SessionStore::in_memory();
        let mut tracker = ViewTracker::new("question-1");
        assert!(tracker.arm(&store, &tall_page()));

        let mut metrics = tall_page();
        assert!(!tracker.on_scroll(&metrics));
        metrics.scroll_top = 2000.0;
        assert!(tracker.on_scroll(&metrics));
    }

    #[test]
    fn test_dwell_only_for_short_documents() {
        let store = SessionStore::in_memory();

        let mut short = ViewTracker::new("a");
        short.arm(&store, &short_page());
        let deadline = short.dwell_deadline().expect("short page dwells");
        assert!(!short.dwell_elapsed(deadline - Duration::from_millis(1)));
        assert!(short.dwell_elapsed(deadline));

        let mut tall = ViewTracker::new("b");
        tall.arm(&store, &tall_page());
        assert!(tall.dwell_deadline().is_none());
    }

    #[tokio::test]
    async fn test_report_remote_when_connected() {
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;
        let mut store = SessionStore::in_memory();
        let mut views = ViewCounts::new();

        let mut tracker = ViewTracker::new("question-10");
        tracker.arm(&store, &tall_page());
        let outcome = tracker
            .report(&channel, &mut views, &mut store)
            .await
            .unwrap();

        assert_eq!(outcome, ReportOutcome::Remote);
        assert_eq!(hub.calls_for("IncreaseViewCount"), 1);
        assert!(store.has_viewed("question-10"));
        // No overlay: the authoritative push will carry the new count.
        assert!(!views.has_overlay("question-10"));
    }

    #[tokio::test]
    async fn test_report_falls_back_when_disconnected() {
        let hub = MemoryHub::new();
        // Never started: stays Disconnected.
        let channel = ChannelConnection::new(
            ChannelName::ViewCount,
            ChannelConfig::for_testing("memory://view-count"),
            hub.transport(),
        );
        let mut store = SessionStore::in_memory();
        let mut views = ViewCounts::new();
        views.set_authoritative("question-11", 40);

        let mut tracker = ViewTracker::new("question-11");
        tracker.arm(&store, &tall_page());
        let outcome = tracker
            .report(&channel, &mut views, &mut store)
            .await
            .unwrap();

        assert_eq!(outcome, ReportOutcome::LocalFallback);
        assert_eq!(hub.calls_for("IncreaseViewCount"), 0);
        assert!(store.has_viewed("question-11"));
        assert_eq!(views.displayed("question-11"), 41);
    }

    #[tokio::test]
    async fn test_report_falls_back_on_remote_failure() {
        let hub = MemoryHub::new();
        hub.fail_method("IncreaseViewCount");
        let channel = connected_channel(&hub).await;
        let mut store = SessionStore::in_memory();
        let mut views = ViewCounts::new();

        let mut tracker = ViewTracker::new("question-12");
        tracker.arm(&store, &tall_page());
        let outcome = tracker
            .report(&channel, &mut views, &mut store)
            .await
            .unwrap();

        // One attempt, no retry, local application instead.
        assert_eq!(outcome, ReportOutcome::LocalFallback);
        assert_eq!(hub.calls_for("IncreaseViewCount"), 1);
        assert!(store.has_viewed("question-12"));
        assert_eq!(views.displayed("question-12"), 1);
    }

    #[tokio::test]
    async fn test_second_report_is_noop() {
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;
        let mut store = SessionStore::in_memory();
        let mut views = ViewCounts::new();

        let mut tracker = ViewTracker::new("question-13");
        tracker.arm(&store, &tall_page());
        tracker
            .report(&channel, &mut views, &mut store)
            .await
            .unwrap();
        let second = tracker
            .report(&channel, &mut views, &mut store)
            .await
            .unwrap();

        assert_eq!(second, ReportOutcome::AlreadyReported);
        assert_eq!(hub.calls_for("IncreaseViewCount"), 1);
    }

    #[tokio::test]
    async fn test_fresh_tracker_honors_existing_record() {
        // A new tracker for the same resource (e.g. after navigation)
        // still reports nothing: the store record gates it.
        let hub = MemoryHub::new();
        let channel = connected_channel(&hub).await;
        let mut store = SessionStore::in_memory();
        let mut views = ViewCounts::new();

        let mut first = ViewTracker::new("question-14");
        first.arm(&store, &tall_page());
        first
            .report(&channel, &mut views, &mut store)
            .await
            .unwrap();

        let mut second = ViewTracker::new("question-14");
        assert!(!second.arm(&store, &tall_page()));
        let outcome = second
            .report(&channel, &mut views, &mut store)
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::AlreadyReported);
        assert_eq!(hub.calls_for("IncreaseViewCount"), 1);
    }
}
