//! State sinks: small, independent reducers over incoming push events.
//!
//! Each sink is a pure merge (`apply` an event → new state) kept separate
//! from its render output so the merge rule is testable without any UI.
//! `render()` returns a plain data struct the UI layer draws from; markup
//! is out of scope here.
//!
//! Merge rules, fixed per counter (mixing them drifts the display):
//!
//! | Sink                | Rule                                      |
//! |---------------------|-------------------------------------------|
//! | Notification badge  | delta-apply (+1 / -1 / reset), clamped ≥0 |
//! | Presence set        | authoritative replace + idempotent edits  |
//! | Reputation          | authoritative-set (delta is derived)      |
//! | Badge progress      | authoritative-set per badge               |
//! | View counts         | authoritative base + optimistic overlay   |
//!
//! Sinks tolerate out-of-order authoritative updates: the last value to
//! arrive wins, by arrival order, not causal order.

use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::protocol::{NotificationEvent, PushEvent};

/// How many chat/activity items the feeds retain for rendering.
const FEED_CAPACITY: usize = 100;

// ───────────────────────────────────────────────────────────────────
// Notification badge
// ───────────────────────────────────────────────────────────────────

/// Unread-notification badge counter. Delta-apply, never negative.
#[derive(Debug, Default)]
pub struct NotificationBadge {
    count: u32,
    latest: Option<NotificationEvent>,
}

/// Render data for the badge region and the toast area.
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeRender {
    pub count: u32,
    /// Most recent notification, for a transient toast. `None` once cleared.
    pub latest: Option<NotificationEvent>,
}

impl NotificationBadge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new notification arrived: +1.
    pub fn notification_received(&mut self, event: &NotificationEvent) {
        self.count = self.count.saturating_add(1);
        self.latest = Some(event.clone());
    }

    /// One notification was read somewhere: -1, clamped at 0.
    pub fn marked_as_read(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    /// Everything was read: reset to 0.
    pub fn all_marked_as_read(&mut self) {
        self.count = 0;
        self.latest = None;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn render(&self) -> BadgeRender {
        BadgeRender {
            count: self.count,
            latest: self.latest.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Online presence
// ───────────────────────────────────────────────────────────────────

/// Who is online right now.
///
/// Full `OnlineUsers` lists replace the set outright; single-user events
/// are idempotent set edits. A standalone `OnlineCount` may exceed the
/// known set (the server counts anonymous visitors too) and overrides the
/// derived count until the next full list.
#[derive(Debug, Default)]
pub struct PresenceSet {
    online: HashSet<Uuid>,
    announced_count: Option<u64>,
}

/// Render data for the presence indicators.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRender {
    pub online_count: u64,
    pub online_users: Vec<Uuid>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative full list: replaces prior state.
    pub fn replace_all(&mut self, user_ids: &[Uuid]) {
        self.online = user_ids.iter().copied().collect();
        self.announced_count = None;
    }

    /// A user came online. Adding an already-present id is a no-op.
    pub fn user_online(&mut self, user_id: Uuid) {
        self.online.insert(user_id);
    }

    /// A user went offline. Removing an absent id is a no-op.
    pub fn user_offline(&mut self, user_id: Uuid) {
        self.online.remove(&user_id);
    }

    /// Authoritative total from the server.
    pub fn set_count(&mut self, count: u64) {
        self.announced_count = Some(count);
    }

    pub fn is_online(&self, user_id: &Uuid) -> bool {
        self.online.contains(user_id)
    }

    pub fn online_count(&self) -> u64 {
        self.announced_count.unwrap_or(self.online.len() as u64)
    }

    pub fn render(&self) -> PresenceRender {
        let mut online_users: Vec<Uuid> = self.online.iter().copied().collect();
        online_users.sort();
        PresenceRender {
            online_count: self.online_count(),
            online_users,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Reputation
// ───────────────────────────────────────────────────────────────────

/// The signed-in user's reputation score.
///
/// Stored state is always the server's value; the delta shown during the
/// change animation is derived from the previous value, never accumulated
/// locally.
#[derive(Debug, Default)]
pub struct Reputation {
    value: Option<i64>,
    last_delta: i64,
    last_reason: Option<String>,
}

/// Render data for the score display and its transient animation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationRender {
    pub value: i64,
    /// Signed change from the previous known value; 0 on the first update.
    pub delta: i64,
    /// Omitted when the server sent no reason.
    pub reason: Option<String>,
}

impl Reputation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative-set from a `ReputationChanged` push.
    pub fn set(&mut self, new_value: i64, reason: Option<String>) {
        self.last_delta = match self.value {
            Some(old) => new_value - old,
            None => 0,
        };
        self.value = Some(new_value);
        self.last_reason = reason;
    }

    pub fn value(&self) -> Option<i64> {
        self.value
    }

    pub fn render(&self) -> Option<ReputationRender> {
        self.value.map(|value| ReputationRender {
            value,
            delta: self.last_delta,
            reason: self.last_reason.clone(),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Badge progress
// ───────────────────────────────────────────────────────────────────

/// Progress toward one badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: u32,
    pub target: u32,
}

impl Progress {
    /// Derived completion percentage: `min(100, round(current/target*100))`,
    /// 0 when the target is unset.
    pub fn percent(&self) -> u32 {
        if self.target == 0 {
            return 0;
        }
        let pct = (self.current as f64 / self.target as f64 * 100.0).round() as u32;
        pct.min(100)
    }
}

/// Per-badge progress, authoritative-set per update.
#[derive(Debug, Default)]
pub struct BadgeProgress {
    progress: HashMap<String, Progress>,
    awarded: Vec<String>,
}

/// Render data for one badge progress bar.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRender {
    pub badge_id: String,
    pub current: u32,
    pub target: u32,
    pub percent: u32,
}

impl BadgeProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative `{current, target}` for one badge.
    pub fn update(&mut self, badge_id: &str, current: u32, target: u32) {
        self.progress
            .insert(badge_id.to_string(), Progress { current, target });
    }

    /// A badge was awarded; its progress entry is complete and removed.
    pub fn awarded(&mut self, badge_id: &str) {
        self.progress.remove(badge_id);
        self.awarded.push(badge_id.to_string());
    }

    pub fn progress_for(&self, badge_id: &str) -> Option<Progress> {
        self.progress.get(badge_id).copied()
    }

    pub fn awarded_badges(&self) -> &[String] {
        &self.awarded
    }

    pub fn render(&self) -> Vec<ProgressRender> {
        let mut rows: Vec<ProgressRender> = self
            .progress
            .iter()
            .map(|(badge_id, p)| ProgressRender {
                badge_id: badge_id.clone(),
                current: p.current,
                target: p.target,
                percent: p.percent(),
            })
            .collect();
        rows.sort_by(|a, b| a.badge_id.cmp(&b.badge_id));
        rows
    }
}

// ───────────────────────────────────────────────────────────────────
// View counts
// ───────────────────────────────────────────────────────────────────

/// Per-resource view counters: authoritative base + optimistic overlay.
///
/// The overlay exists only for the offline fallback in the view tracker;
/// any authoritative push for a key clears that key's overlay, so the
/// display always converges to the server's value.
#[derive(Debug, Default)]
pub struct ViewCounts {
    base: HashMap<String, u64>,
    overlay: HashMap<String, u64>,
}

impl ViewCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative value from the server. Replaces base, clears overlay.
    pub fn set_authoritative(&mut self, resource_id: &str, count: u64) {
        self.base.insert(resource_id.to_string(), count);
        self.overlay.remove(resource_id);
    }

    /// Optimistic local +1, used only when the channel is unreachable.
    pub fn bump_local(&mut self, resource_id: &str) {
        *self.overlay.entry(resource_id.to_string()).or_insert(0) += 1;
    }

    /// Displayed count: base plus any optimistic overlay.
    pub fn displayed(&self, resource_id: &str) -> u64 {
        self.base.get(resource_id).copied().unwrap_or(0)
            + self.overlay.get(resource_id).copied().unwrap_or(0)
    }

    /// Whether an optimistic overlay is pending for this resource.
    pub fn has_overlay(&self, resource_id: &str) -> bool {
        self.overlay.contains_key(resource_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Chat and activity feeds
// ───────────────────────────────────────────────────────────────────

/// One rendered chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub sender_id: Uuid,
    pub sender_name: String,
    pub body: String,
    pub sent_at: u64,
}

/// One rendered activity feed row.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRow {
    pub actor_name: String,
    pub action: String,
    pub target_id: String,
    pub occurred_at: u64,
}

/// Bounded feed of recent items, oldest dropped first.
#[derive(Debug)]
pub struct Feed<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Feed<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(FEED_CAPACITY)),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self::new(FEED_CAPACITY)
    }
}

// ───────────────────────────────────────────────────────────────────
// Sink set: event → sink dispatch
// ───────────────────────────────────────────────────────────────────

/// All sinks behind one `apply`.
///
/// Folding an event into one sink can never block delivery to another:
/// merges are infallible, and events a sink does not care about are
/// ignored.
#[derive(Debug, Default)]
pub struct SinkSet {
    pub badge: NotificationBadge,
    pub presence: PresenceSet,
    pub reputation: Reputation,
    pub badges: BadgeProgress,
    pub views: ViewCounts,
    pub chat: Feed<ChatLine>,
    pub activity: Feed<ActivityRow>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one push event into the sink it belongs to.
    pub fn apply(&mut self, event: &PushEvent) {
        match event {
            PushEvent::ReceiveNotification(n) => self.badge.notification_received(n),
            PushEvent::NotificationMarkedAsRead { .. } => self.badge.marked_as_read(),
            PushEvent::AllNotificationsMarkedAsRead => self.badge.all_marked_as_read(),
            PushEvent::ReputationChanged {
                new_value, reason, ..
            } => self.reputation.set(*new_value, reason.clone()),

            PushEvent::UserOnline { user_id } => self.presence.user_online(*user_id),
            PushEvent::UserOffline { user_id } => self.presence.user_offline(*user_id),
            PushEvent::OnlineUsers { user_ids } => self.presence.replace_all(user_ids),
            PushEvent::OnlineCount { count } => self.presence.set_count(*count),

            PushEvent::ReceiveCurrentViewCount { resource_id, count }
            | PushEvent::ReceiveUpdatedViewCount { resource_id, count } => {
                self.views.set_authoritative(resource_id, *count)
            }

            PushEvent::BadgeProgressUpdated {
                badge_id,
                current,
                target,
            } => self.badges.update(badge_id, *current, *target),
            PushEvent::BadgeAwarded { badge_id, .. } => self.badges.awarded(badge_id),

            PushEvent::ReceiveChatMessage {
                sender_id,
                sender_name,
                body,
                sent_at,
            } => self.chat.push(ChatLine {
                sender_id: *sender_id,
                sender_name: sender_name.clone(),
                body: body.clone(),
                sent_at: *sent_at,
            }),
            PushEvent::ActivityRecorded {
                actor_name,
                action,
                target_id,
                occurred_at,
            } => self.activity.push(ActivityRow {
                actor_name: actor_name.clone(),
                action: action.clone(),
                target_id: target_id.clone(),
                occurred_at: *occurred_at,
            }),
        }
    }
}
