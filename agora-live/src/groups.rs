//! Group membership tracking with replay across reconnects.
//!
//! A group is a server-side scoped subscription (e.g. "question-42") that
//! filters which push events a channel receives. The server forgets group
//! membership whenever the transport drops, so the client keeps its own
//! record and re-requests every previously-confirmed group after each
//! reconnect.
//!
//! Two sets:
//! - `pending` — requested while the channel was not Connected; sent on the
//!   next Connected transition.
//! - `confirmed` — acknowledged by the server on the current or an earlier
//!   link; re-sent after every reconnect.

use std::collections::BTreeSet;

/// Group name for a question's scoped subscription.
pub fn question_group(question_id: u64) -> String {
    format!("question-{question_id}")
}

/// Pending and confirmed group membership for one channel.
#[derive(Debug, Default)]
pub struct GroupMembership {
    pending: BTreeSet<String>,
    confirmed: BTreeSet<String>,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request membership in a group.
    ///
    /// Idempotent: returns `false` if the group is already pending or
    /// confirmed.
    pub fn request(&mut self, group: &str) -> bool {
        if self.confirmed.contains(group) || self.pending.contains(group) {
            return false;
        }
        self.pending.insert(group.to_string())
    }

    /// Mark a group as acknowledged by the server.
    pub fn confirm(&mut self, group: &str) {
        self.pending.remove(group);
        self.confirmed.insert(group.to_string());
    }

    /// Drop a group entirely (explicit leave).
    pub fn forget(&mut self, group: &str) -> bool {
        let was_pending = self.pending.remove(group);
        let was_confirmed = self.confirmed.remove(group);
        was_pending || was_confirmed
    }

    /// Whether this group is tracked (pending or confirmed).
    pub fn is_member(&self, group: &str) -> bool {
        self.pending.contains(group) || self.confirmed.contains(group)
    }

    /// Groups to (re-)join on a Connected transition: confirmed ∪ pending,
    /// each exactly once, in stable order.
    pub fn replay_set(&self) -> Vec<String> {
        self.confirmed
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of tracked groups.
    pub fn len(&self) -> usize {
        // Sets are kept disjoint by request/confirm, but count defensively
        // through the union so an overlap can never double-count.
        self.replay_set().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.confirmed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_idempotent() {
        let mut membership = GroupMembership::new();
        assert!(membership.request("question-42"));
        assert!(!membership.request("question-42"));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn test_confirm_moves_out_of_pending() {
        let mut membership = GroupMembership::new();
        membership.request("question-42");
        membership.confirm("question-42");

        // Confirmed groups reject duplicate requests too.
        assert!(!membership.request("question-42"));
        assert!(membership.is_member("question-42"));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn test_replay_covers_confirmed_and_pending_once_each() {
        let mut membership = GroupMembership::new();
        membership.request("question-1");
        membership.confirm("question-1");
        membership.request("question-2");

        let replay = membership.replay_set();
        assert_eq!(replay, vec!["question-1".to_string(), "question-2".to_string()]);
    }

    #[test]
    fn test_forget_removes_everywhere() {
        let mut membership = GroupMembership::new();
        membership.request("a");
        membership.request("b");
        membership.confirm("b");

        assert!(membership.forget("a"));
        assert!(membership.forget("b"));
        assert!(!membership.forget("c"));
        assert!(membership.is_empty());
        assert!(membership.replay_set().is_empty());
    }

    #[test]
    fn test_question_group_name() {
        assert_eq!(question_group(42), "question-42");
    }
}
