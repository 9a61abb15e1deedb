//! # Change Subscriptions
//!
//! Per-group queues of [`ContactChange`]s for remote bridges, which poll
//! them over HTTP. The kernel publishes synchronously from inside command
//! execution, so the hub uses a plain mutex and never blocks on I/O.
//!
//! A subscription receives the changes of contacts owned by its group.
//! Each queue holds at most [`MAX_PENDING_CHANGES`]; on overflow the oldest
//! change is dropped and counted. Subscriptions whose group no longer
//! exists are dropped by [`SubscriptionHub::retain_groups`].

use bassline_core::limits::MAX_PENDING_CHANGES;
use bassline_core::{ContactChange, GroupId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct Subscription {
    group_id: GroupId,
    queue: VecDeque<ContactChange>,
    dropped: u64,
}

#[derive(Debug, Default)]
struct HubState {
    next_id: u64,
    subscriptions: BTreeMap<u64, Subscription>,
}

/// Changes drained from one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Drained {
    pub changes: Vec<ContactChange>,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct SubscriptionHub {
    state: Mutex<HubState>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, group_id: GroupId) -> u64 {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.insert(
            id,
            Subscription {
                group_id,
                queue: VecDeque::new(),
                dropped: 0,
            },
        );
        tracing::debug!(subscription_id = id, group_id = %group_id, "subscribed");
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.lock().subscriptions.remove(&id).is_some()
    }

    /// Queue `change` on every subscription to its group.
    pub fn publish(&self, change: &ContactChange) {
        let mut state = self.lock();
        for (id, subscription) in state
            .subscriptions
            .iter_mut()
            .filter(|(_, s)| s.group_id == change.group_id)
        {
            if subscription.queue.len() >= MAX_PENDING_CHANGES {
                subscription.queue.pop_front();
                subscription.dropped += 1;
                tracing::warn!(
                    subscription_id = *id,
                    group_id = %change.group_id,
                    "subscription queue full, dropped oldest change"
                );
            }
            subscription.queue.push_back(change.clone());
        }
    }

    /// Take everything queued for `id`; `None` for unknown subscriptions.
    pub fn drain(&self, id: u64) -> Option<Drained> {
        let mut state = self.lock();
        let subscription = state.subscriptions.get_mut(&id)?;
        Some(Drained {
            changes: subscription.queue.drain(..).collect(),
            dropped: std::mem::take(&mut subscription.dropped),
        })
    }

    /// Group a subscription listens to.
    pub fn group_of(&self, id: u64) -> Option<GroupId> {
        self.lock().subscriptions.get(&id).map(|s| s.group_id)
    }

    /// Drop every subscription whose group fails `keep`. Returns how many
    /// were dropped.
    pub fn retain_groups(&self, mut keep: impl FnMut(GroupId) -> bool) -> usize {
        let mut state = self.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|id, subscription| {
            let alive = keep(subscription.group_id);
            if !alive {
                tracing::debug!(
                    subscription_id = *id,
                    group_id = %subscription.group_id,
                    "group removed, subscription dropped"
                );
            }
            alive
        });
        before - state.subscriptions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bassline_core::ContactId;
    use serde_json::json;

    fn change(group: u64, value: i64) -> ContactChange {
        ContactChange {
            contact_id: ContactId(1),
            group_id: GroupId(group),
            value: Some(json!(value)),
            timestamp: 0,
        }
    }

    #[test]
    fn only_matching_group_is_queued() {
        let hub = SubscriptionHub::new();
        let a = hub.subscribe(GroupId(1));
        let b = hub.subscribe(GroupId(2));

        hub.publish(&change(1, 10));

        assert_eq!(hub.drain(a).map(|d| d.changes.len()), Some(1));
        assert_eq!(hub.drain(b).map(|d| d.changes.len()), Some(0));
    }

    #[test]
    fn drain_empties_the_queue() {
        let hub = SubscriptionHub::new();
        let id = hub.subscribe(GroupId(1));
        hub.publish(&change(1, 1));
        hub.publish(&change(1, 2));

        let drained = hub.drain(id).expect("subscription");
        assert_eq!(drained.changes, vec![change(1, 1), change(1, 2)]);
        assert_eq!(hub.drain(id).map(|d| d.changes.len()), Some(0));
    }

    #[test]
    fn overflow_drops_oldest() {
        let hub = SubscriptionHub::new();
        let id = hub.subscribe(GroupId(1));
        for n in 0..=MAX_PENDING_CHANGES as i64 {
            hub.publish(&change(1, n));
        }

        let drained = hub.drain(id).expect("subscription");
        assert_eq!(drained.dropped, 1);
        assert_eq!(drained.changes.len(), MAX_PENDING_CHANGES);
        assert_eq!(drained.changes[0], change(1, 1));
    }

    #[test]
    fn subscriptions_of_removed_groups_are_dropped() {
        let hub = SubscriptionHub::new();
        let gone = hub.subscribe(GroupId(1));
        let kept = hub.subscribe(GroupId(2));

        assert_eq!(hub.retain_groups(|group| group != GroupId(1)), 1);

        assert!(hub.drain(gone).is_none());
        assert_eq!(hub.group_of(kept), Some(GroupId(2)));
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn unknown_subscription() {
        let hub = SubscriptionHub::new();
        assert!(hub.drain(9).is_none());
        assert!(!hub.unsubscribe(9));
        let id = hub.subscribe(GroupId(1));
        assert!(hub.unsubscribe(id));
        assert!(hub.is_empty());
    }
}
