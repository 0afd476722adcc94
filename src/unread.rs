// src/unread.rs

use std::collections::{BTreeSet, HashMap};

/// Per-user unread notification counts.
///
/// The count is derived from the set of unread notification ids, so marking
/// the same notification read twice, or raising it twice, cannot skew it.
#[derive(Debug, Default)]
pub struct UnreadCounters {
    unread: HashMap<String, BTreeSet<String>>,
}

/// Result of a counter operation: the new count and whether it moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountUpdate {
    pub count: usize,
    pub changed: bool,
}

impl UnreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, user_id: &str) -> usize {
        self.unread.get(user_id).map_or(0, BTreeSet::len)
    }

    pub fn increment(&mut self, user_id: &str, notification_id: &str) -> CountUpdate {
        let set = self.unread.entry(user_id.to_string()).or_default();
        let changed = set.insert(notification_id.to_string());
        CountUpdate {
            count: set.len(),
            changed,
        }
    }

    /// Replaces the user's unread set with the source of truth.
    pub fn recompute<I>(&mut self, user_id: &str, unread_ids: I) -> CountUpdate
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.count(user_id);
        let set: BTreeSet<String> = unread_ids.into_iter().collect();
        let count = set.len();
        if set.is_empty() {
            self.unread.remove(user_id);
        } else {
            self.unread.insert(user_id.to_string(), set);
        }
        CountUpdate {
            count,
            changed: count != before,
        }
    }

    pub fn mark_read(&mut self, user_id: &str, notification_id: &str) -> CountUpdate {
        let changed = match self.unread.get_mut(user_id) {
            Some(set) => {
                let removed = set.remove(notification_id);
                if set.is_empty() {
                    self.unread.remove(user_id);
                }
                removed
            }
            None => false,
        };
        CountUpdate {
            count: self.count(user_id),
            changed,
        }
    }

    pub fn mark_all_read(&mut self, user_id: &str) -> CountUpdate {
        let changed = self.unread.remove(user_id).map_or(false, |set| !set.is_empty());
        CountUpdate { count: 0, changed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_is_per_notification() {
        let mut counters = UnreadCounters::new();
        assert_eq!(counters.increment("u1", "n1"), CountUpdate { count: 1, changed: true });
        assert_eq!(counters.increment("u1", "n1"), CountUpdate { count: 1, changed: false });
        assert_eq!(counters.increment("u1", "n2").count, 2);
        assert_eq!(counters.count("u2"), 0);
    }

    #[test]
    fn test_mark_read_never_goes_negative() {
        let mut counters = UnreadCounters::new();
        counters.increment("u1", "n1");
        assert_eq!(counters.mark_read("u1", "n1"), CountUpdate { count: 0, changed: true });
        assert_eq!(counters.mark_read("u1", "n1"), CountUpdate { count: 0, changed: false });
        assert_eq!(counters.mark_read("nobody", "n9"), CountUpdate { count: 0, changed: false });
    }

    #[test]
    fn test_recompute_and_mark_all() {
        let mut counters = UnreadCounters::new();
        counters.increment("u1", "stale");
        let update = counters.recompute("u1", vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(update, CountUpdate { count: 3, changed: true });
        assert!(!counters.recompute("u1", vec!["x".into(), "y".into(), "z".into()]).changed);

        assert_eq!(counters.mark_all_read("u1"), CountUpdate { count: 0, changed: true });
        assert_eq!(counters.mark_all_read("u1"), CountUpdate { count: 0, changed: false });
    }
}
