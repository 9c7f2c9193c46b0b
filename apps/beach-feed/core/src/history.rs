use serde::{Deserialize, Serialize};

use crate::action::ActionQuery;

/// Pagination knobs for the feed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedPolicy {
    /// Ids fetched for a user's first open (K0).
    pub initial_batch: usize,
    /// Ids fetched whenever the unseen tail runs low (R).
    pub replenish_batch: usize,
    /// Maximum items per pushed window (W).
    pub window: usize,
    /// Replenish once this many or fewer unseen items remain (T).
    pub replenish_threshold: usize,
    /// Buffer length above which already-seen ids are dropped.
    pub max_history: usize,
    /// Seen ids kept behind the cursor when compacting.
    pub undo_depth: usize,
}

impl Default for FeedPolicy {
    fn default() -> Self {
        Self {
            initial_batch: 10,
            replenish_batch: 4,
            window: 3,
            replenish_threshold: 2,
            max_history: 500,
            undo_depth: 20,
        }
    }
}

/// Per-user buffer of fetched product ids and the index of the next unseen one.
///
/// `cursor` never exceeds `products.len()`; every mutator clamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub user_id: String,
    pub products: Vec<String>,
    pub cursor: usize,
    /// Scope the buffer was fetched under; replenishment reuses it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<ActionQuery>,
}

impl History {
    pub fn new(user_id: impl Into<String>, products: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            products,
            cursor: 0,
            query: None,
        }
    }

    pub fn scoped(mut self, query: Option<ActionQuery>) -> Self {
        self.query = query;
        self
    }

    /// Clamps a cursor loaded from an external store that no longer fits.
    pub fn normalize(mut self) -> Self {
        self.cursor = self.cursor.min(self.products.len());
        self
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Unseen items from the cursor onwards.
    pub fn remaining(&self) -> usize {
        self.products.len() - self.cursor
    }

    pub fn current(&self) -> Option<&str> {
        self.products.get(self.cursor).map(String::as_str)
    }

    /// Moves past the current item. Returns false when already at the end.
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.products.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// Steps back one item. Returns false when already at the start.
    pub fn retreat(&mut self) -> bool {
        if self.cursor > 0 {
            self.cursor -= 1;
            true
        } else {
            false
        }
    }

    pub fn needs_replenish(&self, threshold: usize) -> bool {
        self.remaining() <= threshold
    }

    pub fn extend<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.products.extend(ids);
    }

    /// Up to `width` ids starting at the cursor.
    pub fn window(&self, width: usize) -> &[String] {
        let end = self.cursor.saturating_add(width).min(self.products.len());
        &self.products[self.cursor..end]
    }

    /// Drops the oldest seen ids once the buffer grows past `max_len`, keeping
    /// at least `undo_depth` of them behind the cursor. Returns how many ids
    /// were dropped.
    pub fn compact(&mut self, max_len: usize, undo_depth: usize) -> usize {
        if self.products.len() <= max_len {
            return 0;
        }
        let excess = self.products.len() - max_len;
        let droppable = self.cursor.saturating_sub(undo_depth);
        let drop = excess.min(droppable);
        if drop > 0 {
            self.products.drain(..drop);
            self.cursor -= drop;
        }
        drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test_timeout::timeout]
    fn window_is_capped_by_tail() {
        let mut history = History::new("u1", ids(&["p1", "p2", "p3", "p4"]));
        assert_eq!(history.window(3), ids(&["p1", "p2", "p3"]).as_slice());
        history.advance();
        history.advance();
        assert_eq!(history.window(3), ids(&["p3", "p4"]).as_slice());
        history.advance();
        history.advance();
        assert!(history.window(3).is_empty());
        assert!(!history.advance());
        assert_eq!(history.cursor, 4);
    }

    #[test_timeout::timeout]
    fn retreat_clamps_at_zero() {
        let mut history = History::new("u1", ids(&["p1"]));
        assert!(!history.retreat());
        assert_eq!(history.cursor, 0);
    }

    #[test_timeout::timeout]
    fn replenish_threshold_counts_unseen_items() {
        let mut history = History::new("u1", ids(&["p1", "p2", "p3", "p4"]));
        assert!(!history.needs_replenish(2));
        history.advance();
        assert!(!history.needs_replenish(2));
        history.advance();
        assert!(history.needs_replenish(2));
    }

    #[test_timeout::timeout]
    fn normalize_clamps_stale_cursor() {
        let history = History {
            user_id: "u1".into(),
            products: ids(&["p1", "p2"]),
            cursor: 9,
            query: None,
        }
        .normalize();
        assert_eq!(history.cursor, 2);
    }

    #[test_timeout::timeout]
    fn compact_keeps_undo_depth() {
        let products = (0..10).map(|i| format!("p{i}")).collect();
        let mut history = History::new("u1", products);
        history.cursor = 8;

        let dropped = history.compact(6, 3);
        assert_eq!(dropped, 4);
        assert_eq!(history.len(), 6);
        assert_eq!(history.cursor, 4);
        assert_eq!(history.current(), Some("p8"));
    }

    #[test_timeout::timeout]
    fn compact_never_drops_unseen_items() {
        let products = (0..10).map(|i| format!("p{i}")).collect();
        let mut history = History::new("u1", products);
        history.cursor = 1;

        assert_eq!(history.compact(4, 0), 1);
        assert_eq!(history.cursor, 0);
        assert_eq!(history.current(), Some("p1"));
        assert_eq!(history.len(), 9);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Advance,
        Retreat,
        Extend(usize),
        Compact(usize, usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Advance),
            Just(Step::Retreat),
            (0usize..5).prop_map(Step::Extend),
            (0usize..12, 0usize..4).prop_map(|(max, depth)| Step::Compact(max, depth)),
        ]
    }

    proptest! {
        #[test]
        fn cursor_stays_within_buffer(initial in 0usize..6, steps in prop::collection::vec(step(), 0..64)) {
            let mut history = History::new("u1", (0..initial).map(|i| format!("p{i}")).collect());
            let mut next = initial;
            for step in steps {
                match step {
                    Step::Advance => { history.advance(); }
                    Step::Retreat => { history.retreat(); }
                    Step::Extend(count) => {
                        history.extend((next..next + count).map(|i| format!("p{i}")));
                        next += count;
                    }
                    Step::Compact(max, depth) => { history.compact(max, depth); }
                }
                prop_assert!(history.cursor <= history.len());
                prop_assert!(history.window(3).len() <= 3);
            }
        }

        #[test]
        fn undo_then_advance_restores_window(len in 1usize..10, start in 0usize..10) {
            let mut history = History::new("u1", (0..len).map(|i| format!("p{i}")).collect());
            history.cursor = start.min(len - 1);
            history.advance();
            let before = history.window(3).to_vec();
            history.retreat();
            history.advance();
            prop_assert_eq!(history.window(3).to_vec(), before);
        }
    }
}
