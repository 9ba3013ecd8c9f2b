//! Per-tab split layouts.
//!
//! Each tab owns a binary tree of panes, stored as a value tree keyed by the
//! tab root's terminal id. That dual role of the key is deliberate: a tab's
//! layout is found through the same id the sidebar node carries. Closing the
//! tab root while siblings remain re-keys the entry under a surviving leaf.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const RATIO_MIN: f64 = 0.1;
pub const RATIO_MAX: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitDirection {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayoutNode {
    #[serde(rename_all = "camelCase")]
    Leaf {
        node_id: String,
        terminal_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Split {
        node_id: String,
        direction: SplitDirection,
        ratio: f64,
        first: Box<LayoutNode>,
        second: Box<LayoutNode>,
    },
}

impl LayoutNode {
    fn leaf(terminal_id: &str) -> Self {
        LayoutNode::Leaf {
            node_id: Uuid::new_v4().to_string(),
            terminal_id: terminal_id.to_string(),
        }
    }

    /// In-order (left-to-right) terminal ids of all leaves.
    pub fn terminal_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_terminal_ids(&mut ids);
        ids
    }

    fn collect_terminal_ids(&self, out: &mut Vec<String>) {
        match self {
            LayoutNode::Leaf { terminal_id, .. } => out.push(terminal_id.clone()),
            LayoutNode::Split { first, second, .. } => {
                first.collect_terminal_ids(out);
                second.collect_terminal_ids(out);
            }
        }
    }

    pub fn contains_terminal(&self, terminal_id: &str) -> bool {
        match self {
            LayoutNode::Leaf { terminal_id: t, .. } => t == terminal_id,
            LayoutNode::Split { first, second, .. } => {
                first.contains_terminal(terminal_id) || second.contains_terminal(terminal_id)
            }
        }
    }

    fn is_leaf_for(&self, terminal_id: &str) -> bool {
        matches!(self, LayoutNode::Leaf { terminal_id: t, .. } if t == terminal_id)
    }

    fn first_leaf(&self) -> &str {
        match self {
            LayoutNode::Leaf { terminal_id, .. } => terminal_id,
            LayoutNode::Split { first, .. } => first.first_leaf(),
        }
    }

    fn last_leaf(&self) -> &str {
        match self {
            LayoutNode::Leaf { terminal_id, .. } => terminal_id,
            LayoutNode::Split { second, .. } => second.last_leaf(),
        }
    }

    /// The nearest other leaf to `target`: its direct partner when the
    /// enclosing split has a leaf on the other side, otherwise the closest
    /// edge leaf of the opposite subtree.
    pub fn sibling_terminal_id(&self, target: &str) -> Option<String> {
        match self {
            LayoutNode::Leaf { .. } => None,
            LayoutNode::Split { first, second, .. } => {
                if first.is_leaf_for(target) {
                    Some(second.first_leaf().to_string())
                } else if second.is_leaf_for(target) {
                    Some(first.last_leaf().to_string())
                } else if first.contains_terminal(target) {
                    first.sibling_terminal_id(target)
                } else if second.contains_terminal(target) {
                    second.sibling_terminal_id(target)
                } else {
                    None
                }
            }
        }
    }

    /// Replaces the leaf holding `target` with a split of it and a new leaf
    /// for `new_terminal_id` (new pane second, even ratio).
    fn split_at(&mut self, target: &str, new_terminal_id: &str, direction: SplitDirection) -> bool {
        match self {
            LayoutNode::Leaf { terminal_id, .. } if terminal_id == target => {
                let old = std::mem::replace(self, LayoutNode::leaf("placeholder"));
                *self = LayoutNode::Split {
                    node_id: Uuid::new_v4().to_string(),
                    direction,
                    ratio: 0.5,
                    first: Box::new(old),
                    second: Box::new(LayoutNode::leaf(new_terminal_id)),
                };
                true
            }
            LayoutNode::Leaf { .. } => false,
            LayoutNode::Split { first, second, .. } => {
                first.split_at(target, new_terminal_id, direction)
                    || second.split_at(target, new_terminal_id, direction)
            }
        }
    }

    /// Removes the leaf holding `target`. Returns the replacement subtree, or
    /// `None` when the node itself was the removed leaf. A split losing one
    /// side collapses into the survivor.
    fn remove_leaf(self, target: &str) -> Option<LayoutNode> {
        match self {
            LayoutNode::Leaf { ref terminal_id, .. } if terminal_id == target => None,
            leaf @ LayoutNode::Leaf { .. } => Some(leaf),
            LayoutNode::Split {
                node_id,
                direction,
                ratio,
                first,
                second,
            } => {
                if first.contains_terminal(target) {
                    match first.remove_leaf(target) {
                        None => Some(*second),
                        Some(kept) => Some(LayoutNode::Split {
                            node_id,
                            direction,
                            ratio,
                            first: Box::new(kept),
                            second,
                        }),
                    }
                } else if second.contains_terminal(target) {
                    match second.remove_leaf(target) {
                        None => Some(*first),
                        Some(kept) => Some(LayoutNode::Split {
                            node_id,
                            direction,
                            ratio,
                            first,
                            second: Box::new(kept),
                        }),
                    }
                } else {
                    Some(LayoutNode::Split {
                        node_id,
                        direction,
                        ratio,
                        first,
                        second,
                    })
                }
            }
        }
    }

    fn set_ratio(&mut self, split_node_id: &str, new_ratio: f64) -> bool {
        match self {
            LayoutNode::Leaf { .. } => false,
            LayoutNode::Split {
                node_id,
                ratio,
                first,
                second,
                ..
            } => {
                if node_id == split_node_id {
                    *ratio = new_ratio;
                    true
                } else {
                    first.set_ratio(split_node_id, new_ratio)
                        || second.set_ratio(split_node_id, new_ratio)
                }
            }
        }
    }
}

/// All tab layouts, keyed by tab root terminal id.
#[derive(Default)]
pub struct LayoutStore {
    layouts: HashMap<String, LayoutNode>,
}

impl LayoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a single-leaf layout. Key and sole leaf are the same terminal
    /// id for a fresh tab.
    pub fn init_layout(&mut self, key: &str, terminal_id: &str) -> bool {
        if self.layouts.contains_key(key) {
            return false;
        }
        self.layouts
            .insert(key.to_string(), LayoutNode::leaf(terminal_id));
        true
    }

    /// Splits the pane holding `target_terminal_id`. A missing key or absent
    /// target is a no-op.
    pub fn split_terminal(
        &mut self,
        key: &str,
        target_terminal_id: &str,
        new_terminal_id: &str,
        direction: SplitDirection,
    ) -> bool {
        match self.layouts.get_mut(key) {
            Some(root) => root.split_at(target_terminal_id, new_terminal_id, direction),
            None => false,
        }
    }

    /// Removes a pane, collapsing its parent split. Removing the last leaf
    /// deletes the layout entry entirely — no layout tree is ever empty.
    pub fn remove_terminal(&mut self, key: &str, terminal_id: &str) -> bool {
        let Some(root) = self.layouts.remove(key) else {
            return false;
        };
        if !root.contains_terminal(terminal_id) {
            self.layouts.insert(key.to_string(), root);
            return false;
        }
        if let Some(remaining) = root.remove_leaf(terminal_id) {
            self.layouts.insert(key.to_string(), remaining);
        }
        true
    }

    /// Sets a split's ratio, clamped to [0.1, 0.9].
    pub fn set_ratio(&mut self, key: &str, split_node_id: &str, ratio: f64) -> bool {
        let ratio = ratio.clamp(RATIO_MIN, RATIO_MAX);
        match self.layouts.get_mut(key) {
            Some(root) => root.set_ratio(split_node_id, ratio),
            None => false,
        }
    }

    pub fn remove_layout(&mut self, key: &str) -> Option<LayoutNode> {
        self.layouts.remove(key)
    }

    /// Moves a layout to a new key (tab-root close with surviving siblings).
    pub fn rekey(&mut self, old_key: &str, new_key: &str) -> bool {
        if self.layouts.contains_key(new_key) {
            return false;
        }
        match self.layouts.remove(old_key) {
            Some(root) => {
                self.layouts.insert(new_key.to_string(), root);
                true
            }
            None => false,
        }
    }

    /// Returns `terminal_id` itself when it is a layout key, else the key of
    /// the first layout whose tree contains it.
    pub fn find_layout_key_for_terminal(&self, terminal_id: &str) -> Option<String> {
        if self.layouts.contains_key(terminal_id) {
            return Some(terminal_id.to_string());
        }
        self.layouts
            .iter()
            .find(|(_, root)| root.contains_terminal(terminal_id))
            .map(|(key, _)| key.clone())
    }

    pub fn get(&self, key: &str) -> Option<&LayoutNode> {
        self.layouts.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.layouts.contains_key(key)
    }

    pub fn layouts(&self) -> &HashMap<String, LayoutNode> {
        &self.layouts
    }

    pub fn restore(&mut self, layouts: HashMap<String, LayoutNode>) {
        self.layouts = layouts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_tab(key: &str) -> LayoutStore {
        let mut store = LayoutStore::new();
        store.init_layout(key, key);
        store
    }

    #[test]
    fn test_init_layout_key_and_leaf_match() {
        let store = store_with_tab("t1");
        assert_eq!(store.get("t1").unwrap().terminal_ids(), ["t1"]);
    }

    #[test]
    fn test_split_adds_new_leaf_after_target() {
        let mut store = store_with_tab("t1");
        assert!(store.split_terminal("t1", "t1", "s1", SplitDirection::Horizontal));
        assert_eq!(store.get("t1").unwrap().terminal_ids(), ["t1", "s1"]);

        assert!(store.split_terminal("t1", "t1", "s2", SplitDirection::Vertical));
        assert_eq!(store.get("t1").unwrap().terminal_ids(), ["t1", "s2", "s1"]);
    }

    #[test]
    fn test_split_on_missing_key_is_noop() {
        let mut store = LayoutStore::new();
        assert!(!store.split_terminal("ghost", "t1", "s1", SplitDirection::Horizontal));
        assert!(store.layouts().is_empty());
    }

    #[test]
    fn test_split_then_remove_restores_original_tree() {
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        let before = store.get("t1").unwrap().clone();

        store.split_terminal("t1", "a", "b", SplitDirection::Vertical);
        assert!(store.remove_terminal("t1", "b"));
        assert_eq!(store.get("t1").unwrap(), &before);
    }

    #[test]
    fn test_remove_last_leaf_deletes_entry() {
        let mut store = store_with_tab("t1");
        assert!(store.remove_terminal("t1", "t1"));
        assert!(!store.contains_key("t1"));
    }

    #[test]
    fn test_remove_collapses_split_into_survivor() {
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        assert!(store.remove_terminal("t1", "t1"));
        let root = store.get("t1").unwrap();
        assert_eq!(root.terminal_ids(), ["a"]);
        assert!(matches!(root, LayoutNode::Leaf { .. }));
    }

    #[test]
    fn test_remove_unknown_terminal_is_noop() {
        let mut store = store_with_tab("t1");
        assert!(!store.remove_terminal("t1", "ghost"));
        assert!(store.contains_key("t1"));
    }

    #[test]
    fn test_set_ratio_clamps() {
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        let split_id = match store.get("t1").unwrap() {
            LayoutNode::Split { node_id, .. } => node_id.clone(),
            _ => panic!("expected split"),
        };

        assert!(store.set_ratio("t1", &split_id, 0.95));
        match store.get("t1").unwrap() {
            LayoutNode::Split { ratio, .. } => assert_eq!(*ratio, RATIO_MAX),
            _ => unreachable!(),
        }
        assert!(store.set_ratio("t1", &split_id, 0.01));
        match store.get("t1").unwrap() {
            LayoutNode::Split { ratio, .. } => assert_eq!(*ratio, RATIO_MIN),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sibling_of_direct_leaves() {
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        let root = store.get("t1").unwrap();
        assert_eq!(root.sibling_terminal_id("t1"), Some("a".to_string()));
        assert_eq!(root.sibling_terminal_id("a"), Some("t1".to_string()));
    }

    #[test]
    fn test_sibling_in_nested_tree() {
        // t1 split with a, then a split with b: tree is (t1 | (a | b)).
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        store.split_terminal("t1", "a", "b", SplitDirection::Vertical);
        let root = store.get("t1").unwrap();

        // t1 is first's leaf: first leaf of the second subtree.
        assert_eq!(root.sibling_terminal_id("t1"), Some("a".to_string()));
        // a and b are direct partners inside the nested split.
        assert_eq!(root.sibling_terminal_id("a"), Some("b".to_string()));
        assert_eq!(root.sibling_terminal_id("b"), Some("a".to_string()));
        assert_eq!(root.sibling_terminal_id("ghost"), None);
    }

    #[test]
    fn test_find_layout_key_for_terminal() {
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        store.init_layout("t2", "t2");

        assert_eq!(store.find_layout_key_for_terminal("t1"), Some("t1".into()));
        assert_eq!(store.find_layout_key_for_terminal("a"), Some("t1".into()));
        assert_eq!(store.find_layout_key_for_terminal("t2"), Some("t2".into()));
        assert_eq!(store.find_layout_key_for_terminal("ghost"), None);
    }

    #[test]
    fn test_rekey_moves_tree() {
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        store.remove_terminal("t1", "t1");

        assert!(store.rekey("t1", "a"));
        assert!(!store.contains_key("t1"));
        assert_eq!(store.get("a").unwrap().terminal_ids(), ["a"]);
    }

    #[test]
    fn test_terminal_id_appears_once_after_split() {
        let mut store = store_with_tab("t1");
        store.split_terminal("t1", "t1", "a", SplitDirection::Horizontal);
        store.split_terminal("t1", "a", "b", SplitDirection::Horizontal);
        let ids = store.get("t1").unwrap().terminal_ids();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids.len(), sorted.len());
    }
}
