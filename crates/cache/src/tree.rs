//! The in-memory mirror: a strict tree of tracked nodes.

use std::collections::BTreeMap;

use canopy_primitives::{ChildData, Stat};

/// Tracking state of one mirrored node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Watch armed or fetch in flight; data not trustworthy yet.
    Pending,
    /// Data and (where tracked) children reflect the last successful fetch.
    Live,
}

/// Local mirror of one remote path.
///
/// Parent-to-children is a strict tree: unique path per node, a child's path
/// is its parent's path plus the child name.
#[derive(Clone, Debug)]
pub struct TreeNode {
    pub path: String,
    pub data: Option<Vec<u8>>,
    pub stat: Stat,
    pub state: NodeState,
    pub children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    #[must_use]
    pub fn pending(path: String) -> Self {
        Self {
            path,
            data: None,
            stat: Stat::default(),
            state: NodeState::Pending,
            children: BTreeMap::new(),
        }
    }

    /// Immutable snapshot of this node (path, data, stat).
    #[must_use]
    pub fn snapshot(&self) -> ChildData {
        ChildData {
            path: self.path.clone(),
            data: self.data.clone(),
            stat: self.stat,
        }
    }

    /// Walk to the node at `path`, which must be `self.path` or below it.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&Self> {
        let rest = self.relative(path)?;
        let mut node = self;
        for segment in rest {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Self> {
        let rest = self.relative(path)?;
        let mut node = self;
        for segment in rest {
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    /// Detach and return the subtree rooted at `path` (not `self.path`).
    pub fn detach(&mut self, path: &str) -> Option<Self> {
        let rest: Vec<&str> = self.relative(path)?.collect();
        let (leaf, ancestors) = rest.split_last()?;
        let mut node = self;
        for segment in ancestors {
            node = node.children.get_mut(*segment)?;
        }
        node.children.remove(*leaf)
    }

    /// Every node of this subtree, deepest-first, self last.
    pub fn drain_post_order(mut self, out: &mut Vec<Self>) {
        for (_, child) in std::mem::take(&mut self.children) {
            child.drain_post_order(out);
        }
        out.push(self);
    }

    /// All tracked nodes below (not including) this one, keyed by path.
    #[must_use]
    pub fn flatten_descendants(&self) -> BTreeMap<String, ChildData> {
        let mut out = BTreeMap::new();
        self.collect_descendants(&mut out);
        out
    }

    fn collect_descendants(&self, out: &mut BTreeMap<String, ChildData>) {
        for child in self.children.values() {
            let _ = out.insert(child.path.clone(), child.snapshot());
            child.collect_descendants(out);
        }
    }

    /// Path segments of `path` relative to this node, or `None` when `path`
    /// is outside this subtree.
    fn relative<'a>(&self, path: &'a str) -> Option<impl Iterator<Item = &'a str>> {
        let rest = if path == self.path {
            ""
        } else if self.path == "/" {
            path.strip_prefix('/')?
        } else {
            path.strip_prefix(self.path.as_str())?.strip_prefix('/')?
        };
        Some(rest.split('/').filter(|segment| !segment.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TreeNode {
        let mut root = TreeNode::pending("/root".to_owned());
        let mut a = TreeNode::pending("/root/a".to_owned());
        let _ = a.children.insert(
            "x".to_owned(),
            TreeNode::pending("/root/a/x".to_owned()),
        );
        let _ = root.children.insert("a".to_owned(), a);
        let _ = root
            .children
            .insert("b".to_owned(), TreeNode::pending("/root/b".to_owned()));
        root
    }

    #[test]
    fn find_walks_nested_paths() {
        let root = sample();
        assert_eq!(root.find("/root").map(|n| n.path.as_str()), Some("/root"));
        assert_eq!(
            root.find("/root/a/x").map(|n| n.path.as_str()),
            Some("/root/a/x")
        );
        assert!(root.find("/root/missing").is_none());
        assert!(root.find("/elsewhere").is_none());
    }

    #[test]
    fn detach_removes_the_subtree() {
        let mut root = sample();
        let taken = root.detach("/root/a").unwrap();
        assert_eq!(taken.path, "/root/a");
        assert!(root.find("/root/a").is_none());
        assert!(root.find("/root/b").is_some());
    }

    #[test]
    fn post_order_puts_children_before_parents() {
        let mut root = sample();
        let taken = root.detach("/root/a").unwrap();
        let mut order = Vec::new();
        taken.drain_post_order(&mut order);
        let paths: Vec<&str> = order.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, ["/root/a/x", "/root/a"]);
    }
}
