//! Comment thread reconstruction from materialized paths.
//!
//! Backends return comments as a flat list where each comment carries its
//! ancestry as a dot-separated path rooted at `0` (`0.12.34` is comment 34,
//! a reply to 12). [`build_comment_tree`] turns that list into a nested map
//! with a stable sibling order.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::warn;

use crate::Comment;

/// Numeric comment id, as found in path segments.
pub type CommentId = u64;

/// Anything that can be placed in a thread.
pub trait ThreadComment {
    /// Materialized ancestor path, e.g. `0.12.34`.
    fn path(&self) -> &str;

    /// Total descendant count reported by the backend.
    fn child_count(&self) -> u32;
}

impl ThreadComment for Comment {
    fn path(&self) -> &str {
        &self.path
    }

    fn child_count(&self) -> u32 {
        self.child_count
    }
}

/// One position in the thread.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentTreeNode<C> {
    /// `None` for an ancestor implied by a descendant's path but absent
    /// from the input.
    pub comment: Option<C>,
    /// Position at which the comment was first observed in the input.
    pub sort: u32,
    /// Direct replies: descendants minus grandchildren.
    pub immediate_children: u32,
    pub children: BTreeMap<CommentId, CommentTreeNode<C>>,
}

impl<C> CommentTreeNode<C> {
    fn placeholder() -> Self {
        Self {
            comment: None,
            sort: 0,
            immediate_children: 0,
            children: BTreeMap::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.comment.is_none()
    }

    /// Children in render order.
    pub fn ordered_children(&self) -> Vec<(CommentId, &CommentTreeNode<C>)> {
        ordered(&self.children)
    }
}

/// A reconstructed thread, keyed by top-level comment id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentTree<C> {
    pub roots: BTreeMap<CommentId, CommentTreeNode<C>>,
}

impl<C> Default for CommentTree<C> {
    fn default() -> Self {
        Self {
            roots: BTreeMap::new(),
        }
    }
}

impl<C> CommentTree<C> {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Top-level nodes in render order.
    pub fn ordered_roots(&self) -> Vec<(CommentId, &CommentTreeNode<C>)> {
        ordered(&self.roots)
    }

    /// Look a node up by id chain, e.g. `[12, 34]`.
    pub fn find(&self, ids: &[CommentId]) -> Option<&CommentTreeNode<C>> {
        let (first, rest) = ids.split_first()?;
        let mut node = self.roots.get(first)?;
        for id in rest {
            node = node.children.get(id)?;
        }
        Some(node)
    }

    /// Every node with its depth (top level is 0), in render order.
    pub fn walk_depth_first(&self) -> Vec<(usize, &CommentTreeNode<C>)> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, &CommentTreeNode<C>)> = self
            .ordered_roots()
            .into_iter()
            .rev()
            .map(|(_, node)| (0, node))
            .collect();

        while let Some((depth, node)) = stack.pop() {
            out.push((depth, node));
            for (_, child) in node.ordered_children().into_iter().rev() {
                stack.push((depth + 1, child));
            }
        }
        out
    }
}

fn ordered<C>(nodes: &BTreeMap<CommentId, CommentTreeNode<C>>) -> Vec<(CommentId, &CommentTreeNode<C>)> {
    let mut entries: Vec<_> = nodes.iter().map(|(id, node)| (*id, node)).collect();
    entries.sort_by_key(|(id, node)| (node.sort, *id));
    entries
}

/// Build a nested thread from a flat comment list.
///
/// - `focus_path`: only keep the subtree at this path (e.g. `"12.34"`);
///   ancestors above it remain as placeholders.
/// - `max_depth`: drop comments whose path has more segments than this.
pub fn build_comment_tree<C>(comments: &[C], focus_path: Option<&str>, max_depth: usize) -> CommentTree<C>
where
    C: ThreadComment + Clone,
{
    let focus: Option<Vec<&str>> = focus_path
        .filter(|f| !f.is_empty())
        .map(|f| f.split('.').collect());

    let mut tree = CommentTree::default();
    let mut next_sort = 0u32;

    for comment in comments {
        let full: Vec<&str> = comment.path().split('.').collect();
        let segments = match &focus {
            Some(focus) => match rebase_on_focus(&full, focus) {
                Some(segments) => segments,
                None => continue,
            },
            None => full,
        };

        if segments.len() > max_depth {
            continue;
        }

        let ids = match parse_ids(&segments) {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => continue,
            Err(segment) => {
                warn!(path = comment.path(), segment, "skipping comment with malformed path");
                continue;
            }
        };

        attach(&mut tree.roots, &ids, comment.clone(), &mut next_sort);
    }

    fill_immediate_children(&mut tree.roots);
    tree
}

/// Cut everything before the first occurrence of the focus root, keeping
/// the path only if it is the focus path or lies below it.
fn rebase_on_focus<'a>(full: &[&'a str], focus: &[&str]) -> Option<Vec<&'a str>> {
    let root = focus.first()?;
    let start = full.iter().position(|segment| segment == root)?;
    let rebased = &full[start..];

    if rebased.len() >= focus.len() && rebased[..focus.len()] == *focus {
        Some(rebased.to_vec())
    } else {
        None
    }
}

/// Parse path segments into ids, dropping the synthetic `0` root.
fn parse_ids<'a>(segments: &[&'a str]) -> Result<Vec<CommentId>, &'a str> {
    let body = match segments.split_first() {
        Some((&"0", rest)) => rest,
        _ => segments,
    };
    body.iter()
        .map(|segment| segment.parse::<CommentId>().map_err(|_| *segment))
        .collect()
}

fn attach<C>(
    roots: &mut BTreeMap<CommentId, CommentTreeNode<C>>,
    ids: &[CommentId],
    comment: C,
    next_sort: &mut u32,
) {
    let Some((last, ancestors)) = ids.split_last() else {
        return;
    };

    let mut level = roots;
    for id in ancestors {
        level = &mut level
            .entry(*id)
            .or_insert_with(CommentTreeNode::placeholder)
            .children;
    }

    match level.entry(*last) {
        Entry::Occupied(entry) => {
            let node = entry.into_mut();
            // A duplicate keeps the earlier sort; a placeholder gets its first one.
            if node.comment.is_none() {
                node.sort = *next_sort;
                *next_sort += 1;
            }
            node.comment = Some(comment);
        }
        Entry::Vacant(entry) => {
            entry.insert(CommentTreeNode {
                comment: Some(comment),
                sort: *next_sort,
                immediate_children: 0,
                children: BTreeMap::new(),
            });
            *next_sort += 1;
        }
    }
}

fn fill_immediate_children<C: ThreadComment>(nodes: &mut BTreeMap<CommentId, CommentTreeNode<C>>) {
    for node in nodes.values_mut() {
        fill_immediate_children(&mut node.children);

        if let Some(comment) = &node.comment {
            let grandchildren: u64 = node
                .children
                .values()
                .filter_map(|child| child.comment.as_ref())
                .map(|child| u64::from(child.child_count()))
                .sum();
            let immediate = u64::from(comment.child_count()).saturating_sub(grandchildren);
            node.immediate_children = u32::try_from(immediate).unwrap_or(u32::MAX);
        }
    }
}
