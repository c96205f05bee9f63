//! R-tree of item rectangles for spatial indexes.

use crate::item::Item;
use crate::rect::Rect;
use std::sync::Arc;

/// Node fan-out before a split.
const MAX_ENTRIES: usize = 16;

/// An R-tree mapping axis-aligned rectangles to items.
///
/// Supports insert, remove by key, and intersection search. Nodes split
/// along the axis of greatest spread when they overflow; removal leaves
/// nodes underfull rather than rebalancing, which keeps deletes cheap
/// and is fine for the churn pattern of a secondary index.
pub(crate) struct SpatialTree {
    root: Option<Node>,
    len: usize,
}

struct LeafEntry {
    rect: Rect,
    item: Arc<Item>,
}

enum Node {
    Leaf {
        mbr: Rect,
        entries: Vec<LeafEntry>,
    },
    Branch {
        mbr: Rect,
        children: Vec<Node>,
    },
}

impl Node {
    fn mbr(&self) -> &Rect {
        match self {
            Node::Leaf { mbr, .. } => mbr,
            Node::Branch { mbr, .. } => mbr,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Node::Leaf { entries, .. } => entries.is_empty(),
            Node::Branch { children, .. } => children.is_empty(),
        }
    }
}

impl SpatialTree {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    pub fn insert(&mut self, rect: Rect, item: Arc<Item>) {
        let entry = LeafEntry { rect, item };
        self.root = Some(match self.root.take() {
            None => Node::Leaf {
                mbr: entry.rect.clone(),
                entries: vec![entry],
            },
            Some(node) => {
                let (node, split) = insert_into(node, entry);
                match split {
                    None => node,
                    Some(sibling) => Node::Branch {
                        mbr: node.mbr().union(sibling.mbr()),
                        children: vec![node, sibling],
                    },
                }
            }
        });
        self.len += 1;
    }

    /// Removes the entry for `key` whose rectangle matches `rect`.
    pub fn remove(&mut self, rect: &Rect, key: &[u8]) -> bool {
        let Some(root) = self.root.as_mut() else {
            return false;
        };
        let removed = remove_from(root, rect, key);
        if removed {
            self.len -= 1;
            if root.is_empty() {
                self.root = None;
            }
        }
        removed
    }

    /// Collects every item whose rectangle intersects `query`.
    ///
    /// Results come back in arbitrary order; callers re-check nothing.
    pub fn search(&self, query: &Rect, out: &mut Vec<Arc<Item>>) {
        if let Some(root) = &self.root {
            search_node(root, query, out);
        }
    }
}

fn insert_into(node: Node, entry: LeafEntry) -> (Node, Option<Node>) {
    match node {
        Node::Leaf { mbr, mut entries } => {
            let mbr = mbr.union(&entry.rect);
            entries.push(entry);
            if entries.len() > MAX_ENTRIES {
                let (a, b) = split_leaf(entries);
                (a, Some(b))
            } else {
                (Node::Leaf { mbr, entries }, None)
            }
        }
        Node::Branch { mut children, .. } => {
            let target = choose_child(&children, &entry.rect);
            let child = children.swap_remove(target);
            let (child, split) = insert_into(child, entry);
            children.push(child);
            if let Some(sibling) = split {
                children.push(sibling);
            }
            if children.len() > MAX_ENTRIES {
                let (a, b) = split_branch(children);
                (a, Some(b))
            } else {
                let mbr = mbr_of_children(&children);
                (Node::Branch { mbr, children }, None)
            }
        }
    }
}

/// Index of the child whose bounds grow least by absorbing `rect`.
fn choose_child(children: &[Node], rect: &Rect) -> usize {
    let mut best = 0;
    let mut best_cost = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for (i, child) in children.iter().enumerate() {
        let cost = child.mbr().enlargement(rect);
        let area = child.mbr().area();
        if cost < best_cost || (cost == best_cost && area < best_area) {
            best = i;
            best_cost = cost;
            best_area = area;
        }
    }
    best
}

/// Axis with the widest spread of entry centers, used as the split axis.
fn widest_axis(rects: &[&Rect]) -> usize {
    let dims = rects.iter().map(|r| r.min.len()).max().unwrap_or(0);
    let mut best = 0;
    let mut best_spread = f64::NEG_INFINITY;
    for axis in 0..dims {
        let centers = rects
            .iter()
            .filter_map(|r| Some((r.min.get(axis)? + r.max.get(axis)?) / 2.0));
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for c in centers {
            lo = lo.min(c);
            hi = hi.max(c);
        }
        if hi - lo > best_spread {
            best = axis;
            best_spread = hi - lo;
        }
    }
    best
}

fn center(rect: &Rect, axis: usize) -> f64 {
    match (rect.min.get(axis), rect.max.get(axis)) {
        (Some(lo), Some(hi)) => (lo + hi) / 2.0,
        _ => 0.0,
    }
}

fn split_leaf(mut entries: Vec<LeafEntry>) -> (Node, Node) {
    let axis = widest_axis(&entries.iter().map(|e| &e.rect).collect::<Vec<_>>());
    entries.sort_by(|a, b| center(&a.rect, axis).total_cmp(&center(&b.rect, axis)));
    let right = entries.split_off(entries.len() / 2);
    (
        Node::Leaf {
            mbr: mbr_of_entries(&entries),
            entries,
        },
        Node::Leaf {
            mbr: mbr_of_entries(&right),
            entries: right,
        },
    )
}

fn split_branch(mut children: Vec<Node>) -> (Node, Node) {
    let axis = widest_axis(&children.iter().map(|c| c.mbr()).collect::<Vec<_>>());
    children.sort_by(|a, b| center(a.mbr(), axis).total_cmp(&center(b.mbr(), axis)));
    let right = children.split_off(children.len() / 2);
    (
        Node::Branch {
            mbr: mbr_of_children(&children),
            children,
        },
        Node::Branch {
            mbr: mbr_of_children(&right),
            children: right,
        },
    )
}

fn mbr_of_entries(entries: &[LeafEntry]) -> Rect {
    entries
        .iter()
        .skip(1)
        .fold(entries[0].rect.clone(), |acc, e| acc.union(&e.rect))
}

fn mbr_of_children(children: &[Node]) -> Rect {
    children
        .iter()
        .skip(1)
        .fold(children[0].mbr().clone(), |acc, c| acc.union(c.mbr()))
}

fn remove_from(node: &mut Node, rect: &Rect, key: &[u8]) -> bool {
    match node {
        Node::Leaf { mbr, entries } => {
            if !mbr.intersects(rect) {
                return false;
            }
            let Some(pos) = entries.iter().position(|e| e.item.key == key) else {
                return false;
            };
            entries.remove(pos);
            if !entries.is_empty() {
                *mbr = mbr_of_entries(entries);
            }
            true
        }
        Node::Branch { mbr, children } => {
            for i in 0..children.len() {
                if !children[i].mbr().intersects(rect) {
                    continue;
                }
                if remove_from(&mut children[i], rect, key) {
                    if children[i].is_empty() {
                        children.swap_remove(i);
                    }
                    if !children.is_empty() {
                        *mbr = mbr_of_children(children);
                    }
                    return true;
                }
            }
            false
        }
    }
}

fn search_node(node: &Node, query: &Rect, out: &mut Vec<Arc<Item>>) {
    match node {
        Node::Leaf { mbr, entries } => {
            if !mbr.intersects(query) {
                return;
            }
            for entry in entries {
                if entry.rect.intersects(query) {
                    out.push(Arc::clone(&entry.item));
                }
            }
        }
        Node::Branch { mbr, children } => {
            if !mbr.intersects(query) {
                return;
            }
            for child in children {
                search_node(child, query, out);
            }
        }
    }
}

impl std::fmt::Debug for SpatialTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialTree").field("len", &self.len).finish()
    }
}
