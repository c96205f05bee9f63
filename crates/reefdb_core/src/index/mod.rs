//! Secondary indexes: named membership rules plus an ordering.
//!
//! An index owns either a value-ordered tree (B-tree index) or a spatial
//! tree (R-tree index), populated with the items whose keys match its
//! pattern. Indexes are rebuilt from the keys tree on creation and do
//! not survive database close.

pub mod ordering;

mod btree;
mod spatial;

pub(crate) use btree::OrderedTree;
pub(crate) use spatial::SpatialTree;

use crate::item::Item;
use crate::pattern;
use crate::rect::RectFn;
use self::ordering::LessFn;
use std::sync::Arc;

/// Per-index creation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOptions {
    /// Match keys against the pattern ignoring ASCII case.
    pub case_insensitive_key_matching: bool,
}

/// A named secondary index over items whose keys match a pattern.
pub(crate) struct Index {
    pub name: String,
    pattern: Vec<u8>,
    case_insensitive: bool,
    /// Value-ordered container; present for B-tree indexes.
    pub tree: Option<OrderedTree>,
    /// Spatial container; present for R-tree indexes.
    pub spatial: Option<SpatialTree>,
    /// Rectangle extractor for spatial indexes; also parses query rects.
    pub rect_of: Option<RectFn>,
}

impl Index {
    /// Creates a B-tree index. `less` is `None` for an index with no
    /// ordering function, which orders by key alone.
    pub fn btree(name: &str, pattern: &[u8], opts: IndexOptions, less: Option<LessFn>) -> Self {
        Self {
            name: name.to_owned(),
            pattern: Self::stored_pattern(pattern, opts),
            case_insensitive: opts.case_insensitive_key_matching,
            tree: Some(OrderedTree::new(less)),
            spatial: None,
            rect_of: None,
        }
    }

    /// Creates an R-tree index with the given rectangle extractor.
    pub fn spatial(name: &str, pattern: &[u8], opts: IndexOptions, rect_of: RectFn) -> Self {
        Self {
            name: name.to_owned(),
            pattern: Self::stored_pattern(pattern, opts),
            case_insensitive: opts.case_insensitive_key_matching,
            tree: None,
            spatial: Some(SpatialTree::new()),
            rect_of: Some(rect_of),
        }
    }

    fn stored_pattern(pattern: &[u8], opts: IndexOptions) -> Vec<u8> {
        let mut stored = pattern.to_vec();
        if opts.case_insensitive_key_matching {
            pattern::fold_ascii(&mut stored);
        }
        stored
    }

    /// Whether a key belongs in this index.
    pub fn matches(&self, key: &[u8]) -> bool {
        pattern::matches_fold(key, &self.pattern, self.case_insensitive)
    }

    /// Adds an item to the index's container. The caller has already
    /// checked pattern membership.
    pub fn insert(&mut self, item: &Arc<Item>) {
        if let Some(tree) = &mut self.tree {
            tree.insert(Arc::clone(item));
        }
        if let Some(spatial) = &mut self.spatial {
            if let Some(rect) = self.rect_of.as_ref().and_then(|f| f(&item.value)) {
                spatial.insert(rect, Arc::clone(item));
            }
        }
    }

    /// Removes an item from the index's container. Safe to call for
    /// items the index never held.
    pub fn remove(&mut self, item: &Arc<Item>) {
        if let Some(tree) = &mut self.tree {
            tree.remove(item);
        }
        if let Some(spatial) = &mut self.spatial {
            if let Some(rect) = self.rect_of.as_ref().and_then(|f| f(&item.value)) {
                spatial.remove(&rect, &item.key);
            }
        }
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("pattern", &String::from_utf8_lossy(&self.pattern))
            .field("spatial", &self.spatial.is_some())
            .finish_non_exhaustive()
    }
}
