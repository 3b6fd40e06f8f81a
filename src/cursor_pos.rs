//! Breadcrumb trail of a root-to-leaf traversal.
//!
//! A [`CursorPos`] is one frame of a bottom-up linked path: the head frame
//! points at the target leaf, each `parent` link climbs one level, and the
//! chain ends at the root. The path is only valid for the traversal that
//! built it; copy-on-write rebuilds read it back-to-front to splice fresh
//! pages into copied parents.

use std::sync::Arc;

use crate::page::Page;
use crate::store::StoreInner;

/// One frame of a traversal path.
pub struct CursorPos<K, V> {
    /// The page at this level.
    pub page: Arc<Page<K, V>>,
    /// For internal frames, the child index used to go down one level. For
    /// the leaf frame, the binary-search result for the target key, which
    /// is negative when the key is not present.
    pub index: isize,
    /// Frame of the parent level, or `None` at the root.
    pub parent: Option<Box<CursorPos<K, V>>>,
}

impl<K, V> CursorPos<K, V> {
    /// Borrow the parent frame.
    #[inline]
    #[must_use]
    pub fn parent_ref(&self) -> Option<&CursorPos<K, V>> {
        self.parent.as_deref()
    }

    /// Search for `key` below `root` and build the breadcrumb trail.
    ///
    /// The returned frame sits at the insertion point for the key inside
    /// the target leaf; following `parent` links walks back to the root.
    pub fn traverse_down(root: &Arc<Page<K, V>>, key: &K) -> CursorPos<K, V> {
        let mut parent: Option<Box<CursorPos<K, V>>> = None;
        let mut page = Arc::clone(root);
        while !page.is_leaf() {
            let mut index = page.binary_search(key) + 1;
            if index < 0 {
                index = -index;
            }
            parent = Some(Box::new(CursorPos {
                page: Arc::clone(&page),
                index,
                parent,
            }));
            let child = Arc::clone(page.child_page(index as usize));
            page = child;
        }
        let index = page.binary_search(key);
        CursorPos {
            page,
            index,
            parent,
        }
    }

    /// Build a path to the rightmost leaf, with the leaf frame's index at
    /// the insertion point one past the last key.
    pub(crate) fn append_path(root: &Arc<Page<K, V>>) -> CursorPos<K, V> {
        let mut parent: Option<Box<CursorPos<K, V>>> = None;
        let mut page = Arc::clone(root);
        while !page.is_leaf() {
            let last = page.key_count();
            parent = Some(Box::new(CursorPos {
                page: Arc::clone(&page),
                index: last as isize,
                parent,
            }));
            let child = Arc::clone(page.child_page(last));
            page = child;
        }
        let index = -(page.key_count() as isize) - 1;
        CursorPos {
            page,
            index,
            parent,
        }
    }

    /// Account for every page on this path being replaced: queue saved
    /// pages for release at `version`, refund the memory of unsaved ones.
    /// Returns the unsaved-memory delta for the store.
    pub(crate) fn process_removal_info(
        &self,
        version: i64,
        store: &StoreInner,
        persistent: bool,
    ) -> i64 {
        let mut unsaved_memory = 0;
        let mut head = Some(self);
        while let Some(frame) = head {
            unsaved_memory += frame.page.remove_page(version, store, persistent);
            head = frame.parent_ref();
        }
        unsaved_memory
    }
}
