//! Immutable B+tree nodes.
//!
//! A [`Page`] is either a leaf holding parallel key/value arrays, or an
//! internal node holding keys plus child references with cached subtree
//! counts. Pages are built privately, mutated only while still owned by a
//! single writer, and frozen the moment they are linked into a published
//! root reference. Copy-on-write mutations copy the affected page and
//! patch the fresh copy.
//!
//! Once a store with a page table saves a page, its position is published
//! through an atomic; position `0` means "not saved yet".

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use crate::ordering::{POS_READ, POS_WRITE, STAT};
use crate::store::StoreInner;
use crate::types::{KeyType, ValueType, MEMORY_POINTER};

/// Base heap cost of a page before keys and payload.
pub(crate) const PAGE_MEMORY: i64 = 128;

/// Added cost per child reference of an internal page.
pub(crate) const PAGE_MEMORY_CHILD: i64 = (MEMORY_POINTER + 16) as i64;

// ============================================================================
//  PageRef
// ============================================================================

/// Reference from an internal page to one child subtree.
///
/// Children stay resident for the lifetime of the tree (this store never
/// evicts pages), so the reference also caches the subtree's entry count
/// for ranked access.
pub(crate) struct PageRef<K, V> {
    pub(crate) page: Arc<Page<K, V>>,
    pub(crate) count: u64,
}

impl<K, V> PageRef<K, V> {
    pub(crate) fn new(page: Arc<Page<K, V>>) -> Self {
        let count = page.total_count();
        Self { page, count }
    }
}

impl<K, V> Clone for PageRef<K, V> {
    fn clone(&self) -> Self {
        Self {
            page: Arc::clone(&self.page),
            count: self.count,
        }
    }
}

// ============================================================================
//  Page
// ============================================================================

enum Content<K, V> {
    Leaf {
        values: Vec<V>,
    },
    Node {
        children: Vec<PageRef<K, V>>,
        total_count: u64,
    },
}

/// One node of the copy-on-write B+tree.
pub struct Page<K, V> {
    keys: Vec<K>,
    content: Content<K, V>,
    /// Store position; 0 while the page has not been saved.
    pos: AtomicU64,
    /// Incrementally maintained heap estimate, in bytes.
    memory: i64,
    /// Starting guess for the next binary search on this page.
    cached_compare: AtomicUsize,
    key_type: Arc<dyn KeyType<K>>,
    value_type: Arc<dyn ValueType<V>>,
}

impl<K, V> Page<K, V> {
    pub(crate) fn empty_leaf(
        key_type: Arc<dyn KeyType<K>>,
        value_type: Arc<dyn ValueType<V>>,
    ) -> Self {
        Self::leaf(Vec::new(), Vec::new(), key_type, value_type)
    }

    pub(crate) fn leaf(
        keys: Vec<K>,
        values: Vec<V>,
        key_type: Arc<dyn KeyType<K>>,
        value_type: Arc<dyn ValueType<V>>,
    ) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let mut page = Self {
            keys,
            content: Content::Leaf { values },
            pos: AtomicU64::new(0),
            memory: 0,
            cached_compare: AtomicUsize::new(0),
            key_type,
            value_type,
        };
        page.recalculate_memory();
        page
    }

    pub(crate) fn node(
        keys: Vec<K>,
        children: Vec<PageRef<K, V>>,
        key_type: Arc<dyn KeyType<K>>,
        value_type: Arc<dyn ValueType<V>>,
    ) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        let total_count = children.iter().map(|c| c.count).sum();
        let mut page = Self {
            keys,
            content: Content::Node {
                children,
                total_count,
            },
            pos: AtomicU64::new(0),
            memory: 0,
            cached_compare: AtomicUsize::new(0),
            key_type,
            value_type,
        };
        page.recalculate_memory();
        page
    }

    /// Whether this is a leaf page.
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.content, Content::Leaf { .. })
    }

    /// Number of keys on this page.
    #[inline]
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Key at the given index.
    #[must_use]
    pub fn get_key(&self, index: usize) -> &K {
        &self.keys[index]
    }

    /// Value at the given index.
    ///
    /// # Panics
    /// Panics if this is not a leaf page.
    #[must_use]
    pub fn get_value(&self, index: usize) -> &V {
        match &self.content {
            Content::Leaf { values } => &values[index],
            Content::Node { .. } => panic!("get_value on an internal page"),
        }
    }

    /// Number of direct children.
    ///
    /// # Panics
    /// Panics if this is a leaf page.
    #[must_use]
    pub fn child_count(&self) -> usize {
        match &self.content {
            Content::Node { children, .. } => children.len(),
            Content::Leaf { .. } => panic!("child_count on a leaf page"),
        }
    }

    /// Child page at the given index.
    ///
    /// # Panics
    /// Panics if this is a leaf page.
    #[must_use]
    pub fn child_page(&self, index: usize) -> &Arc<Page<K, V>> {
        match &self.content {
            Content::Node { children, .. } => &children[index].page,
            Content::Leaf { .. } => panic!("child_page on a leaf page"),
        }
    }

    /// Cached entry count of the subtree below child `index`.
    ///
    /// # Panics
    /// Panics if this is a leaf page.
    #[must_use]
    pub fn counts(&self, index: usize) -> u64 {
        match &self.content {
            Content::Node { children, .. } => children[index].count,
            Content::Leaf { .. } => panic!("counts on a leaf page"),
        }
    }

    /// Total number of entries in the subtree rooted at this page.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        match &self.content {
            Content::Leaf { values } => values.len() as u64,
            Content::Node { total_count, .. } => *total_count,
        }
    }

    /// Store position of this page; 0 while unsaved.
    #[inline]
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.pos.load(POS_READ)
    }

    /// Whether the page has been saved to the store's page table.
    #[inline]
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.pos() != 0
    }

    /// Record the position this page was saved at.
    pub(crate) fn mark_saved(&self, pos: u64) {
        debug_assert_ne!(pos, 0);
        self.pos.store(pos, POS_WRITE);
    }

    /// Estimated heap cost of this page, in bytes.
    #[inline]
    #[must_use]
    pub fn memory(&self) -> i64 {
        self.memory
    }

    /// Compare two keys with this map's key order.
    #[inline]
    pub(crate) fn compare_keys(&self, a: &K, b: &K) -> Ordering {
        self.key_type.compare(a, b)
    }

    /// Binary search for a key.
    ///
    /// Returns the index if found, otherwise `-(insertion_point + 1)` where
    /// the insertion point is the index of the first key greater than the
    /// search key. The search starts from the index that concluded the
    /// previous search on this page, which makes sequential probes cheap.
    pub fn binary_search(&self, key: &K) -> isize {
        let mut low: isize = 0;
        let mut high: isize = self.keys.len() as isize - 1;
        // the cached index minus one, so that a fresh page starts mid-range
        let mut x: isize = self.cached_compare.load(STAT) as isize - 1;
        if x < 0 || x > high {
            x = high >> 1;
        }
        while low <= high {
            match self.key_type.compare(key, &self.keys[x as usize]) {
                Ordering::Greater => low = x + 1,
                Ordering::Less => high = x - 1,
                Ordering::Equal => {
                    self.cached_compare.store((x + 1) as usize, STAT);
                    return x;
                }
            }
            x = (low + high) >> 1;
        }
        self.cached_compare.store(low as usize, STAT);
        -(low + 1)
    }

    fn recalculate_memory(&mut self) {
        let mut mem = PAGE_MEMORY;
        for key in &self.keys {
            mem += self.key_type.memory(key) as i64;
        }
        match &self.content {
            Content::Leaf { values } => {
                for value in values {
                    mem += self.value_type.memory(value) as i64;
                }
            }
            Content::Node { children, .. } => {
                mem += children.len() as i64 * PAGE_MEMORY_CHILD;
            }
        }
        self.memory = mem;
    }

    /// Register this page's disk footprint for release at `version`, or
    /// refund its memory estimate if it was never saved. Returns the
    /// unsaved-memory delta to report to the store.
    pub(crate) fn remove_page(&self, version: i64, store: &StoreInner, persistent: bool) -> i64 {
        if persistent && self.total_count() > 0 {
            let pos = self.pos();
            if pos == 0 {
                return -self.memory;
            }
            store.account_for_removed_page(pos, version);
        }
        0
    }

    /// Walk the whole subtree queueing saved pages for release at `version`.
    /// Returns the summed unsaved-memory delta.
    pub(crate) fn remove_all_recursive(
        &self,
        version: i64,
        store: &StoreInner,
        persistent: bool,
    ) -> i64 {
        let mut unsaved = 0;
        if let Content::Node { children, .. } = &self.content {
            for child in children {
                unsaved += child.page.remove_all_recursive(version, store, persistent);
            }
        }
        unsaved + self.remove_page(version, store, persistent)
    }

    /// Walk from `page` down to the value for `key`, if present.
    pub(crate) fn get<'a>(mut page: &'a Page<K, V>, key: &K) -> Option<&'a V> {
        loop {
            let x = page.binary_search(key);
            if page.is_leaf() {
                return if x < 0 {
                    None
                } else {
                    Some(page.get_value(x as usize))
                };
            }
            let index = if x >= 0 { x + 1 } else { -(x + 1) } as usize;
            page = page.child_page(index).as_ref();
        }
    }
}

impl<K: Clone, V: Clone> Page<K, V> {
    /// Shallow copy with fresh arrays; the copy is unsaved and privately
    /// owned, so the caller may mutate it freely.
    #[must_use]
    pub(crate) fn copy(&self) -> Self {
        let content = match &self.content {
            Content::Leaf { values } => Content::Leaf {
                values: values.clone(),
            },
            Content::Node {
                children,
                total_count,
            } => Content::Node {
                children: children.clone(),
                total_count: *total_count,
            },
        };
        Self {
            keys: self.keys.clone(),
            content,
            pos: AtomicU64::new(0),
            memory: self.memory,
            cached_compare: AtomicUsize::new(0),
            key_type: Arc::clone(&self.key_type),
            value_type: Arc::clone(&self.value_type),
        }
    }

    /// Split this page at `at`, keeping `[0, at)` here and returning the
    /// upper half. For a leaf the pivot key stays in the returned page; for
    /// an internal node the pivot is removed from both halves and must be
    /// handed up by the caller.
    pub(crate) fn split(&mut self, at: usize) -> Self {
        debug_assert!(!self.is_saved());
        let right = match &mut self.content {
            Content::Leaf { values } => {
                let right_keys = self.keys.split_off(at);
                let right_values = values.split_off(at);
                Self::leaf(
                    right_keys,
                    right_values,
                    Arc::clone(&self.key_type),
                    Arc::clone(&self.value_type),
                )
            }
            Content::Node {
                children,
                total_count,
            } => {
                let mut right_keys = self.keys.split_off(at);
                right_keys.remove(0);
                let right_children = children.split_off(at + 1);
                *total_count = children.iter().map(|c| c.count).sum();
                Self::node(
                    right_keys,
                    right_children,
                    Arc::clone(&self.key_type),
                    Arc::clone(&self.value_type),
                )
            }
        };
        self.recalculate_memory();
        right
    }

    /// Insert a key/value pair at `index`, shifting later entries right.
    /// Only legal on a privately owned leaf copy.
    pub(crate) fn insert_leaf(&mut self, index: usize, key: K, value: V) {
        debug_assert!(!self.is_saved());
        self.memory +=
            self.key_type.memory(&key) as i64 + self.value_type.memory(&value) as i64;
        match &mut self.content {
            Content::Leaf { values } => values.insert(index, value),
            Content::Node { .. } => panic!("insert_leaf on an internal page"),
        }
        self.keys.insert(index, key);
    }

    /// Replace the value at `index`.
    pub(crate) fn set_value(&mut self, index: usize, value: V) {
        debug_assert!(!self.is_saved());
        match &mut self.content {
            Content::Leaf { values } => {
                self.memory += self.value_type.memory(&value) as i64
                    - self.value_type.memory(&values[index]) as i64;
                values[index] = value;
            }
            Content::Node { .. } => panic!("set_value on an internal page"),
        }
    }

    /// Swap the child at `index` for another page.
    pub(crate) fn set_child(&mut self, index: usize, child: Arc<Page<K, V>>) {
        debug_assert!(!self.is_saved());
        match &mut self.content {
            Content::Node {
                children,
                total_count,
            } => {
                let new_ref = PageRef::new(child);
                *total_count = *total_count + new_ref.count - children[index].count;
                children[index] = new_ref;
            }
            Content::Leaf { .. } => panic!("set_child on a leaf page"),
        }
    }

    /// Insert a key and a child at `index`, shifting later entries right.
    pub(crate) fn insert_node(&mut self, index: usize, key: K, child: Arc<Page<K, V>>) {
        debug_assert!(!self.is_saved());
        self.memory += self.key_type.memory(&key) as i64 + PAGE_MEMORY_CHILD;
        match &mut self.content {
            Content::Node {
                children,
                total_count,
            } => {
                let new_ref = PageRef::new(child);
                *total_count += new_ref.count;
                children.insert(index, new_ref);
            }
            Content::Leaf { .. } => panic!("insert_node on a leaf page"),
        }
        self.keys.insert(index, key);
    }

    /// Remove the entry at `index`. On a leaf this deletes a key/value
    /// pair; on an internal node it deletes the child at `index` and the
    /// nearest separator key.
    pub(crate) fn remove(&mut self, index: usize) {
        debug_assert!(!self.is_saved());
        let key_count = self.keys.len();
        if key_count > 0 {
            let key_index = if index == key_count { index - 1 } else { index };
            let key = self.keys.remove(key_index);
            self.memory -= self.key_type.memory(&key) as i64;
        }
        match &mut self.content {
            Content::Leaf { values } => {
                let value = values.remove(index);
                self.memory -= self.value_type.memory(&value) as i64;
            }
            Content::Node {
                children,
                total_count,
            } => {
                let child = children.remove(index);
                *total_count -= child.count;
                self.memory -= PAGE_MEMORY_CHILD;
            }
        }
    }

    /// Append `count` entries from the front of an append buffer onto this
    /// leaf. Every appended key must be greater than the last existing key.
    pub(crate) fn expand(&mut self, count: usize, buffer: &[Option<(K, V)>]) {
        debug_assert!(!self.is_saved());
        for slot in buffer.iter().take(count) {
            let (key, value) = slot
                .clone()
                .expect("append buffer slot below the fill mark is empty");
            debug_assert!(self
                .keys
                .last()
                .is_none_or(|last| self.key_type.compare(last, &key) == Ordering::Less));
            self.memory +=
                self.key_type.memory(&key) as i64 + self.value_type.memory(&value) as i64;
            match &mut self.content {
                Content::Leaf { values } => values.push(value),
                Content::Node { .. } => panic!("expand on an internal page"),
            }
            self.keys.push(key);
        }
    }
}

impl<K, V> fmt::Debug for Page<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("kind", if self.is_leaf() { &"leaf" } else { &"node" })
            .field("keys", &self.keys.len())
            .field("total", &self.total_count())
            .field("pos", &self.pos())
            .finish()
    }
}
