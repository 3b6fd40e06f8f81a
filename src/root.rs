//! The atomically published map state.
//!
//! [`RootReference`] is an immutable snapshot of everything a map is at one
//! instant: root page, write version, update counters, logical-lock state,
//! append-buffer fill, and a link to the previous version. The whole
//! mutation protocol of a map is "build a new `RootReference`, compare-and-
//! set it into the root cell".
//!
//! # The lock is a value
//!
//! The reentrant writer lock is embedded in the reference itself: a
//! non-zero `hold_count` plus the owning thread id. Acquiring it is just
//! another CAS that publishes a locked descriptor, so readers never block
//! and there is no OS mutex to invert priorities on.
//!
//! # Reclamation
//!
//! The cell hands out `Arc` clones to readers, but the load itself is a
//! raw pointer read. A seize guard spans the load and the strong-count
//! bump, and a successful CAS defers the release of the replaced pointer
//! until every guard that might have seen it is gone.

use std::fmt;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use seize::{Collector, Guard, LocalGuard};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, ROOT_READ};
use crate::page::Page;

// ============================================================================
//  RootReference
// ============================================================================

/// Immutable descriptor of a map's current state.
pub struct RootReference<K, V> {
    /// The root page.
    pub root: Arc<Page<K, V>>,
    /// The version used for writing.
    pub version: i64,
    /// Counter of successful root updates.
    pub update_counter: u64,
    /// Counter of attempted root updates.
    pub update_attempt_counter: u64,
    /// Reentrant hold count of the logical writer lock.
    hold_count: u8,
    /// Owner of the logical lock while `hold_count` is non-zero.
    owner: Option<ThreadId>,
    /// Occupied slots of the append buffer.
    append_counter: u16,
    /// The last root of the previous version that carried data changes;
    /// versions without changes are elided from the chain as it is built.
    /// Cleared by version pruning, the only mutation this otherwise
    /// immutable value ever sees.
    previous: Mutex<Option<Arc<RootReference<K, V>>>>,
}

impl<K, V> RootReference<K, V> {
    /// Initial root, also used for read-only snapshots.
    pub(crate) fn new(root: Arc<Page<K, V>>, version: i64) -> Self {
        Self {
            root,
            version,
            update_counter: 1,
            update_attempt_counter: 1,
            hold_count: 0,
            owner: None,
            append_counter: 0,
            previous: Mutex::new(None),
        }
    }

    /// Candidate carrying a new root page, staying unlocked.
    pub(crate) fn updated(&self, root: Arc<Page<K, V>>, attempt: u64) -> Self {
        Self {
            root,
            version: self.version,
            update_counter: self.update_counter + 1,
            update_attempt_counter: self.update_attempt_counter + attempt,
            hold_count: 0,
            owner: None,
            append_counter: self.append_counter,
            previous: Mutex::new(self.previous()),
        }
    }

    /// Candidate taking (or re-entering) the logical lock.
    pub(crate) fn locked(&self, attempt: u64) -> Self {
        debug_assert!(self.hold_count == 0 || self.owner == Some(thread::current().id()));
        Self {
            root: Arc::clone(&self.root),
            version: self.version,
            update_counter: self.update_counter + 1,
            update_attempt_counter: self.update_attempt_counter + attempt,
            hold_count: self.hold_count + 1,
            owner: Some(thread::current().id()),
            append_counter: self.append_counter,
            previous: Mutex::new(self.previous()),
        }
    }

    /// Candidate installing a page and releasing (or keeping) the lock.
    pub(crate) fn unlocked(
        &self,
        root: Arc<Page<K, V>>,
        keep_locked: bool,
        append_counter: u16,
    ) -> Self {
        debug_assert!(self.hold_count > 0 && self.owner == Some(thread::current().id()));
        let hold_count = self.hold_count - u8::from(!keep_locked);
        Self {
            root,
            version: self.version,
            update_counter: self.update_counter,
            update_attempt_counter: self.update_attempt_counter,
            hold_count,
            owner: if hold_count == 0 { None } else { self.owner },
            append_counter,
            previous: Mutex::new(self.previous()),
        }
    }

    /// Candidate advancing the write version, chaining `this` as the
    /// previous version and dropping one lock hold if present.
    pub(crate) fn versioned(this: &Arc<Self>, version: i64, attempt: u64) -> Self {
        let mut previous = Arc::clone(this);
        while let Some(older) = previous.previous() {
            if Arc::ptr_eq(&older.root, &this.root) {
                previous = older;
            } else {
                break;
            }
        }
        let hold_count = this.hold_count.saturating_sub(1);
        debug_assert_eq!(this.append_counter, 0);
        Self {
            root: Arc::clone(&this.root),
            version,
            update_counter: this.update_counter + 1,
            update_attempt_counter: this.update_attempt_counter + attempt,
            hold_count,
            owner: if hold_count == 0 { None } else { this.owner },
            append_counter: 0,
            previous: Mutex::new(Some(previous)),
        }
    }

    /// Link to the previous version, if still retained.
    #[must_use]
    pub fn previous(&self) -> Option<Arc<RootReference<K, V>>> {
        self.previous.lock().clone()
    }

    /// Whether some writer holds the logical lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.hold_count != 0
    }

    #[inline]
    fn is_free(&self) -> bool {
        self.hold_count == 0
    }

    /// Whether the current thread may publish a successor of this
    /// reference: it is free, or this thread already holds the lock.
    #[inline]
    pub(crate) fn can_update(&self) -> bool {
        self.is_free() || self.owner == Some(thread::current().id())
    }

    /// Whether the calling thread holds the logical lock.
    #[must_use]
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.hold_count != 0 && self.owner == Some(thread::current().id())
    }

    /// Occupied slots of the append buffer.
    #[inline]
    #[must_use]
    pub fn append_counter(&self) -> u16 {
        self.append_counter
    }

    /// Whether an append-buffer flush is pending.
    #[must_use]
    pub fn need_flush(&self) -> bool {
        self.append_counter != 0
    }

    /// Entries in the tree plus entries still sitting in the append buffer.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.root.total_count() + u64::from(self.append_counter)
    }

    /// Version of the last reference that actually changed data; walks the
    /// chain past references that share this root unchanged.
    #[must_use]
    pub fn get_version(&self) -> i64 {
        let mut version = self.version;
        let mut root = Arc::clone(&self.root);
        let mut append_counter = self.append_counter;
        let mut prev = self.previous();
        while let Some(older) = prev {
            if !Arc::ptr_eq(&older.root, &root) || older.append_counter != append_counter {
                break;
            }
            version = older.version;
            root = Arc::clone(&older.root);
            append_counter = older.append_counter;
            prev = older.previous();
        }
        version
    }

    /// Does this root have changes since the given version?
    pub(crate) fn has_changes_since(&self, version: i64, persistent: bool) -> bool {
        persistent
            && (if self.root.is_saved() {
                self.append_counter > 0
            } else {
                self.total_count() > 0
            })
            || self.get_version() > version
    }

    /// Cut the previous-version chain below `oldest_version_to_keep`.
    ///
    /// At least one previous version is kept where possible: a root
    /// labelled with version X is the last root of X and therefore the
    /// first root of X + 1.
    pub(crate) fn remove_unused_old_versions(this: &Arc<Self>, oldest_version_to_keep: i64) {
        let mut root_ref = Some(Arc::clone(this));
        while let Some(current) = root_ref {
            if current.version < oldest_version_to_keep {
                *current.previous.lock() = None;
            }
            root_ref = current.previous();
        }
    }
}

impl<K, V> fmt::Debug for RootReference<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootReference")
            .field("version", &self.version)
            .field("keys", &self.root.total_count())
            .field("append", &self.append_counter)
            .field("holds", &self.hold_count)
            .field("owner", &self.owner)
            .finish()
    }
}

// ============================================================================
//  RootCell
// ============================================================================

/// Reclaimer for a replaced root reference (seize callback).
///
/// # Safety
///
/// - `ptr` must have been published via `Arc::into_raw`.
/// - Must only run after seize determines no reader can still see it.
unsafe fn release_root<K, V>(ptr: *mut RootReference<K, V>, _collector: &Collector) {
    // SAFETY: drops the strong count the cell held for this pointer.
    unsafe { drop(Arc::from_raw(ptr)) };
}

/// The per-map atomic cell holding the current [`RootReference`].
///
/// Owns one strong count of the published `Arc`; readers bump the count
/// under a seize guard, writers publish by compare-and-set and retire the
/// replaced pointer.
pub(crate) struct RootCell<K, V> {
    collector: Collector,
    root: AtomicPtr<RootReference<K, V>>,
}

impl<K, V> RootCell<K, V> {
    pub(crate) fn new(initial: RootReference<K, V>) -> Self {
        Self {
            collector: Collector::new(),
            root: AtomicPtr::new(Arc::into_raw(Arc::new(initial)).cast_mut()),
        }
    }

    #[inline]
    fn load(&self, _guard: &LocalGuard<'_>) -> *mut RootReference<K, V> {
        self.root.load(ROOT_READ)
    }

    /// Current root reference.
    pub(crate) fn get(&self) -> Arc<RootReference<K, V>> {
        let guard = self.collector.enter();
        let ptr = self.load(&guard);
        // SAFETY: the guard spans the load, so the cell's strong count for
        // `ptr` cannot be released before the bump below.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Publish `new` if the cell still holds `expected`.
    pub(crate) fn compare_and_set(
        &self,
        expected: &Arc<RootReference<K, V>>,
        new: Arc<RootReference<K, V>>,
    ) -> bool {
        let expected_ptr = Arc::as_ptr(expected).cast_mut();
        let new_ptr = Arc::into_raw(new).cast_mut();
        match self
            .root
            .compare_exchange(expected_ptr, new_ptr, CAS_SUCCESS, CAS_FAILURE)
        {
            Ok(prev) => {
                let guard = self.collector.enter();
                // SAFETY: `prev` was published via Arc::into_raw; readers
                // may still hold raw loads of it, so its strong count is
                // released only after the grace period.
                unsafe { guard.defer_retire(prev, release_root::<K, V>) };
                true
            }
            Err(_) => {
                // SAFETY: `new_ptr` came from Arc::into_raw above and was
                // never published.
                unsafe { drop(Arc::from_raw(new_ptr)) };
                false
            }
        }
    }

    /// Unconditionally replace the published reference.
    pub(crate) fn set(&self, new: RootReference<K, V>) {
        let new_ptr = Arc::into_raw(Arc::new(new)).cast_mut();
        let prev = self.root.swap(new_ptr, CAS_SUCCESS);
        let guard = self.collector.enter();
        // SAFETY: as in `compare_and_set`.
        unsafe { guard.defer_retire(prev, release_root::<K, V>) };
    }
}

impl<K, V> Drop for RootCell<K, V> {
    fn drop(&mut self) {
        let ptr = *self.root.get_mut();
        // SAFETY: exclusive access; drops the cell's strong count.
        unsafe { drop(Arc::from_raw(ptr)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NaturalOrder, PlainSize};

    fn empty_root() -> Arc<Page<u32, u32>> {
        Arc::new(Page::empty_leaf(Arc::new(NaturalOrder), Arc::new(PlainSize)))
    }

    #[test]
    fn cas_publishes_and_rejects_stale() {
        let cell = RootCell::new(RootReference::new(empty_root(), 0));
        let first = cell.get();
        let second = Arc::new(first.updated(empty_root(), 1));
        assert!(cell.compare_and_set(&first, Arc::clone(&second)));
        assert!(Arc::ptr_eq(&cell.get(), &second));
        // a CAS against the replaced reference must fail
        let stale = Arc::new(first.updated(empty_root(), 1));
        assert!(!cell.compare_and_set(&first, stale));
        assert!(Arc::ptr_eq(&cell.get(), &second));
    }

    #[test]
    fn lock_is_reentrant_for_owner() {
        let root = RootReference::<u32, u32>::new(empty_root(), 0);
        assert!(!root.is_locked());
        let once = root.locked(1);
        assert!(once.is_locked());
        assert!(once.is_locked_by_current_thread());
        assert!(once.can_update());
        let twice = once.locked(1);
        let back = twice.unlocked(Arc::clone(&twice.root), false, 0);
        assert!(back.is_locked_by_current_thread());
        let free = back.unlocked(Arc::clone(&back.root), false, 0);
        assert!(!free.is_locked());
        assert!(free.can_update());
    }

    #[test]
    fn version_chain_elides_unchanged_roots() {
        let v0 = Arc::new(RootReference::<u32, u32>::new(empty_root(), 0));
        let v1 = Arc::new(RootReference::versioned(&v0, 1, 1));
        // no data changed between v0 and v1, so v1 still reports version 0
        assert_eq!(v1.get_version(), 0);
        let changed = Arc::new(v1.updated(empty_root(), 1));
        assert_eq!(changed.get_version(), 1);
        let v2 = Arc::new(RootReference::versioned(&changed, 2, 1));
        assert!(Arc::ptr_eq(&v2.previous().unwrap(), &changed));
    }

    #[test]
    fn pruning_cuts_the_chain() {
        let v0 = Arc::new(RootReference::<u32, u32>::new(empty_root(), 0));
        let v1 = Arc::new(RootReference::versioned(&v0, 1, 1));
        let changed = Arc::new(v1.updated(empty_root(), 1));
        let v2 = Arc::new(RootReference::versioned(&changed, 2, 1));
        // chain: v2 -> changed(v1) -> v0
        assert!(Arc::ptr_eq(&v2.previous().unwrap(), &changed));
        assert!(Arc::ptr_eq(&changed.previous().unwrap(), &v0));
        RootReference::remove_unused_old_versions(&v2, 1);
        // the version-1 link survives; only refs older than the cutoff
        // lose their tail (v0 had none)
        assert!(v2.previous().is_some());
        RootReference::remove_unused_old_versions(&v2, 2);
        // the version-1 reference is now below the cutoff: its tail is cut,
        // but it stays reachable as the first root of version 2
        assert!(v2.previous().unwrap().previous().is_none());
    }
}
