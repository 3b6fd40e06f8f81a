//! `MvMap` - a multi-version ordered key-value map.
//!
//! All read and write operations can happen concurrently with all other
//! operations, without risk of corruption.
//!
//! # Concurrency model
//!
//! 1. Readers: load the published [`RootReference`] and walk immutable
//!    pages. No locks, no retries.
//! 2. Writers: rebuild the affected root-to-leaf path copy-on-write and
//!    publish the new root with a single compare-and-set. Under contention
//!    a writer escalates to the logical lock embedded in the root
//!    reference; the loser of a CAS race retries.
//!
//! Single-writer maps additionally keep an append buffer: a bounded
//! overflow area past the rightmost leaf that turns strictly-ascending
//! inserts into bulk leaf builds.

use std::any::Any;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cursor::{Cursor, KeyCursor};
use crate::cursor_pos::CursorPos;
use crate::decision::{
    self, values_equal, Decision, DecisionMaker, EqualsDecisionMaker, RewriteDecisionMaker,
};
use crate::error::{MvError, Result};
use crate::ordering::STAT;
use crate::page::{Page, PageRef};
use crate::root::{RootCell, RootReference};
use crate::store::{MapHandle, StoreInner};
use crate::tracing_log::{debug_log, trace_log};
use crate::types::{KeyType, NaturalOrder, PlainSize, ValueType};

/// The "last stored" version of a store that was just opened, older than
/// every real version.
pub const INITIAL_VERSION: i64 = -1;

type AppendBuffer<K, V> = Box<[Option<(K, V)>]>;

/// A multi-version ordered map owned by an [`MvStore`](crate::store::MvStore).
pub struct MvMap<K, V> {
    store: Arc<StoreInner>,
    id: u32,
    create_version: i64,
    root: RootCell<K, V>,
    keys_per_page: usize,
    single_writer: bool,
    /// Staging area for ordered appends; only the logical-lock owner may
    /// touch it, the mutex makes that visible to the compiler.
    append_buffer: Option<Mutex<AppendBuffer<K, V>>>,
    key_type: Arc<dyn KeyType<K>>,
    value_type: Arc<dyn ValueType<V>>,
    closed: AtomicBool,
    read_only: bool,
    volatile_flag: AtomicBool,
    /// Contention-ladder parking spot for writers waiting on the logical lock.
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
    notification_requested: AtomicBool,
}

impl<K, V> std::fmt::Debug for MvMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MvMap").field("id", &self.id).finish()
    }
}

impl<K, V> MvMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        store: Arc<StoreInner>,
        id: u32,
        create_version: i64,
        single_writer: bool,
        key_type: Arc<dyn KeyType<K>>,
        value_type: Arc<dyn ValueType<V>>,
    ) -> Arc<Self> {
        let keys_per_page = store.keys_per_page();
        let initial_root = Arc::new(Page::empty_leaf(
            Arc::clone(&key_type),
            Arc::clone(&value_type),
        ));
        let initial_version = store.current_version();
        Arc::new(Self {
            store,
            id,
            create_version,
            root: RootCell::new(RootReference::new(initial_root, initial_version)),
            keys_per_page,
            single_writer,
            append_buffer: single_writer
                .then(|| Mutex::new((0..keys_per_page).map(|_| None).collect())),
            key_type,
            value_type,
            closed: AtomicBool::new(false),
            read_only: false,
            volatile_flag: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            notification_requested: AtomicBool::new(false),
        })
    }

    /// Read-only clone over a fixed root, used for version snapshots.
    fn open_read_only(&self, root: Arc<Page<K, V>>, version: i64) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::clone(&self.store),
            id: self.id,
            create_version: self.create_version,
            root: RootCell::new(RootReference::new(root, version)),
            keys_per_page: self.keys_per_page,
            single_writer: false,
            append_buffer: None,
            key_type: Arc::clone(&self.key_type),
            value_type: Arc::clone(&self.value_type),
            closed: AtomicBool::new(false),
            read_only: true,
            volatile_flag: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            notification_requested: AtomicBool::new(false),
        })
    }

    fn create_empty_leaf(&self) -> Page<K, V> {
        Page::empty_leaf(Arc::clone(&self.key_type), Arc::clone(&self.value_type))
    }

    // ========================================================================
    //  Metadata
    // ========================================================================

    /// The map name, as registered with the store.
    #[must_use]
    pub fn name(&self) -> String {
        self.store.map_name(self.id)
    }

    /// The store-assigned map id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The store version this map was created at.
    #[must_use]
    pub fn create_version(&self) -> i64 {
        self.create_version
    }

    /// Whether the map was built for single-writer append mode.
    #[must_use]
    pub fn is_single_writer(&self) -> bool {
        self.single_writer
    }

    /// Whether the map has been closed. Reads still work on a closed map.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(STAT)
    }

    /// Whether this is a read-only snapshot.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether changes to this map are excluded from page saving.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.volatile_flag.load(STAT)
    }

    /// Mark the map volatile: its changes are never saved by the store.
    pub fn set_volatile(&self, is_volatile: bool) {
        self.volatile_flag.store(is_volatile, STAT);
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.store.has_page_store() && !self.is_volatile()
    }

    /// Number of entries, saturating at `usize::MAX`.
    #[must_use]
    pub fn size(&self) -> usize {
        usize::try_from(self.size_as_long()).unwrap_or(usize::MAX)
    }

    /// Number of entries.
    #[must_use]
    pub fn size_as_long(&self) -> u64 {
        self.get_root().total_count()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size_as_long() == 0
    }

    // ========================================================================
    //  Root access
    // ========================================================================

    /// The currently published root reference, without flushing appends.
    pub fn get_root(&self) -> Arc<RootReference<K, V>> {
        self.root.get()
    }

    /// The root reference, flushing any pending append buffer first.
    pub fn flush_and_get_root(&self) -> Arc<RootReference<K, V>> {
        let root_ref = self.get_root();
        if self.single_writer && root_ref.append_counter() > 0 {
            return self.flush_append_buffer(root_ref, true);
        }
        root_ref
    }

    /// The current root page.
    #[must_use]
    pub fn root_page(&self) -> Arc<Page<K, V>> {
        Arc::clone(&self.flush_and_get_root().root)
    }

    fn set_initial_root(&self, root_page: Arc<Page<K, V>>, version: i64) {
        self.root.set(RootReference::new(root_page, version));
    }

    fn try_update(
        &self,
        expected: &Arc<RootReference<K, V>>,
        candidate: RootReference<K, V>,
    ) -> Option<Arc<RootReference<K, V>>> {
        let new_ref = Arc::new(candidate);
        if self.root.compare_and_set(expected, Arc::clone(&new_ref)) {
            Some(new_ref)
        } else {
            None
        }
    }

    // ========================================================================
    //  Point reads
    // ========================================================================

    /// Value stored for `key`, or `None`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let root = self.root_page();
        Page::get(&root, key).cloned()
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        let root = self.root_page();
        Page::get(&root, key).is_some()
    }

    // ========================================================================
    //  Point writes
    // ========================================================================

    /// Add or replace a key-value pair. Returns the previous value, if any.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.operate(key, Some(value), &mut decision::Put)
    }

    /// Add a key-value pair if the key is absent. Returns the existing
    /// value, if any; the map is only modified when `None` is returned.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        self.operate(key, Some(value), &mut decision::IfAbsent)
    }

    /// Replace the value of an existing key. Returns the previous value if
    /// the key was present, otherwise leaves the map unchanged.
    pub fn replace(&self, key: &K, value: V) -> Result<Option<V>> {
        self.operate(key.clone(), Some(value), &mut decision::IfPresent)
    }

    /// Replace the value only when the current value equals `old`.
    pub fn replace_if_equals(&self, key: &K, old: &V, new: V) -> Result<bool>
    where
        V: PartialEq,
    {
        let mut maker = EqualsDecisionMaker::new(Some(old.clone()));
        let result = self.operate(key.clone(), Some(new), &mut maker)?;
        let replaced = maker.decision() != Some(Decision::Abort);
        debug_assert!(!replaced || values_equal(Some(old), result.as_ref()));
        Ok(replaced)
    }

    /// Remove a key-value pair. Returns the removed value, if any.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.operate(key.clone(), None, &mut decision::Remove)
    }

    /// Remove the entry only when its value equals `value`.
    pub fn remove_if_equals(&self, key: &K, value: &V) -> Result<bool>
    where
        V: PartialEq,
    {
        let mut maker = EqualsDecisionMaker::new(Some(value.clone()));
        self.operate(key.clone(), None, &mut maker)?;
        Ok(maker.decision() != Some(Decision::Abort))
    }

    // ========================================================================
    //  operate - the mutation pipeline
    // ========================================================================

    /// Add, replace or remove a key-value pair, with the decision delegated
    /// to `decision_maker` once the update target is found.
    ///
    /// Returns the previous value, if a mapping for the key existed.
    pub fn operate(
        &self,
        key: K,
        value: Option<V>,
        decision_maker: &mut dyn DecisionMaker<K, V>,
    ) -> Result<Option<V>> {
        let mut value = value;
        let mut attempt: u64 = 0;
        loop {
            let mut root_ref = self.flush_and_get_root();
            let mut locked = root_ref.is_locked_by_current_thread();
            if !locked {
                attempt += 1;
                if attempt == 1 {
                    self.before_write()?;
                }
                if attempt > 3 || root_ref.is_locked() {
                    root_ref = self.lock_root(root_ref, attempt);
                    locked = true;
                }
            }
            let root_page = Arc::clone(&root_ref.root);
            let version = root_ref.version;
            let mut unsaved_memory: i64 = 0;

            let tip = CursorPos::traverse_down(&root_page, &key);
            if !locked && !Arc::ptr_eq(&root_ref, &self.get_root()) {
                trace_log!(attempt, "operate: root moved during traversal, retrying");
                continue;
            }
            let index = tip.index;
            let existing = if index < 0 {
                None
            } else {
                Some(tip.page.get_value(index as usize).clone())
            };
            let decision = decision_maker.decide_at(existing.as_ref(), value.as_ref(), &tip);
            let mut pos = tip.parent_ref();

            let new_page: Arc<Page<K, V>> = match decision {
                Decision::Repeat => {
                    decision_maker.reset();
                    if locked {
                        self.unlock_root(None, None);
                    }
                    continue;
                }

                Decision::Abort => {
                    if locked {
                        self.unlock_root(None, None);
                        return Ok(existing);
                    }
                    if !Arc::ptr_eq(&root_ref, &self.get_root()) {
                        decision_maker.reset();
                        continue;
                    }
                    return Ok(existing);
                }

                Decision::Remove => {
                    if index < 0 {
                        if locked {
                            self.unlock_root(None, None);
                            return Ok(None);
                        }
                        if !Arc::ptr_eq(&root_ref, &self.get_root()) {
                            decision_maker.reset();
                            continue;
                        }
                        return Ok(None);
                    }
                    let mut page = Arc::clone(&tip.page);
                    let mut child_index = index;
                    let mut replacement = None;
                    if tip.page.total_count() == 1 && pos.is_some() {
                        // the leaf is about to become empty: ascend, skipping
                        // legacy zero-key single-child nodes on the way
                        let mut key_count = 0;
                        while let Some(frame) = pos {
                            page = Arc::clone(&frame.page);
                            child_index = frame.index;
                            pos = frame.parent_ref();
                            key_count = frame.page.key_count();
                            if !(key_count == 0 && pos.is_some()) {
                                break;
                            }
                        }
                        if key_count <= 1 {
                            replacement = Some(if key_count == 1 {
                                // collapse the ancestor into its surviving child
                                debug_assert!(child_index <= 1);
                                Arc::clone(page.child_page((1 - child_index) as usize))
                            } else {
                                Arc::new(self.create_empty_leaf())
                            });
                        }
                    }
                    match replacement {
                        Some(page) => page,
                        None => {
                            let mut copy = page.copy();
                            copy.remove(child_index as usize);
                            Arc::new(copy)
                        }
                    }
                }

                Decision::Put => {
                    value = decision_maker.select_value(existing.as_ref(), value);
                    let selected = value
                        .clone()
                        .expect("decision maker chose Put without providing a value");
                    let mut page = tip.page.copy();
                    if index < 0 {
                        page.insert_leaf((-index - 1) as usize, key.clone(), selected);
                        loop {
                            let key_count = page.key_count();
                            if !(key_count > self.keys_per_page
                                || page.memory() > self.store.max_page_size()
                                    && key_count > if page.is_leaf() { 1 } else { 2 })
                            {
                                break;
                            }
                            let total_count = page.total_count();
                            let at = key_count >> 1;
                            let split_key = page.get_key(at).clone();
                            let right = page.split(at);
                            unsaved_memory += page.memory() + right.memory();
                            match pos {
                                None => {
                                    // split reached the root: grow the tree
                                    let children = vec![
                                        PageRef::new(Arc::new(page)),
                                        PageRef::new(Arc::new(right)),
                                    ];
                                    page = Page::node(
                                        vec![split_key],
                                        children,
                                        Arc::clone(&self.key_type),
                                        Arc::clone(&self.value_type),
                                    );
                                    debug_assert_eq!(page.total_count(), total_count);
                                    break;
                                }
                                Some(frame) => {
                                    let child = Arc::new(page);
                                    let mut parent = frame.page.copy();
                                    let child_index = frame.index as usize;
                                    pos = frame.parent_ref();
                                    parent.set_child(child_index, Arc::new(right));
                                    parent.insert_node(child_index, split_key, child);
                                    page = parent;
                                }
                            }
                        }
                    } else {
                        page.set_value(index as usize, selected);
                    }
                    Arc::new(page)
                }
            };

            let new_root_page = replace_page(pos, new_page, &mut unsaved_memory);
            if !locked {
                if self
                    .try_update(&root_ref, root_ref.updated(Arc::clone(&new_root_page), attempt))
                    .is_none()
                {
                    decision_maker.reset();
                    trace_log!(attempt, "operate: publish lost the race, retrying");
                    continue;
                }
            }
            let removed = tip.process_removal_info(version, &self.store, self.is_persistent());
            self.store.register_unsaved_memory(unsaved_memory + removed);
            if locked {
                self.unlock_root(Some(new_root_page), None);
            }
            return Ok(existing);
        }
    }

    // ========================================================================
    //  Logical lock
    // ========================================================================

    fn lock_root(
        &self,
        mut root_ref: Arc<RootReference<K, V>>,
        mut attempt: u64,
    ) -> Arc<RootReference<K, V>> {
        loop {
            if let Some(locked) = self.try_lock_root(&root_ref, attempt) {
                return locked;
            }
            attempt += 1;
            root_ref = self.get_root();
        }
    }

    /// Try to take the logical lock; on failure walk the contention ladder
    /// (spin, yield, sleep, then park until an unlock notification).
    fn try_lock_root(
        &self,
        root_ref: &Arc<RootReference<K, V>>,
        attempt: u64,
    ) -> Option<Arc<RootReference<K, V>>> {
        if root_ref.can_update() {
            if let Some(locked) = self.try_update(root_ref, root_ref.locked(attempt)) {
                return Some(locked);
            }
        }
        debug_assert!(!root_ref.is_locked_by_current_thread());

        let mut contention: u64 = 1;
        if let Some(previous) = root_ref.previous() {
            let attempts = root_ref
                .update_attempt_counter
                .saturating_sub(previous.update_attempt_counter);
            let updates = root_ref
                .update_counter
                .saturating_sub(previous.update_counter);
            contention += (attempts + 1) / (updates + 1);
        }

        if attempt > 4 {
            if attempt <= 12 {
                thread::yield_now();
            } else if attempt as i64 <= 70 - 2 * contention as i64 {
                thread::sleep(Duration::from_millis(contention));
            } else {
                trace_log!(attempt, contention, "parking until root unlock");
                let mut guard = self.wait_lock.lock();
                self.notification_requested.store(true, STAT);
                self.wait_cond
                    .wait_for(&mut guard, Duration::from_millis(5));
            }
        }
        None
    }

    fn unlock_root(
        &self,
        new_root_page: Option<Arc<Page<K, V>>>,
        append_counter: Option<u16>,
    ) -> Arc<RootReference<K, V>> {
        let updated = loop {
            let root_ref = self.get_root();
            debug_assert!(root_ref.is_locked_by_current_thread());
            let page = new_root_page
                .clone()
                .unwrap_or_else(|| Arc::clone(&root_ref.root));
            let counter = append_counter.unwrap_or_else(|| root_ref.append_counter());
            if let Some(updated) = self.try_update(&root_ref, root_ref.unlocked(page, false, counter))
            {
                break updated;
            }
        };
        self.notify_waiters();
        updated
    }

    fn notify_waiters(&self) {
        if self.notification_requested.load(STAT) {
            let _guard = self.wait_lock.lock();
            self.notification_requested.store(false, STAT);
            self.wait_cond.notify_one();
        }
    }

    /// Called before any write. Fails fast on closed or read-only maps and
    /// gives the store a chance to shed memory pressure.
    fn before_write(&self) -> Result<()> {
        debug_assert!(!self.get_root().is_locked_by_current_thread());
        if self.is_closed() {
            return Err(MvError::Closed {
                name: self.name(),
                id: self.id,
            });
        }
        if self.read_only {
            return Err(MvError::ReadOnly { name: self.name() });
        }
        self.store.before_write(self.is_volatile());
        Ok(())
    }

    // ========================================================================
    //  Append mode
    // ========================================================================

    /// Append an entry whose key is greater than every existing key.
    ///
    /// Only meaningful on single-writer maps, where it stages the entry in
    /// the append buffer; on other maps it falls back to [`MvMap::put`].
    /// Not safe to combine with concurrent mutators of the same map.
    pub fn append(&self, key: K, value: V) -> Result<()> {
        if !self.single_writer {
            self.put(key, value)?;
            return Ok(());
        }
        self.before_write()?;
        let mut root_ref = self.lock_root(self.get_root(), 1);
        let mut append_counter = root_ref.append_counter() as usize;
        if append_counter >= self.keys_per_page {
            root_ref = self.flush_append_buffer(root_ref, false);
            append_counter = root_ref.append_counter() as usize;
            debug_assert!(append_counter < self.keys_per_page);
        }
        {
            let mut buffer = self
                .append_buffer
                .as_ref()
                .expect("single-writer map has an append buffer")
                .lock();
            buffer[append_counter] = Some((key, value));
        }
        self.unlock_root(None, Some((append_counter + 1) as u16));
        Ok(())
    }

    /// Remove the entry with the largest key.
    ///
    /// Like [`MvMap::append`], not safe to combine with concurrent mutators.
    pub fn trim_last(&self) -> Result<()> {
        if !self.single_writer {
            if let Some(last) = self.last_key() {
                self.remove(&last)?;
            }
            return Ok(());
        }
        let mut root_ref = self.get_root();
        let mut append_counter = root_ref.append_counter();
        let mut use_regular_remove = append_counter == 0;
        if !use_regular_remove {
            root_ref = self.lock_root(root_ref, 1);
            append_counter = root_ref.append_counter();
            use_regular_remove = append_counter == 0;
            if !use_regular_remove {
                append_counter -= 1;
            }
            self.unlock_root(None, Some(append_counter));
        }
        if use_regular_remove {
            let tip = CursorPos::append_path(&root_ref.root);
            debug_assert!(tip.page.is_leaf());
            if tip.page.key_count() > 0 {
                let key = tip.page.get_key(tip.page.key_count() - 1).clone();
                self.remove(&key)?;
            }
        }
        Ok(())
    }

    /// Move buffered appends into the tree, repeating until the buffer is
    /// empty (`full_flush`) or has at least one free slot.
    fn flush_append_buffer(
        &self,
        mut root_ref: Arc<RootReference<K, V>>,
        full_flush: bool,
    ) -> Arc<RootReference<K, V>> {
        let pre_locked = root_ref.is_locked_by_current_thread();
        let mut locked = pre_locked;
        let keys_per_page = self.keys_per_page;
        let availability_threshold = if full_flush { 0 } else { keys_per_page - 1 };
        let mut attempt: u64 = 0;
        loop {
            let key_count = root_ref.append_counter() as usize;
            if key_count <= availability_threshold {
                break;
            }
            if !locked {
                // someone else may flush the buffer first; then no lock is
                // needed here at all
                attempt += 1;
                let Some(locked_ref) = self.try_lock_root(&root_ref, attempt) else {
                    root_ref = self.get_root();
                    continue;
                };
                root_ref = locked_ref;
                locked = true;
            }
            debug_log!(key_count, full_flush, "flushing append buffer");

            let version = root_ref.version;
            let root_page = Arc::clone(&root_ref.root);
            let tip_path = CursorPos::append_path(&root_page);
            debug_assert!(tip_path.index < 0);
            debug_assert_eq!((-tip_path.index - 1) as usize, tip_path.page.key_count());
            let mut pos = tip_path.parent_ref();
            let mut tip = Some(&tip_path);

            let mut remaining_buffer: u16 = 0;
            let mut new_sibling: Option<Page<K, V>> = None;
            let mut p: Arc<Page<K, V>> = Arc::clone(&tip_path.page);
            {
                let mut buffer = self
                    .append_buffer
                    .as_ref()
                    .expect("single-writer map has an append buffer")
                    .lock();
                let available = keys_per_page.saturating_sub(tip_path.page.key_count());
                if available > 0 {
                    let mut copy = tip_path.page.copy();
                    if key_count <= available {
                        copy.expand(key_count, &buffer);
                    } else {
                        copy.expand(available, &buffer);
                        let overflow = key_count - available;
                        if full_flush {
                            let (keys, values) = buffer_segment(&buffer, available, key_count);
                            new_sibling = Some(Page::leaf(
                                keys,
                                values,
                                Arc::clone(&self.key_type),
                                Arc::clone(&self.value_type),
                            ));
                        } else {
                            // keep the tail buffered, compacted to the front
                            for i in 0..overflow {
                                let moved = buffer[available + i].take();
                                buffer[i] = moved;
                            }
                            remaining_buffer = overflow as u16;
                        }
                    }
                    p = Arc::new(copy);
                } else {
                    // the rightmost leaf stays as it is; the whole buffer
                    // becomes its new sibling
                    tip = tip_path.parent_ref();
                    let (keys, values) = buffer_segment(&buffer, 0, key_count);
                    new_sibling = Some(Page::leaf(
                        keys,
                        values,
                        Arc::clone(&self.key_type),
                        Arc::clone(&self.value_type),
                    ));
                }
            }

            let mut unsaved_memory: i64 = 0;
            if let Some(sibling) = new_sibling {
                debug_assert!(sibling.key_count() > 0);
                let mut split_key = sibling.get_key(0).clone();
                unsaved_memory += sibling.memory();
                let mut page: Arc<Page<K, V>> = Arc::new(sibling);
                loop {
                    match pos {
                        None => {
                            if p.key_count() == 0 {
                                p = page;
                            } else {
                                unsaved_memory += p.memory();
                                let children = vec![PageRef::new(p), PageRef::new(page)];
                                p = Arc::new(Page::node(
                                    vec![split_key],
                                    children,
                                    Arc::clone(&self.key_type),
                                    Arc::clone(&self.value_type),
                                ));
                            }
                            break;
                        }
                        Some(frame) => {
                            let child = p;
                            let mut parent = frame.page.copy();
                            let child_index = frame.index as usize;
                            pos = frame.parent_ref();
                            parent.set_child(child_index, page);
                            parent.insert_node(child_index, split_key, child);
                            let key_count = parent.key_count();
                            let at = key_count as isize - if parent.is_leaf() { 1 } else { 2 };
                            if key_count <= keys_per_page
                                && (parent.memory() < self.store.max_page_size() || at <= 0)
                            {
                                p = Arc::new(parent);
                                break;
                            }
                            // rightmost-biased split keeps append paths short
                            split_key = parent.get_key(at as usize).clone();
                            let right = parent.split(at as usize);
                            unsaved_memory += parent.memory() + right.memory();
                            page = Arc::new(right);
                            p = Arc::new(parent);
                        }
                    }
                }
            }

            let new_root = replace_page(pos, p, &mut unsaved_memory);
            let keep_locked = pre_locked || self.is_persistent();
            let candidate = root_ref.unlocked(new_root, keep_locked, remaining_buffer);
            match self.try_update(&root_ref, candidate) {
                Some(updated) => {
                    locked = keep_locked;
                    if self.is_persistent() {
                        if let Some(tip) = tip {
                            self.store.register_unsaved_memory(
                                unsaved_memory
                                    + tip.process_removal_info(version, &self.store, true),
                            );
                        }
                    }
                    debug_assert!((updated.append_counter() as usize) <= availability_threshold);
                    root_ref = updated;
                    break;
                }
                None => {
                    root_ref = self.get_root();
                }
            }
        }
        if locked && !pre_locked {
            root_ref = self.unlock_root(None, None);
        }
        root_ref
    }

    // ========================================================================
    //  Order and rank
    // ========================================================================

    /// The smallest key, or `None` if the map is empty.
    #[must_use]
    pub fn first_key(&self) -> Option<K> {
        self.get_first_last(true)
    }

    /// The largest key, or `None` if the map is empty.
    #[must_use]
    pub fn last_key(&self) -> Option<K> {
        self.get_first_last(false)
    }

    fn get_first_last(&self, first: bool) -> Option<K> {
        let mut page = self.root_page();
        if page.total_count() == 0 {
            return None;
        }
        loop {
            if page.is_leaf() {
                let index = if first { 0 } else { page.key_count() - 1 };
                return Some(page.get_key(index).clone());
            }
            let index = if first { 0 } else { page.child_count() - 1 };
            let child = Arc::clone(page.child_page(index));
            page = child;
        }
    }

    /// The smallest key strictly greater than `key`.
    #[must_use]
    pub fn higher_key(&self, key: &K) -> Option<K> {
        self.get_min_max(key, false, true)
    }

    /// The smallest key greater than or equal to `key`.
    #[must_use]
    pub fn ceiling_key(&self, key: &K) -> Option<K> {
        self.get_min_max(key, false, false)
    }

    /// The largest key smaller than or equal to `key`.
    #[must_use]
    pub fn floor_key(&self, key: &K) -> Option<K> {
        self.get_min_max(key, true, false)
    }

    /// The largest key strictly smaller than `key`.
    #[must_use]
    pub fn lower_key(&self, key: &K) -> Option<K> {
        self.get_min_max(key, true, true)
    }

    fn get_min_max(&self, key: &K, min: bool, excluding: bool) -> Option<K> {
        min_max(&self.root_page(), key, min, excluding)
    }

    /// The key at the given rank. O(log n) using the cached subtree counts.
    #[must_use]
    pub fn get_key(&self, index: i64) -> Option<K> {
        if index < 0 || index as u64 >= self.size_as_long() {
            return None;
        }
        let root = self.root_page();
        let mut page: &Page<K, V> = root.as_ref();
        let mut offset: i64 = 0;
        loop {
            if page.is_leaf() {
                if index >= offset + page.key_count() as i64 {
                    return None;
                }
                return Some(page.get_key((index - offset) as usize).clone());
            }
            let size = page.child_count();
            let mut child = 0;
            while child < size {
                let count = page.counts(child) as i64;
                if index < count + offset {
                    break;
                }
                offset += count;
                child += 1;
            }
            if child == size {
                return None;
            }
            page = page.child_page(child).as_ref();
        }
    }

    /// The rank of `key` if present, otherwise `-(insertion_rank + 1)`.
    #[must_use]
    pub fn get_key_index(&self, key: &K) -> i64 {
        let root = self.root_page();
        if root.total_count() == 0 {
            return -1;
        }
        let mut page: &Page<K, V> = root.as_ref();
        let mut offset: i64 = 0;
        loop {
            let x = page.binary_search(key);
            if page.is_leaf() {
                if x < 0 {
                    offset = -offset;
                }
                return offset + x as i64;
            }
            let child = if x >= 0 { x + 1 } else { -(x + 1) } as usize;
            for i in 0..child {
                offset += page.counts(i) as i64;
            }
            page = page.child_page(child).as_ref();
        }
    }

    /// Read-only ranked view of the keys.
    #[must_use]
    pub fn key_list(&self) -> KeyList<'_, K, V> {
        KeyList { map: self }
    }

    // ========================================================================
    //  Scans
    // ========================================================================

    /// Cursor over the latest version, starting at `from` (inclusive).
    #[must_use]
    pub fn cursor(&self, from: Option<&K>) -> Cursor<K, V> {
        self.cursor_range(from, None, false)
    }

    /// Cursor over the latest version with both bounds inclusive; reverse
    /// iterates in descending order.
    #[must_use]
    pub fn cursor_range(&self, from: Option<&K>, to: Option<&K>, reverse: bool) -> Cursor<K, V> {
        let root_ref = self.flush_and_get_root();
        Cursor::new(&root_ref.root, from, to.cloned(), reverse)
    }

    /// Full ascending scan of `(key, value)` pairs.
    #[must_use]
    pub fn iter(&self) -> Cursor<K, V> {
        self.cursor(None)
    }

    /// Ascending key iterator starting at `from`.
    #[must_use]
    pub fn keys_from(&self, from: Option<&K>) -> KeyCursor<K, V> {
        KeyCursor(self.cursor(from))
    }

    /// Descending key iterator starting at `from`.
    #[must_use]
    pub fn keys_reverse(&self, from: Option<&K>) -> KeyCursor<K, V> {
        KeyCursor(self.cursor_range(from, None, true))
    }

    // ========================================================================
    //  Bulk operations
    // ========================================================================

    /// Remove all entries.
    pub fn clear(&self) -> Result<()> {
        let empty = Arc::new(self.create_empty_leaf());
        let mut attempt: u64 = 0;
        loop {
            let mut root_ref = self.flush_and_get_root();
            if root_ref.total_count() == 0 {
                return Ok(());
            }
            let mut locked = root_ref.is_locked_by_current_thread();
            if !locked {
                attempt += 1;
                if attempt == 1 {
                    self.before_write()?;
                }
                if attempt > 3 || root_ref.is_locked() {
                    root_ref = self.lock_root(root_ref, attempt);
                    locked = true;
                }
            }
            let root_page = Arc::clone(&root_ref.root);
            let version = root_ref.version;
            if !locked
                && self
                    .try_update(&root_ref, root_ref.updated(Arc::clone(&empty), attempt))
                    .is_none()
            {
                continue;
            }
            let removed =
                root_page.remove_all_recursive(version, &self.store, self.is_persistent());
            self.store.register_unsaved_memory(removed);
            if locked {
                self.unlock_root(Some(empty), None);
            }
            return Ok(());
        }
    }

    /// Copy all entries of `source` into this map, replacing its content.
    ///
    /// The source version is pinned for the duration so concurrent commits
    /// cannot prune it away; pages are copied children-first and unsaved
    /// memory is registered incrementally, committing when the store asks
    /// for relief.
    pub fn copy_from(&self, source: &MvMap<K, V>) -> Result<()> {
        let usage = self.store.register_version_usage();
        let result: Result<()> = (|| {
            self.before_write()?;
            let copied = self.copy_tree(&source.root_page());
            self.set_initial_root(copied, INITIAL_VERSION);
            Ok(())
        })();
        self.store.deregister_version_usage(&usage);
        result
    }

    fn copy_tree(&self, source: &Arc<Page<K, V>>) -> Arc<Page<K, V>> {
        let keys: Vec<K> = (0..source.key_count())
            .map(|i| source.get_key(i).clone())
            .collect();
        let page = if source.is_leaf() {
            let values: Vec<V> = (0..source.key_count())
                .map(|i| source.get_value(i).clone())
                .collect();
            Page::leaf(
                keys,
                values,
                Arc::clone(&self.key_type),
                Arc::clone(&self.value_type),
            )
        } else {
            let children: Vec<PageRef<K, V>> = (0..source.child_count())
                .map(|i| PageRef::new(self.copy_tree(source.child_page(i))))
                .collect();
            Page::node(
                keys,
                children,
                Arc::clone(&self.key_type),
                Arc::clone(&self.value_type),
            )
        };
        self.store.register_unsaved_memory(page.memory());
        if self.store.is_save_needed() {
            self.store.try_commit();
        }
        Arc::new(page)
    }

    /// Rewrite the page at `pos` by re-putting one of its keys, forcing the
    /// copy-on-write path through it to become unsaved again. Returns true
    /// when the page no longer needs rewriting.
    pub fn rewrite_page(&self, pos: u64) -> Result<bool> {
        let page = self.store.read_page::<K, V>(self.id, pos)?;
        if page.key_count() == 0 {
            return Ok(true);
        }
        debug_assert!(page.is_saved());
        let key = page.get_key(0).clone();
        if self.is_closed() {
            return Ok(false);
        }
        let mut maker = RewriteDecisionMaker::new(page.pos());
        let result = self.operate(key, None, &mut maker)?;
        let rewritten = maker.decision() != Some(Decision::Abort);
        debug_assert!(!rewritten || result.is_some());
        Ok(rewritten)
    }

    // ========================================================================
    //  Versions
    // ========================================================================

    /// The version of the store at the moment this map was last modified.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.get_root().get_version()
    }

    /// Whether the map changed since the given version. On persistent maps
    /// unsaved content counts as a change.
    #[must_use]
    pub fn has_changes_since(&self, version: i64) -> bool {
        self.get_root().has_changes_since(version, self.is_persistent())
    }

    /// Open a read-only snapshot of the map at the last known state of
    /// `version`.
    pub fn open_version(&self, version: i64) -> Result<Arc<Self>> {
        if self.read_only {
            return Err(MvError::ReadOnly { name: self.name() });
        }
        if version < self.create_version {
            return Err(MvError::UnknownVersion { version });
        }
        let mut root_ref = self.flush_and_get_root();
        RootReference::remove_unused_old_versions(&root_ref, self.store.oldest_version_to_keep());
        let mut tail;
        loop {
            tail = root_ref.previous();
            match tail {
                Some(ref previous) if previous.version >= version => {
                    root_ref = Arc::clone(previous);
                }
                _ => break,
            }
        }
        if tail.is_none() && version < self.store.oldest_version_to_keep() {
            return Err(MvError::UnknownVersion { version });
        }
        let snapshot = self.open_read_only(Arc::clone(&root_ref.root), version);
        debug_assert!(snapshot.version() <= version);
        Ok(snapshot)
    }

    /// Roll this map back to the given version, if it existed after the map
    /// was created.
    pub fn rollback_to(&self, version: i64) {
        if version > self.create_version {
            self.rollback_root(version);
        }
    }

    /// Roll the root back to the given version. Returns true on success,
    /// false when the in-memory history did not reach back far enough.
    pub(crate) fn rollback_root(&self, version: i64) -> bool {
        debug_log!(version, "rolling back map root");
        let mut root_ref = self.flush_and_get_root();
        while root_ref.version >= version {
            let Some(previous) = root_ref.previous() else {
                break;
            };
            if self.root.compare_and_set(&root_ref, Arc::clone(&previous)) {
                root_ref = previous;
                self.closed.store(false, STAT);
            } else {
                root_ref = self.flush_and_get_root();
            }
        }
        let rolled_back = root_ref.version < version;
        self.set_write_version(version);
        rolled_back
    }

    /// Install `write_version` on the root reference, pruning versions the
    /// store no longer keeps. Returns `None` when a closed map got old
    /// enough to be deregistered from the store instead.
    pub(crate) fn set_write_version(
        &self,
        write_version: i64,
    ) -> Option<Arc<RootReference<K, V>>> {
        let mut attempt: u64 = 0;
        loop {
            let root_ref = self.flush_and_get_root();
            if root_ref.version >= write_version {
                return Some(root_ref);
            }
            if self.is_closed()
                && root_ref.get_version() + 1 < self.store.oldest_version_to_keep()
            {
                // closed long enough ago that nobody can be using it
                self.store.deregister_map_root(self.id);
                return None;
            }
            attempt += 1;
            let mut current = root_ref;
            let mut locked_here = false;
            if attempt > 3 || current.is_locked() {
                self.lock_root(current, attempt);
                locked_here = true;
                current = self.flush_and_get_root();
            }
            if current.can_update() {
                if let Some(updated) =
                    self.try_update(&current, RootReference::versioned(&current, write_version, attempt))
                {
                    RootReference::remove_unused_old_versions(&updated, self.store.oldest_version_to_keep());
                    return Some(updated);
                }
            }
            if locked_here {
                self.unlock_root(None, None);
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, STAT);
    }

    /// Restore the map from a stored root position, then catch its write
    /// version up with the store.
    pub(crate) fn set_root_pos(&self, root_pos: u64, version: i64) -> Result<()> {
        let root = if root_pos == 0 {
            Arc::new(self.create_empty_leaf())
        } else {
            self.store.read_page::<K, V>(self.id, root_pos)?
        };
        self.set_initial_root(root, version);
        self.set_write_version(self.store.current_version());
        Ok(())
    }

    fn save_page_tree(&self, page: &Arc<Page<K, V>>) {
        if page.is_saved() {
            return;
        }
        if !page.is_leaf() {
            for i in 0..page.child_count() {
                self.save_page_tree(page.child_page(i));
            }
        }
        let saved: Arc<dyn Any + Send + Sync> = page.clone();
        let pos = self.store.save_page(page.is_leaf(), saved);
        page.mark_saved(pos);
    }
}

impl<K, V> MapHandle for MvMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u32 {
        self.id
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn flush_append(&self) {
        let _ = self.flush_and_get_root();
    }

    fn advance_version(&self, version: i64) -> bool {
        self.set_write_version(version).is_some()
    }

    fn rollback_root_to(&self, version: i64) {
        self.rollback_root(version);
    }

    fn save_unsaved(&self) -> u64 {
        if !self.store.has_page_store() || self.is_volatile() {
            return 0;
        }
        let root_ref = self.flush_and_get_root();
        self.save_page_tree(&root_ref.root);
        root_ref.root.pos()
    }

    fn mark_closed(&self) {
        self.closed.store(true, STAT);
    }
}

// ============================================================================
//  Path rebuilding helpers
// ============================================================================

/// Walk the parent chain bottom-up, copying each parent and swapping in the
/// replacement child. Legacy zero-key single-child nodes are skipped.
fn replace_page<K: Clone, V: Clone>(
    mut path: Option<&CursorPos<K, V>>,
    mut replacement: Arc<Page<K, V>>,
    unsaved_memory: &mut i64,
) -> Arc<Page<K, V>> {
    let mut memory = if replacement.is_saved() {
        0
    } else {
        replacement.memory()
    };
    while let Some(frame) = path {
        if frame.page.key_count() > 0 {
            let mut parent = frame.page.copy();
            parent.set_child(frame.index as usize, replacement);
            replacement = Arc::new(parent);
            memory += replacement.memory();
        }
        path = frame.parent_ref();
    }
    *unsaved_memory += memory;
    replacement
}

fn buffer_segment<K: Clone, V: Clone>(
    buffer: &[Option<(K, V)>],
    from: usize,
    to: usize,
) -> (Vec<K>, Vec<V>) {
    let mut keys = Vec::with_capacity(to - from);
    let mut values = Vec::with_capacity(to - from);
    for slot in &buffer[from..to] {
        let (key, value) = slot
            .clone()
            .expect("append buffer slot below the fill mark is empty");
        keys.push(key);
        values.push(value);
    }
    (keys, values)
}

fn min_max<K: Clone, V>(page: &Page<K, V>, key: &K, min: bool, excluding: bool) -> Option<K> {
    let x = page.binary_search(key);
    if page.is_leaf() {
        let x = if x < 0 {
            -x - if min { 2 } else { 1 }
        } else if excluding {
            x + if min { -1 } else { 1 }
        } else {
            x
        };
        if x < 0 || x >= page.key_count() as isize {
            return None;
        }
        return Some(page.get_key(x as usize).clone());
    }
    let mut x = if x >= 0 { x + 1 } else { -(x + 1) };
    loop {
        if x < 0 || x >= page.child_count() as isize {
            return None;
        }
        if let Some(found) = min_max(page.child_page(x as usize), key, min, excluding) {
            return Some(found);
        }
        x += if min { -1 } else { 1 };
    }
}

// ============================================================================
//  KeyList
// ============================================================================

/// Read-only ranked view of a map's keys; `get` and `index_of` are
/// O(log n) over the cached subtree counts.
pub struct KeyList<'a, K, V> {
    map: &'a MvMap<K, V>,
}

impl<K, V> KeyList<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Key at the given rank.
    #[must_use]
    pub fn get(&self, index: i64) -> Option<K> {
        self.map.get_key(index)
    }

    /// Rank of `key`, negative-encoded when absent.
    #[must_use]
    pub fn index_of(&self, key: &K) -> i64 {
        self.map.get_key_index(key)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.map.size_as_long()
    }

    /// Whether the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
//  MapBuilder
// ============================================================================

/// Builder for [`MvMap`]s, handed to
/// [`MvStore::open_map`](crate::store::MvStore::open_map).
pub struct MapBuilder<K, V> {
    pub(crate) key_type: Arc<dyn KeyType<K>>,
    pub(crate) value_type: Arc<dyn ValueType<V>>,
    pub(crate) single_writer: bool,
    pub(crate) map_type: Option<String>,
}

impl<K, V> MapBuilder<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Builder with the natural key order and flat memory estimates.
    #[must_use]
    pub fn new() -> Self {
        Self::with_types(Arc::new(NaturalOrder), Arc::new(PlainSize))
    }
}

impl<K, V> Default for MapBuilder<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MapBuilder<K, V> {
    /// Builder with explicit key and value types.
    #[must_use]
    pub fn with_types(
        key_type: Arc<dyn KeyType<K>>,
        value_type: Arc<dyn ValueType<V>>,
    ) -> Self {
        Self {
            key_type,
            value_type,
            single_writer: false,
            map_type: None,
        }
    }

    /// Replace the key type.
    #[must_use]
    pub fn key_type(mut self, key_type: Arc<dyn KeyType<K>>) -> Self {
        self.key_type = key_type;
        self
    }

    /// Replace the value type.
    #[must_use]
    pub fn value_type(mut self, value_type: Arc<dyn ValueType<V>>) -> Self {
        self.value_type = value_type;
        self
    }

    /// Produce a map usable in append mode by a single thread.
    #[must_use]
    pub fn single_writer(mut self) -> Self {
        self.single_writer = true;
        self
    }

    /// Request a specific map type. This store only produces plain ordered
    /// maps, so anything but the default is rejected at open time.
    #[must_use]
    pub fn map_type(mut self, map_type: impl Into<String>) -> Self {
        self.map_type = Some(map_type.into());
        self
    }
}
