//! The store owning and multiplexing named maps.
//!
//! One process holds one [`MvStore`]; the store hands out
//! [`MvMap`](crate::map::MvMap) handles by name, drives the shared version
//! clock, and collects unsaved-memory feedback from every map. Commit
//! advances the version on all open maps, which is what makes snapshots
//! and rollback line up across maps.
//!
//! Chunk layout, page serialization and file I/O live outside this crate.
//! What the store keeps instead is an in-memory page table: with
//! [`MvStoreBuilder::page_store`] enabled, commit assigns every unsaved
//! page a position and retains it in the table, which gives maps the whole
//! "persistent" behavior surface (reopening from a root position, page
//! rewriting, queued release of replaced pages) without a disk format.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{MvError, Result};
use crate::map::{MapBuilder, MvMap};
use crate::ordering::STAT;
use crate::page::Page;
use crate::tracing_log::debug_log;

/// Default cap on entries per page.
const DEFAULT_KEYS_PER_PAGE: usize = 48;

/// Default byte cap on a page's memory estimate before it splits.
const DEFAULT_MAX_PAGE_SIZE: i64 = 16 * 1024;

/// Default number of versions kept for snapshots and rollback.
const DEFAULT_VERSIONS_TO_KEEP: i64 = 5;

/// Default unsaved-memory level that triggers an automatic commit.
const DEFAULT_AUTOSAVE_MEMORY: i64 = 4 << 20;

// ============================================================================
//  MapHandle - the store's type-erased view of a map
// ============================================================================

/// What the store needs from a map without knowing its key/value types.
pub(crate) trait MapHandle: Send + Sync {
    fn id(&self) -> u32;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    /// Force a full append-buffer flush.
    fn flush_append(&self);
    /// Install the new write version; false means the map deregistered
    /// itself (closed long enough ago).
    fn advance_version(&self, version: i64) -> bool;
    fn rollback_root_to(&self, version: i64);
    /// Save all unsaved pages into the page table; returns the root
    /// position, or 0 when there is nothing to save.
    fn save_unsaved(&self) -> u64;
    fn mark_closed(&self);
}

/// Token pinning the version that was current at registration, so commits
/// cannot prune it while a long-running read (e.g. a bulk copy) uses it.
pub struct VersionUsage {
    version: i64,
}

// ============================================================================
//  Page table
// ============================================================================

struct RemovedPage {
    pos: u64,
    version: i64,
}

/// In-memory stand-in for chunk storage: pages by position, plus the queue
/// of positions that become free once their version falls behind.
struct PageTable {
    pages: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
    next_seq: AtomicU64,
    removed: Mutex<Vec<RemovedPage>>,
}

impl PageTable {
    fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            removed: Mutex::new(Vec::new()),
        }
    }
}

// ============================================================================
//  StoreInner
// ============================================================================

#[derive(Clone)]
struct MapMeta {
    name: String,
    create_version: i64,
    single_writer: bool,
}

#[derive(Default)]
struct Registry {
    names: HashMap<String, u32>,
    metas: HashMap<u32, MapMeta>,
    maps: HashMap<u32, Weak<dyn MapHandle>>,
}

/// Shared store state reachable from every map handle.
pub(crate) struct StoreInner {
    keys_per_page: usize,
    max_page_size: i64,
    autosave_memory: i64,
    versions_to_keep: AtomicI64,
    current_version: AtomicI64,
    oldest_version_to_keep: AtomicI64,
    unsaved_memory: AtomicI64,
    last_map_id: AtomicU32,
    registry: Mutex<Registry>,
    /// Root position of each map at its last save; the reopen path starts
    /// here when a dropped handle is resurrected.
    map_roots: Mutex<HashMap<u32, u64>>,
    page_table: Option<PageTable>,
    version_usages: Mutex<Vec<Arc<VersionUsage>>>,
    commit_lock: Mutex<()>,
    closed: AtomicBool,
}

impl StoreInner {
    pub(crate) fn keys_per_page(&self) -> usize {
        self.keys_per_page
    }

    pub(crate) fn max_page_size(&self) -> i64 {
        self.max_page_size
    }

    pub(crate) fn current_version(&self) -> i64 {
        self.current_version.load(STAT)
    }

    pub(crate) fn oldest_version_to_keep(&self) -> i64 {
        self.oldest_version_to_keep.load(STAT)
    }

    pub(crate) fn has_page_store(&self) -> bool {
        self.page_table.is_some()
    }

    /// Memory-pressure feedback from copy-on-write mutations. The delta is
    /// signed: replacing a never-saved page refunds its estimate.
    pub(crate) fn register_unsaved_memory(&self, delta: i64) {
        self.unsaved_memory.fetch_add(delta, STAT);
    }

    pub(crate) fn is_save_needed(&self) -> bool {
        self.has_page_store() && self.unsaved_memory.load(STAT) > self.autosave_memory
    }

    /// Hook invoked by maps before every mutating operation.
    pub(crate) fn before_write(&self, volatile: bool) {
        if !volatile && self.is_save_needed() {
            self.try_commit();
        }
    }

    pub(crate) fn map_name(&self, id: u32) -> String {
        self.registry
            .lock()
            .metas
            .get(&id)
            .map(|meta| meta.name.clone())
            .unwrap_or_else(|| format!("map{id}"))
    }

    fn live_handles(&self) -> Vec<Arc<dyn MapHandle>> {
        let mut registry = self.registry.lock();
        let mut handles = Vec::with_capacity(registry.maps.len());
        registry.maps.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                handles.push(handle);
                true
            }
            None => false,
        });
        handles
    }

    /// Drop a map from every registry; it cannot be reopened afterwards.
    fn forget_map(&self, id: u32) {
        let mut registry = self.registry.lock();
        if let Some(meta) = registry.metas.remove(&id) {
            registry.names.remove(&meta.name);
        }
        registry.maps.remove(&id);
        drop(registry);
        self.map_roots.lock().remove(&id);
    }

    /// Forget the stored root of a closed map; called by the map itself
    /// once its history is old enough.
    pub(crate) fn deregister_map_root(&self, id: u32) {
        self.map_roots.lock().remove(&id);
    }

    pub(crate) fn account_for_removed_page(&self, pos: u64, version: i64) {
        if let Some(table) = &self.page_table {
            table.removed.lock().push(RemovedPage { pos, version });
        }
    }

    /// Store a page and return its assigned position. The page kind rides
    /// in the low bit (leaf = 0) so rewrite targeting can tell them apart.
    pub(crate) fn save_page(&self, leaf: bool, page: Arc<dyn Any + Send + Sync>) -> u64 {
        let table = self
            .page_table
            .as_ref()
            .expect("save_page requires a configured page store");
        let pos = (table.next_seq.fetch_add(1, STAT) << 1) | u64::from(!leaf);
        table.pages.lock().insert(pos, page);
        pos
    }

    /// Resolve a saved page for the given map.
    pub(crate) fn read_page<K, V>(&self, map_id: u32, pos: u64) -> Result<Arc<Page<K, V>>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let Some(table) = &self.page_table else {
            return Err(MvError::PageNotFound { pos });
        };
        let page = table
            .pages
            .lock()
            .get(&pos)
            .cloned()
            .ok_or(MvError::PageNotFound { pos })?;
        page.downcast::<Page<K, V>>()
            .map_err(|_| MvError::IncompatibleMapType {
                name: self.map_name(map_id),
            })
    }

    pub(crate) fn register_version_usage(&self) -> Arc<VersionUsage> {
        let usage = Arc::new(VersionUsage {
            version: self.current_version(),
        });
        self.version_usages.lock().push(Arc::clone(&usage));
        usage
    }

    pub(crate) fn deregister_version_usage(&self, usage: &Arc<VersionUsage>) {
        let mut usages = self.version_usages.lock();
        if let Some(index) = usages.iter().position(|held| Arc::ptr_eq(held, usage)) {
            usages.swap_remove(index);
        }
    }

    /// Commit unless another thread is already committing.
    pub(crate) fn try_commit(&self) -> Option<i64> {
        let guard = self.commit_lock.try_lock()?;
        Some(self.commit_with(guard))
    }

    pub(crate) fn commit(&self) -> i64 {
        let guard = self.commit_lock.lock();
        self.commit_with(guard)
    }

    fn commit_with(&self, _guard: MutexGuard<'_, ()>) -> i64 {
        let handles = self.live_handles();
        let version = self.current_version.fetch_add(1, STAT) + 1;
        debug_log!(version, maps = handles.len(), "commit");
        for handle in &handles {
            handle.flush_append();
        }
        if self.has_page_store() {
            for handle in &handles {
                let root_pos = handle.save_unsaved();
                if root_pos != 0 {
                    self.map_roots.lock().insert(handle.id(), root_pos);
                }
            }
            self.unsaved_memory.store(0, STAT);
        }
        for handle in &handles {
            if !handle.advance_version(version) {
                self.forget_map(handle.id());
            }
        }
        self.update_oldest_version_to_keep(version);
        self.drop_released_pages();
        version
    }

    fn update_oldest_version_to_keep(&self, current: i64) {
        let keep = self.versions_to_keep.load(STAT);
        let mut oldest = (current - keep + 1).max(0);
        if let Some(pinned) = self
            .version_usages
            .lock()
            .iter()
            .map(|usage| usage.version)
            .min()
        {
            oldest = oldest.min(pinned);
        }
        self.oldest_version_to_keep.store(oldest, STAT);
    }

    /// Release table entries for pages removed at versions nobody can read
    /// any more.
    fn drop_released_pages(&self) {
        let Some(table) = &self.page_table else {
            return;
        };
        let oldest = self.oldest_version_to_keep();
        let mut removed = table.removed.lock();
        let mut pages = table.pages.lock();
        removed.retain(|entry| {
            if entry.version < oldest {
                pages.remove(&entry.pos);
                false
            } else {
                true
            }
        });
    }
}

// ============================================================================
//  MvStore
// ============================================================================

/// Handle to a store of multi-version maps. Cheap to clone.
#[derive(Clone)]
pub struct MvStore {
    inner: Arc<StoreInner>,
}

impl MvStore {
    /// Builder with default settings.
    #[must_use]
    pub fn builder() -> MvStoreBuilder {
        MvStoreBuilder::new()
    }

    /// Open or create the named map.
    ///
    /// Reopening an existing name returns the live handle (the builder's
    /// types must match) or, after the last handle was dropped, restores
    /// the map from its stored root position.
    pub fn open_map<K, V>(&self, name: &str, builder: MapBuilder<K, V>) -> Result<Arc<MvMap<K, V>>>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let inner = &self.inner;
        if inner.closed.load(STAT) {
            return Err(MvError::StoreClosed);
        }
        if builder.map_type.is_some() {
            // this store only produces plain ordered maps
            return Err(MvError::IncompatibleMapType {
                name: name.to_string(),
            });
        }
        let mut registry = inner.registry.lock();
        if let Some(&id) = registry.names.get(name) {
            if let Some(handle) = registry.maps.get(&id).and_then(Weak::upgrade) {
                drop(registry);
                return handle
                    .as_any()
                    .downcast::<MvMap<K, V>>()
                    .map_err(|_| MvError::IncompatibleMapType {
                        name: name.to_string(),
                    });
            }
            let meta = registry
                .metas
                .get(&id)
                .cloned()
                .expect("named map has a meta entry");
            let map = MvMap::new(
                Arc::clone(inner),
                id,
                meta.create_version,
                meta.single_writer,
                builder.key_type,
                builder.value_type,
            );
            let map_dyn: Arc<dyn MapHandle> = map.clone();
            let weak: Weak<dyn MapHandle> = Arc::downgrade(&map_dyn);
            registry.maps.insert(id, weak);
            drop(registry);
            let root_pos = inner.map_roots.lock().get(&id).copied().unwrap_or(0);
            map.set_root_pos(root_pos, inner.current_version() - 1)?;
            return Ok(map);
        }
        let id = inner.last_map_id.fetch_add(1, STAT) + 1;
        let create_version = inner.current_version();
        registry.names.insert(name.to_string(), id);
        registry.metas.insert(
            id,
            MapMeta {
                name: name.to_string(),
                create_version,
                single_writer: builder.single_writer,
            },
        );
        let map = MvMap::new(
            Arc::clone(inner),
            id,
            create_version,
            builder.single_writer,
            builder.key_type,
            builder.value_type,
        );
        let map_dyn: Arc<dyn MapHandle> = map.clone();
        let weak: Weak<dyn MapHandle> = Arc::downgrade(&map_dyn);
        registry.maps.insert(id, weak);
        Ok(map)
    }

    /// Commit: flush append buffers, save pages (when a page store is
    /// configured), advance every open map to the new version, and prune
    /// history nobody can read. Returns the new current version.
    pub fn commit(&self) -> i64 {
        self.inner.commit()
    }

    /// The current store version.
    #[must_use]
    pub fn current_version(&self) -> i64 {
        self.inner.current_version()
    }

    /// The oldest version snapshots may still refer to.
    #[must_use]
    pub fn oldest_version_to_keep(&self) -> i64 {
        self.inner.oldest_version_to_keep()
    }

    /// How many committed versions are retained for snapshots and rollback.
    pub fn set_versions_to_keep(&self, count: i64) {
        self.inner.versions_to_keep.store(count.max(1), STAT);
    }

    /// Roll every open map and the store version back.
    pub fn rollback_to(&self, version: i64) -> Result<()> {
        let inner = &self.inner;
        if version < 0 || version > inner.current_version() {
            return Err(MvError::UnknownVersion { version });
        }
        if version < inner.oldest_version_to_keep() {
            return Err(MvError::UnknownVersion { version });
        }
        let _guard = inner.commit_lock.lock();
        debug_log!(version, "store rollback");
        for handle in inner.live_handles() {
            handle.rollback_root_to(version);
        }
        if let Some(table) = &inner.page_table {
            // removals after the target version are undone by the rollback
            table.removed.lock().retain(|entry| entry.version < version);
        }
        inner.current_version.store(version, STAT);
        Ok(())
    }

    /// Pin the current version against pruning; hand the token back via
    /// [`MvStore::deregister_version_usage`].
    #[must_use]
    pub fn register_version_usage(&self) -> Arc<VersionUsage> {
        self.inner.register_version_usage()
    }

    /// Release a version pin.
    pub fn deregister_version_usage(&self, usage: &Arc<VersionUsage>) {
        self.inner.deregister_version_usage(usage);
    }

    /// Clear a map's content and drop it from the store for good.
    pub fn remove_map<K, V>(&self, map: &Arc<MvMap<K, V>>) -> Result<()>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        map.clear()?;
        map.mark_closed();
        self.inner.forget_map(map.id());
        Ok(())
    }

    /// Close the store and every open map. Reads keep working.
    pub fn close(&self) {
        self.inner.closed.store(true, STAT);
        for handle in self.inner.live_handles() {
            handle.mark_closed();
        }
    }

    /// Whether the store was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(STAT)
    }

    /// Unsaved-memory estimate accumulated since the last save.
    #[must_use]
    pub fn unsaved_memory(&self) -> i64 {
        self.inner.unsaved_memory.load(STAT)
    }
}

// ============================================================================
//  MvStoreBuilder
// ============================================================================

/// Builder for [`MvStore`].
pub struct MvStoreBuilder {
    keys_per_page: usize,
    max_page_size: i64,
    versions_to_keep: i64,
    autosave_memory: i64,
    page_store: bool,
}

impl MvStoreBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys_per_page: DEFAULT_KEYS_PER_PAGE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            versions_to_keep: DEFAULT_VERSIONS_TO_KEEP,
            autosave_memory: DEFAULT_AUTOSAVE_MEMORY,
            page_store: false,
        }
    }

    /// Cap on entries per page; drives the split threshold.
    #[must_use]
    pub fn keys_per_page(mut self, count: usize) -> Self {
        self.keys_per_page = count.clamp(2, usize::from(u16::MAX));
        self
    }

    /// Byte cap on a page's memory estimate; secondary split trigger.
    #[must_use]
    pub fn max_page_size(mut self, bytes: usize) -> Self {
        self.max_page_size = bytes as i64;
        self
    }

    /// How many committed versions to retain.
    #[must_use]
    pub fn versions_to_keep(mut self, count: i64) -> Self {
        self.versions_to_keep = count.max(1);
        self
    }

    /// Unsaved-memory level that triggers an automatic commit.
    #[must_use]
    pub fn autosave_memory(mut self, bytes: usize) -> Self {
        self.autosave_memory = bytes as i64;
        self
    }

    /// Retain saved pages in an in-memory page table, making maps
    /// "persistent": roots survive dropped handles, pages can be rewritten
    /// by position, and replaced pages queue for release by version.
    #[must_use]
    pub fn page_store(mut self) -> Self {
        self.page_store = true;
        self
    }

    /// Open the store.
    #[must_use]
    pub fn open(self) -> MvStore {
        MvStore {
            inner: Arc::new(StoreInner {
                keys_per_page: self.keys_per_page,
                max_page_size: self.max_page_size,
                autosave_memory: self.autosave_memory,
                versions_to_keep: AtomicI64::new(self.versions_to_keep),
                current_version: AtomicI64::new(0),
                oldest_version_to_keep: AtomicI64::new(0),
                unsaved_memory: AtomicI64::new(0),
                last_map_id: AtomicU32::new(0),
                registry: Mutex::new(Registry::default()),
                map_roots: Mutex::new(HashMap::new()),
                page_table: self.page_store.then(PageTable::new),
                version_usages: Mutex::new(Vec::new()),
                commit_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for MvStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
