//! # mvtree
//!
//! Multi-version concurrent ordered key-value maps over a copy-on-write
//! B+tree.
//!
//! One [`MvStore`] multiplexes any number of named [`MvMap`]s. Each map is
//! an ordered map with point and range lookups, ranked access, atomic
//! update primitives, snapshot reads and rollback to earlier versions.
//!
//! ## Design
//!
//! - Pages are immutable once published. A mutation rebuilds the affected
//!   root-to-leaf path on private copies and publishes the new tree with a
//!   single compare-and-set of the map's [`RootReference`].
//! - Readers never block and never retry: whatever root they load is a
//!   complete, consistent tree.
//! - The writer lock is logical, embedded in the root reference itself
//!   (hold count + owning thread), and is only taken under contention or
//!   for append-buffer maintenance.
//! - Versions advance on store commit; old roots stay chained off the
//!   current one until pruned, which is what snapshots and rollback walk.
//!
//! ## Example
//!
//! ```
//! use mvtree::{MapBuilder, MvStore};
//!
//! let store = MvStore::builder().open();
//! let map = store.open_map::<String, String>("events", MapBuilder::new()).unwrap();
//!
//! map.put("a".into(), "1".into()).unwrap();
//! map.put("b".into(), "2".into()).unwrap();
//! assert_eq!(map.get(&"a".into()), Some("1".into()));
//!
//! let before = store.current_version();
//! store.commit();
//! map.put("a".into(), "overwritten".into()).unwrap();
//!
//! // snapshots see the state their version had
//! let snapshot = map.open_version(before).unwrap();
//! assert_eq!(snapshot.get(&"a".into()), Some("1".into()));
//! ```

pub mod cursor;
pub mod cursor_pos;
pub mod decision;
pub mod error;
pub mod map;
pub mod ordering;
pub mod page;
pub mod root;
pub mod store;
mod tracing_log;
pub mod types;

pub use cursor::{Cursor, KeyCursor};
pub use cursor_pos::CursorPos;
pub use decision::{Decision, DecisionMaker};
pub use error::{MvError, Result};
pub use map::{KeyList, MapBuilder, MvMap, INITIAL_VERSION};
pub use page::Page;
pub use root::RootReference;
pub use store::{MvStore, MvStoreBuilder, VersionUsage};
pub use types::{DecimalStr, KeyType, NaturalOrder, PlainSize, StringSize, ValueType};
