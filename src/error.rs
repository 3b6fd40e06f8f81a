//! Errors surfaced by maps and the store.
//!
//! Contention and compare-and-set failures are internal and retried; they
//! never show up here. What does show up is misuse (writing to a closed or
//! read-only map, asking for a version nobody retained) and store-level
//! lookup failures.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MvError>;

/// Errors that can occur while operating on a map or its store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MvError {
    /// Write attempted on a map that has been closed.
    Closed {
        /// Name of the map, as registered with the store.
        name: String,
        /// Store-assigned map id.
        id: u32,
    },

    /// Write attempted on a read-only map, e.g. a snapshot from
    /// [`open_version`](crate::map::MvMap::open_version).
    ReadOnly {
        /// Name of the map.
        name: String,
    },

    /// The requested version is older than the map itself or older than
    /// anything still retained by the store.
    UnknownVersion {
        /// The version that was asked for.
        version: i64,
    },

    /// The builder was handed a map type this store cannot produce, or an
    /// existing map was reopened with different key/value types.
    IncompatibleMapType {
        /// Name of the offending map.
        name: String,
    },

    /// No page is stored at the given position.
    PageNotFound {
        /// The position that failed to resolve.
        pos: u64,
    },

    /// Operation attempted on a closed store.
    StoreClosed,
}

impl fmt::Display for MvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { name, id } => {
                write!(f, "map {name}({id}) is closed")
            }

            Self::ReadOnly { name } => {
                write!(f, "map {name} is read-only")
            }

            Self::UnknownVersion { version } => {
                write!(f, "unknown version {version}")
            }

            Self::IncompatibleMapType { name } => {
                write!(f, "incompatible map type for {name}")
            }

            Self::PageNotFound { pos } => {
                write!(f, "no page stored at position {pos:#x}")
            }

            Self::StoreClosed => {
                write!(f, "store is closed")
            }
        }
    }
}

impl std::error::Error for MvError {}
