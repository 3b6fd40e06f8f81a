//! Standard memory orderings for shared map state.
//!
//! These constants keep ordering usage consistent across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for loading the published root reference.
/// Pairs with the publisher's `CAS_SUCCESS`.
pub const ROOT_READ: Ordering = Ordering::Acquire;

/// Ordering for a successful root compare-and-set.
/// Publishes the whole copy-on-write subtree hanging off the new root.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for a failed compare-and-set.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for publishing a page position once the page is saved.
pub const POS_WRITE: Ordering = Ordering::Release;

/// Ordering for reading a page position.
pub const POS_READ: Ordering = Ordering::Acquire;

/// Ordering for flags, counters and search hints that carry no data
/// dependencies (closed/volatile flags, binary-search guesses, statistics).
pub const STAT: Ordering = Ordering::Relaxed;
