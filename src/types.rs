//! Injected key ordering and memory estimation.
//!
//! The tree never compares keys itself; every comparison goes through the
//! [`KeyType`] the map was built with. Memory estimates feed the page-size
//! split trigger and the store's unsaved-memory accounting, so they only
//! need to be roughly proportional to real heap cost.

use std::cmp::Ordering;

/// Rough heap cost of one boxed object; used when no better estimate exists.
pub const MEMORY_OBJECT: usize = 24;

/// Cost of one pointer-sized slot.
pub const MEMORY_POINTER: usize = 8;

/// Total order and memory estimate for keys of a map.
pub trait KeyType<K>: Send + Sync {
    /// Compare two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;

    /// Estimated heap cost of one key, in bytes.
    fn memory(&self, key: &K) -> usize {
        let _ = key;
        MEMORY_OBJECT
    }
}

/// Memory estimate for values of a map.
pub trait ValueType<V>: Send + Sync {
    /// Estimated heap cost of one value, in bytes.
    fn memory(&self, value: &V) -> usize {
        let _ = value;
        MEMORY_OBJECT
    }
}

// ============================================================================
//  Built-in implementations
// ============================================================================

/// Orders keys by their [`Ord`] implementation, with the default flat
/// memory estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord + Send + Sync> KeyType<K> for NaturalOrder {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Flat per-value estimate for any value type.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSize;

impl<V: Send + Sync> ValueType<V> for PlainSize {}

/// Length-aware string type: byte order for keys, length-based memory
/// estimates for both keys and values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSize;

impl ValueType<String> for StringSize {
    #[inline]
    fn memory(&self, value: &String) -> usize {
        MEMORY_OBJECT + value.len()
    }
}

/// String keys that both parse as finite decimals compare numerically;
/// every other pair compares byte-wise.
///
/// Useful for maps whose keys are decimal renderings of numbers, where
/// `"100"` must sort after `"99"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalStr;

impl DecimalStr {
    fn as_decimal(s: &str) -> Option<f64> {
        let v: f64 = s.trim().parse().ok()?;
        v.is_finite().then_some(v)
    }
}

impl KeyType<String> for DecimalStr {
    fn compare(&self, a: &String, b: &String) -> Ordering {
        match (Self::as_decimal(a), Self::as_decimal(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(b),
        }
    }

    #[inline]
    fn memory(&self, key: &String) -> usize {
        MEMORY_OBJECT + key.len()
    }
}

impl KeyType<String> for StringSize {
    #[inline]
    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }

    #[inline]
    fn memory(&self, key: &String) -> usize {
        MEMORY_OBJECT + key.len()
    }
}
