//! Update strategies consulted at the traversal tip.
//!
//! [`MvMap::operate`](crate::map::MvMap::operate) finds the place an update
//! would land, then asks a [`DecisionMaker`] what to do with it: put,
//! remove, abort, or repeat the whole attempt. The maker may also rewrite
//! the stored value. All the map's point operations are thin wrappers over
//! `operate` with one of the built-in makers below.

use crate::cursor_pos::CursorPos;

/// The decision on what to do on an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the map unchanged and return the existing value.
    Abort,
    /// Delete the existing entry, if any.
    Remove,
    /// Insert or replace the value chosen by `select_value`.
    Put,
    /// Reset the maker and retry the whole operation immediately.
    Repeat,
}

/// Control logic for one `operate` call.
///
/// `decide` runs once the proper place and the possibly existing value for
/// the key are found. On concurrent update failure the operation restarts,
/// so stateful makers get a `reset` call in between.
pub trait DecisionMaker<K, V> {
    /// Choose how to proceed, given the value currently in the map and the
    /// value the caller provided.
    fn decide(&mut self, existing: Option<&V>, provided: Option<&V>) -> Decision;

    /// Position-aware variant consulted by `operate`; the default ignores
    /// the traversal tip.
    fn decide_at(
        &mut self,
        existing: Option<&V>,
        provided: Option<&V>,
        tip: &CursorPos<K, V>,
    ) -> Decision {
        let _ = tip;
        self.decide(existing, provided)
    }

    /// Revise the value to store. Only invoked after `decide` returned
    /// [`Decision::Put`]; must return `Some` in that case.
    fn select_value(&mut self, existing: Option<&V>, provided: Option<V>) -> Option<V> {
        let _ = existing;
        provided
    }

    /// Reset internal state after a concurrent update failure, before the
    /// operation is re-started.
    fn reset(&mut self) {}
}

pub(crate) fn values_equal<V: PartialEq>(a: Option<&V>, b: Option<&V>) -> bool {
    a == b
}

// ============================================================================
//  Built-in makers
// ============================================================================

/// Puts when a value is provided, removes when it is `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PutOrRemove;

impl<K, V> DecisionMaker<K, V> for PutOrRemove {
    fn decide(&mut self, _existing: Option<&V>, provided: Option<&V>) -> Decision {
        if provided.is_none() {
            Decision::Remove
        } else {
            Decision::Put
        }
    }
}

/// Unconditional put.
#[derive(Debug, Default, Clone, Copy)]
pub struct Put;

impl<K, V> DecisionMaker<K, V> for Put {
    fn decide(&mut self, _existing: Option<&V>, _provided: Option<&V>) -> Decision {
        Decision::Put
    }
}

/// Unconditional remove.
#[derive(Debug, Default, Clone, Copy)]
pub struct Remove;

impl<K, V> DecisionMaker<K, V> for Remove {
    fn decide(&mut self, _existing: Option<&V>, _provided: Option<&V>) -> Decision {
        Decision::Remove
    }
}

/// Put only when the key is absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct IfAbsent;

impl<K, V> DecisionMaker<K, V> for IfAbsent {
    fn decide(&mut self, existing: Option<&V>, _provided: Option<&V>) -> Decision {
        if existing.is_none() {
            Decision::Put
        } else {
            Decision::Abort
        }
    }
}

/// Put only when the key is present.
#[derive(Debug, Default, Clone, Copy)]
pub struct IfPresent;

impl<K, V> DecisionMaker<K, V> for IfPresent {
    fn decide(&mut self, existing: Option<&V>, _provided: Option<&V>) -> Decision {
        if existing.is_some() {
            Decision::Put
        } else {
            Decision::Abort
        }
    }
}

/// Proceeds only when the existing value equals an expected one; removes
/// when no replacement is provided. Backs conditional remove/replace.
#[derive(Debug)]
pub struct EqualsDecisionMaker<V> {
    expected: Option<V>,
    decision: Option<Decision>,
}

impl<V: PartialEq> EqualsDecisionMaker<V> {
    pub fn new(expected: Option<V>) -> Self {
        Self {
            expected,
            decision: None,
        }
    }

    /// The decision taken by the last completed attempt.
    #[must_use]
    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }
}

impl<K, V: PartialEq> DecisionMaker<K, V> for EqualsDecisionMaker<V> {
    fn decide(&mut self, existing: Option<&V>, provided: Option<&V>) -> Decision {
        debug_assert!(self.decision.is_none());
        let decision = if !values_equal(self.expected.as_ref(), existing) {
            Decision::Abort
        } else if provided.is_none() {
            Decision::Remove
        } else {
            Decision::Put
        };
        self.decision = Some(decision);
        decision
    }

    fn reset(&mut self) {
        self.decision = None;
    }
}

/// Puts the existing value back, but only when the traversal tip crosses a
/// given page position. Drives page rewriting during compaction: touching
/// one key of a page forces the whole copy-on-write path containing it to
/// be rewritten unsaved.
#[derive(Debug)]
pub struct RewriteDecisionMaker {
    page_pos: u64,
    decision: Option<Decision>,
}

/// Whether a page position refers to a leaf page. The page kind is encoded
/// in the low bit of every nonzero position.
#[inline]
#[must_use]
pub fn is_leaf_position(pos: u64) -> bool {
    pos & 1 == 0
}

impl RewriteDecisionMaker {
    pub fn new(page_pos: u64) -> Self {
        Self {
            page_pos,
            decision: None,
        }
    }

    /// The decision taken by the last completed attempt.
    #[must_use]
    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }

    fn decide_value<V>(&mut self, existing: Option<&V>) -> Decision {
        let decision = if existing.is_none() {
            Decision::Abort
        } else {
            Decision::Put
        };
        self.decision = Some(decision);
        decision
    }
}

impl<K, V: Clone> DecisionMaker<K, V> for RewriteDecisionMaker {
    fn decide(&mut self, existing: Option<&V>, _provided: Option<&V>) -> Decision {
        self.decide_value(existing)
    }

    fn decide_at(
        &mut self,
        existing: Option<&V>,
        _provided: Option<&V>,
        tip: &CursorPos<K, V>,
    ) -> Decision {
        debug_assert!(self.decision.is_none());
        self.decision = Some(Decision::Abort);
        if !is_leaf_position(self.page_pos) {
            let mut frame = tip.parent_ref();
            while let Some(current) = frame {
                if current.page.pos() == self.page_pos {
                    self.decision = None;
                    return self.decide_value(existing);
                }
                frame = current.parent_ref();
            }
        } else if tip.page.pos() == self.page_pos {
            self.decision = None;
            return self.decide_value(existing);
        }
        Decision::Abort
    }

    fn select_value(&mut self, existing: Option<&V>, _provided: Option<V>) -> Option<V> {
        existing.cloned()
    }

    fn reset(&mut self) {
        self.decision = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_or_remove_follows_provided() {
        let mut maker = PutOrRemove;
        let d: Decision = DecisionMaker::<u32, u32>::decide(&mut maker, None, Some(&1));
        assert_eq!(d, Decision::Put);
        let d: Decision = DecisionMaker::<u32, u32>::decide(&mut maker, Some(&2), None);
        assert_eq!(d, Decision::Remove);
    }

    #[test]
    fn if_absent_aborts_on_existing() {
        let mut maker = IfAbsent;
        let d: Decision = DecisionMaker::<u32, u32>::decide(&mut maker, Some(&1), Some(&2));
        assert_eq!(d, Decision::Abort);
        let d: Decision = DecisionMaker::<u32, u32>::decide(&mut maker, None, Some(&2));
        assert_eq!(d, Decision::Put);
    }

    #[test]
    fn equals_maker_records_decision() {
        let mut maker = EqualsDecisionMaker::new(Some(5u32));
        let d = DecisionMaker::<u32, u32>::decide(&mut maker, Some(&4), Some(&9));
        assert_eq!(d, Decision::Abort);
        assert_eq!(maker.decision(), Some(Decision::Abort));
        DecisionMaker::<u32, u32>::reset(&mut maker);
        let d = DecisionMaker::<u32, u32>::decide(&mut maker, Some(&5), Some(&9));
        assert_eq!(d, Decision::Put);
        DecisionMaker::<u32, u32>::reset(&mut maker);
        let d = DecisionMaker::<u32, u32>::decide(&mut maker, Some(&5), None);
        assert_eq!(d, Decision::Remove);
    }

    #[test]
    fn leaf_position_bit() {
        assert!(is_leaf_position(0b10));
        assert!(!is_leaf_position(0b11));
    }
}
