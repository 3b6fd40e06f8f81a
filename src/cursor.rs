//! Ordered iteration over a root snapshot.
//!
//! A [`Cursor`] captures the root page of a map at construction time and
//! yields `(key, value)` pairs in order, forward or reverse, optionally
//! bounded on both ends (inclusive). Because pages are immutable, the
//! cursor is completely stable under concurrent writers: it sees exactly
//! the entries that were present when it was created.

use std::sync::Arc;

use crate::page::Page;

/// Lazy ordered iterator over one tree snapshot.
pub struct Cursor<K, V> {
    /// Root-to-current path; the top frame is always a leaf.
    stack: Vec<(Arc<Page<K, V>>, isize)>,
    to: Option<K>,
    reverse: bool,
    exhausted: bool,
}

impl<K, V> Cursor<K, V> {
    pub(crate) fn new(
        root: &Arc<Page<K, V>>,
        from: Option<&K>,
        to: Option<K>,
        reverse: bool,
    ) -> Self {
        let mut stack = Vec::new();
        let mut page = Arc::clone(root);
        loop {
            if page.is_leaf() {
                let index: isize = match from {
                    None => {
                        if reverse {
                            page.key_count() as isize - 1
                        } else {
                            0
                        }
                    }
                    Some(key) => {
                        let x = page.binary_search(key);
                        if x >= 0 {
                            x
                        } else if reverse {
                            // start at the floor of `from`
                            -(x + 1) - 1
                        } else {
                            // start at the ceiling of `from`
                            -(x + 1)
                        }
                    }
                };
                stack.push((page, index));
                break;
            }
            let index: isize = match from {
                None => {
                    if reverse {
                        page.child_count() as isize - 1
                    } else {
                        0
                    }
                }
                Some(key) => {
                    let x = page.binary_search(key);
                    if x >= 0 {
                        x + 1
                    } else {
                        -(x + 1)
                    }
                }
            };
            stack.push((Arc::clone(&page), index));
            let child = Arc::clone(page.child_page(index as usize));
            page = child;
        }
        Self {
            stack,
            to,
            reverse,
            exhausted: false,
        }
    }

    /// Descend from `page` to its first leaf in iteration order, pushing
    /// the path onto the stack.
    fn descend(&mut self, mut page: Arc<Page<K, V>>) {
        loop {
            if page.is_leaf() {
                let index = if self.reverse {
                    page.key_count() as isize - 1
                } else {
                    0
                };
                self.stack.push((page, index));
                return;
            }
            let index = if self.reverse {
                page.child_count() as isize - 1
            } else {
                0
            };
            self.stack.push((Arc::clone(&page), index));
            let child = Arc::clone(page.child_page(index as usize));
            page = child;
        }
    }

    /// Pop the finished leaf and move to the next one in iteration order.
    /// Returns false when the tree is exhausted.
    fn advance_leaf(&mut self) -> bool {
        self.stack.pop();
        loop {
            let Some((parent, child_index)) = self.stack.last_mut() else {
                return false;
            };
            let next = *child_index + if self.reverse { -1 } else { 1 };
            if next < 0 || next >= parent.child_count() as isize {
                self.stack.pop();
                continue;
            }
            *child_index = next;
            let child = Arc::clone(parent.child_page(next as usize));
            self.descend(child);
            return true;
        }
    }
}

impl<K: Clone, V: Clone> Iterator for Cursor<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.exhausted {
            return None;
        }
        loop {
            let Some((leaf, index)) = self.stack.last_mut() else {
                self.exhausted = true;
                return None;
            };
            let in_range = if self.reverse {
                *index >= 0
            } else {
                *index < leaf.key_count() as isize
            };
            if !in_range {
                if !self.advance_leaf() {
                    self.exhausted = true;
                    return None;
                }
                continue;
            }
            let i = *index as usize;
            let key = leaf.get_key(i).clone();
            if let Some(to) = &self.to {
                let past = match leaf.compare_keys(&key, to) {
                    std::cmp::Ordering::Greater => !self.reverse,
                    std::cmp::Ordering::Less => self.reverse,
                    std::cmp::Ordering::Equal => false,
                };
                if past {
                    self.exhausted = true;
                    return None;
                }
            }
            let value = leaf.get_value(i).clone();
            *index += if self.reverse { -1 } else { 1 };
            return Some((key, value));
        }
    }
}

/// Key-only view over a [`Cursor`].
pub struct KeyCursor<K, V>(pub(crate) Cursor<K, V>);

impl<K: Clone, V: Clone> Iterator for KeyCursor<K, V> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.0.next().map(|(key, _)| key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageRef;
    use crate::types::{NaturalOrder, PlainSize};

    fn leaf(keys: Vec<u32>) -> Arc<Page<u32, u32>> {
        let values = keys.iter().map(|k| k * 100).collect();
        Arc::new(Page::leaf(
            keys,
            values,
            Arc::new(NaturalOrder),
            Arc::new(PlainSize),
        ))
    }

    fn tree() -> Arc<Page<u32, u32>> {
        // [1 2] [4 5] [7 8 9]
        let children = vec![
            PageRef::new(leaf(vec![1, 2])),
            PageRef::new(leaf(vec![4, 5])),
            PageRef::new(leaf(vec![7, 8, 9])),
        ];
        Arc::new(Page::node(
            vec![4, 7],
            children,
            Arc::new(NaturalOrder),
            Arc::new(PlainSize),
        ))
    }

    fn collect_keys(cursor: Cursor<u32, u32>) -> Vec<u32> {
        cursor.map(|(k, _)| k).collect()
    }

    #[test]
    fn full_forward_scan() {
        let root = tree();
        let keys = collect_keys(Cursor::new(&root, None, None, false));
        assert_eq!(keys, vec![1, 2, 4, 5, 7, 8, 9]);
    }

    #[test]
    fn full_reverse_scan() {
        let root = tree();
        let keys = collect_keys(Cursor::new(&root, None, None, true));
        assert_eq!(keys, vec![9, 8, 7, 5, 4, 2, 1]);
    }

    #[test]
    fn bounded_scan_is_inclusive() {
        let root = tree();
        let keys = collect_keys(Cursor::new(&root, Some(&2), Some(7), false));
        assert_eq!(keys, vec![2, 4, 5, 7]);
    }

    #[test]
    fn from_between_keys_starts_at_ceiling() {
        let root = tree();
        let keys = collect_keys(Cursor::new(&root, Some(&3), None, false));
        assert_eq!(keys, vec![4, 5, 7, 8, 9]);
    }

    #[test]
    fn reverse_from_between_keys_starts_at_floor() {
        let root = tree();
        let keys = collect_keys(Cursor::new(&root, Some(&6), Some(2), true));
        assert_eq!(keys, vec![5, 4, 2]);
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let root = leaf(vec![]);
        assert_eq!(collect_keys(Cursor::new(&root, None, None, false)), vec![]);
        assert_eq!(collect_keys(Cursor::new(&root, Some(&5), None, true)), vec![]);
    }

    #[test]
    fn values_ride_along() {
        let root = tree();
        let pairs: Vec<(u32, u32)> = Cursor::new(&root, Some(&7), None, false).collect();
        assert_eq!(pairs, vec![(7, 700), (8, 800), (9, 900)]);
    }
}
