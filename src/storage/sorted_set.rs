//! Sorted Set
//!
//! Pairs a span-tracking skiplist with a member→score map. The map gives
//! O(1) score lookups and membership checks; the skiplist gives ordered
//! traversal, ranks, and range operations. Invariant: a member is in the
//! map exactly when a node with the same score is in the skiplist.

use std::collections::HashMap;

use crate::storage::border::Border;
use crate::storage::glob::GlobPattern;
use crate::storage::skiplist::{Element, Skiplist};

/// Shortest round-trip decimal form of a score, the form replies and the
/// command log use.
pub fn format_score(score: f64) -> String {
    if score == score.trunc() && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

#[derive(Debug, Default)]
pub struct SortedSet {
    skiplist: Skiplist,
    dict: HashMap<String, f64>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self {
            skiplist: Skiplist::new(),
            dict: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn get(&self, member: &str) -> Option<Element> {
        self.dict.get(member).map(|&score| Element {
            member: member.to_string(),
            score,
        })
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.dict.get(member).copied()
    }

    /// Inserts or updates a member. Returns true when the member is new.
    /// A score change re-inserts the skiplist node; mutating it in place
    /// would break the (score, member) ordering.
    pub fn add(&mut self, member: &str, score: f64) -> bool {
        match self.dict.insert(member.to_string(), score) {
            Some(old_score) => {
                if old_score != score {
                    self.skiplist.remove(old_score, member);
                    self.skiplist.insert(score, member.to_string());
                }
                false
            }
            None => {
                self.skiplist.insert(score, member.to_string());
                true
            }
        }
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.dict.remove(member) {
            Some(score) => {
                self.skiplist.remove(score, member);
                true
            }
            None => false,
        }
    }

    /// 0-based rank, or -1 when the member is absent. Descending rank is
    /// counted from the high end.
    pub fn rank(&self, member: &str, desc: bool) -> i64 {
        let Some(&score) = self.dict.get(member) else {
            return -1;
        };
        let r = self.skiplist.rank(member, score) as i64;
        if desc {
            self.skiplist.len() as i64 - r
        } else {
            r - 1
        }
    }

    /// Element at a 0-based rank in the requested direction.
    pub fn by_rank(&self, rank: u64, desc: bool) -> Option<Element> {
        if rank >= self.skiplist.len() {
            return None;
        }
        let target = if desc {
            self.skiplist.len() - rank
        } else {
            rank + 1
        };
        self.skiplist.get_by_rank(target).cloned()
    }

    /// Walks ranks `[start, stop)` (0-based) in the requested direction.
    /// Returning `false` from the consumer stops the walk.
    pub fn for_each_by_rank(
        &self,
        start: u64,
        stop: u64,
        desc: bool,
        mut consumer: impl FnMut(&Element) -> bool,
    ) {
        let size = self.skiplist.len();
        let start = start.min(size);
        let stop = stop.min(size);
        if start >= stop {
            return;
        }

        let mut node = if desc {
            if start > 0 {
                self.skiplist.node_by_rank(size - start)
            } else {
                self.skiplist.tail()
            }
        } else if start > 0 {
            self.skiplist.node_by_rank(start + 1)
        } else {
            self.skiplist.first()
        };

        for _ in start..stop {
            let Some(idx) = node else { return };
            if !consumer(self.skiplist.element(idx)) {
                return;
            }
            node = if desc {
                self.skiplist.backward(idx)
            } else {
                self.skiplist.forward(idx)
            };
        }
    }

    pub fn range_by_rank(&self, start: u64, stop: u64, desc: bool) -> Vec<Element> {
        let mut slice = Vec::with_capacity(stop.saturating_sub(start) as usize);
        self.for_each_by_rank(start, stop, desc, |element| {
            slice.push(element.clone());
            true
        });
        slice
    }

    /// Number of elements inside `[min, max]`.
    pub fn range_count(&self, min: &Border, max: &Border) -> usize {
        let mut count = 0;
        self.for_each_by_rank(0, self.skiplist.len(), false, |element| {
            if !min.less(element) {
                return true;
            }
            if !max.greater(element) {
                return false;
            }
            count += 1;
            true
        });
        count
    }

    /// Walks `[min, max]` in the requested direction, skipping `offset`
    /// elements; a negative `limit` means no limit.
    pub fn for_each_in_range(
        &self,
        min: &Border,
        max: &Border,
        offset: i64,
        limit: i64,
        desc: bool,
        mut consumer: impl FnMut(&Element) -> bool,
    ) {
        let mut node = if desc {
            self.skiplist.last_in_range(min, max)
        } else {
            self.skiplist.first_in_range(min, max)
        };

        let mut to_skip = offset;
        while node.is_some() && to_skip > 0 {
            let idx = node.expect("checked above");
            node = if desc {
                self.skiplist.backward(idx)
            } else {
                self.skiplist.forward(idx)
            };
            to_skip -= 1;
        }

        let mut emitted = 0i64;
        while let Some(idx) = node {
            if limit >= 0 && emitted >= limit {
                break;
            }
            if !consumer(self.skiplist.element(idx)) {
                break;
            }
            emitted += 1;
            node = if desc {
                self.skiplist.backward(idx)
            } else {
                self.skiplist.forward(idx)
            };
            if let Some(next) = node {
                let element = self.skiplist.element(next);
                if !min.less(element) || !max.greater(element) {
                    break;
                }
            }
        }
    }

    /// Elements inside `[min, max]` after `offset`, capped by `limit`
    /// (negative = unlimited).
    pub fn range(&self, min: &Border, max: &Border, offset: i64, limit: i64, desc: bool) -> Vec<Element> {
        if offset < 0 {
            return Vec::new();
        }
        let mut slice = Vec::new();
        self.for_each_in_range(min, max, offset, limit, desc, |element| {
            slice.push(element.clone());
            true
        });
        slice
    }

    /// Removes every element inside `[min, max]`; returns how many.
    pub fn remove_range(&mut self, min: &Border, max: &Border) -> usize {
        let removed = self.skiplist.remove_range(min, max, 0);
        for element in &removed {
            self.dict.remove(&element.member);
        }
        removed.len()
    }

    /// Removes ranks `[start, stop)` (0-based); returns how many.
    pub fn remove_by_rank(&mut self, start: u64, stop: u64) -> usize {
        let removed = self.skiplist.remove_range_by_rank(start + 1, stop + 1);
        for element in &removed {
            self.dict.remove(&element.member);
        }
        removed.len()
    }

    /// Removes and returns up to `count` elements with the lowest score.
    pub fn pop_min(&mut self, count: usize) -> Vec<Element> {
        let Some(first) = self
            .skiplist
            .first_in_range(&Border::SCORE_NEG_INF, &Border::SCORE_POS_INF)
        else {
            return Vec::new();
        };
        let min = Border::score(self.skiplist.element(first).score, false);
        let removed = self.skiplist.remove_range(&min, &Border::SCORE_POS_INF, count);
        for element in &removed {
            self.dict.remove(&element.member);
        }
        removed
    }

    /// Member/score pairs for members matching the pattern. The whole set
    /// is returned in one page; the result cursor is always 0.
    pub fn scan(&self, _cursor: usize, _count: usize, pattern: &GlobPattern) -> (Vec<Vec<u8>>, usize) {
        let mut result = Vec::new();
        for (member, &score) in &self.dict {
            if pattern.is_match_all() || pattern.matches(member.as_bytes()) {
                result.push(member.clone().into_bytes());
                result.push(format_score(score).into_bytes());
            }
        }
        (result, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::border::parse_score_border;

    fn abc() -> SortedSet {
        let mut set = SortedSet::new();
        set.add("a", 1.0);
        set.add("b", 2.0);
        set.add("c", 3.0);
        set
    }

    #[test]
    fn test_add_and_update() {
        let mut set = SortedSet::new();
        assert!(set.add("a", 1.0));
        assert!(!set.add("a", 5.0));
        assert_eq!(set.len(), 1);
        assert_eq!(set.score("a"), Some(5.0));
        // the skiplist node moved with the score
        assert_eq!(set.by_rank(0, false).unwrap().score, 5.0);
    }

    #[test]
    fn test_map_and_skiplist_stay_coherent() {
        let mut set = abc();
        assert!(set.remove("b"));
        assert!(!set.remove("b"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.rank("c", false), 1);
        for element in set.range_by_rank(0, set.len() as u64, false) {
            assert_eq!(set.score(&element.member), Some(element.score));
        }
    }

    #[test]
    fn test_rank_directions() {
        let set = abc();
        assert_eq!(set.rank("a", false), 0);
        assert_eq!(set.rank("c", false), 2);
        assert_eq!(set.rank("a", true), 2);
        assert_eq!(set.rank("c", true), 0);
        assert_eq!(set.rank("missing", false), -1);
    }

    #[test]
    fn test_by_rank() {
        let set = abc();
        assert_eq!(set.by_rank(0, false).unwrap().member, "a");
        assert_eq!(set.by_rank(2, false).unwrap().member, "c");
        assert_eq!(set.by_rank(0, true).unwrap().member, "c");
        assert!(set.by_rank(3, false).is_none());
    }

    #[test]
    fn test_range_by_rank_desc() {
        let set = abc();
        let descending = set.range_by_rank(0, 3, true);
        let members: Vec<_> = descending.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_score_range_with_offset_and_limit() {
        let mut set = abc();
        set.add("d", 4.0);
        set.add("e", 5.0);

        let min = parse_score_border("2").unwrap();
        let max = parse_score_border("+inf").unwrap();

        let all = set.range(&min, &max, 0, -1, false);
        assert_eq!(all.len(), 4);

        let paged = set.range(&min, &max, 1, 2, false);
        let members: Vec<_> = paged.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["c", "d"]);

        let reverse = set.range(&min, &max, 0, 2, true);
        let members: Vec<_> = reverse.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["e", "d"]);
    }

    #[test]
    fn test_range_count() {
        let set = abc();
        let min = parse_score_border("(1").unwrap();
        let max = parse_score_border("3").unwrap();
        assert_eq!(set.range_count(&min, &max), 2);
        assert_eq!(set.range_count(&Border::SCORE_NEG_INF, &Border::SCORE_POS_INF), 3);
    }

    #[test]
    fn test_remove_range() {
        let mut set = abc();
        let min = parse_score_border("2").unwrap();
        let max = parse_score_border("3").unwrap();
        assert_eq!(set.remove_range(&min, &max), 2);
        assert_eq!(set.len(), 1);
        assert!(set.score("b").is_none());
        assert!(set.score("c").is_none());
    }

    #[test]
    fn test_remove_by_rank() {
        let mut set = abc();
        assert_eq!(set.remove_by_rank(0, 2), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(set.by_rank(0, false).unwrap().member, "c");
    }

    #[test]
    fn test_pop_min() {
        let mut set = abc();
        let popped = set.pop_min(2);
        let members: Vec<_> = popped.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["a", "b"]);
        assert_eq!(set.len(), 1);
        assert!(set.pop_min(5).len() == 1);
        assert!(set.pop_min(1).is_empty());
    }

    #[test]
    fn test_scan_filters_by_pattern() {
        let mut set = SortedSet::new();
        set.add("user:1", 1.0);
        set.add("user:2", 2.0);
        set.add("other", 3.0);
        let (pairs, cursor) = set.scan(0, 10, &GlobPattern::new("user:*"));
        assert_eq!(cursor, 0);
        assert_eq!(pairs.len(), 4);
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(1.0), "1");
        assert_eq!(format_score(-3.0), "-3");
        assert_eq!(format_score(2.5), "2.5");
    }
}
