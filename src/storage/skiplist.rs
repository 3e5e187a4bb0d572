//! Span-Tracking Skiplist
//!
//! Probabilistic ordered structure backing the sorted set. Nodes are kept
//! in a slab (`Vec` + free list) and linked by index, which keeps the
//! whole structure in safe code; the level-0 chain is doubly linked via a
//! single backward index per node.
//!
//! Every forward link carries a `span`: the number of level-0 nodes it
//! skips. Summing spans along any search path from the header yields the
//! 1-based rank of the node reached, which is what makes rank queries and
//! rank-range removals O(log n).
//!
//! Ordering key is `(score, member)` with a lexicographic member tiebreak.

use rand::Rng;

use crate::storage::border::Border;

pub const MAX_LEVEL: usize = 16;

/// A sorted-set element: member name plus its ordering weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub member: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
struct Level {
    forward: Option<usize>,
    // Distance to `forward` in level-0 hops. Only meaningful while
    // `forward` is set; kept signed so stale links never underflow.
    span: i64,
}

#[derive(Debug)]
struct Node {
    element: Element,
    backward: Option<usize>,
    levels: Vec<Level>,
}

impl Node {
    fn new(height: usize, score: f64, member: String) -> Self {
        Self {
            element: Element { member, score },
            backward: None,
            levels: vec![Level { forward: None, span: 0 }; height],
        }
    }
}

/// Geometric level draw in `1..=MAX_LEVEL`.
fn random_level() -> usize {
    let total = (1u64 << MAX_LEVEL) - 1;
    let k = rand::thread_rng().gen::<u64>() % total;
    let bits = 64 - (k + 1).leading_zeros() as usize;
    MAX_LEVEL - bits + 1
}

#[derive(Debug)]
pub struct Skiplist {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    tail: Option<usize>,
    length: u64,
    level: usize,
}

const HEADER: usize = 0;

impl Skiplist {
    pub fn new() -> Self {
        let header = Node::new(MAX_LEVEL, 0.0, String::new());
        Self {
            nodes: vec![Some(header)],
            free: Vec::new(),
            tail: None,
            length: 0,
            level: 1,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("live skiplist node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("live skiplist node")
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    pub(crate) fn element(&self, idx: usize) -> &Element {
        &self.node(idx).element
    }

    pub(crate) fn first(&self) -> Option<usize> {
        self.node(HEADER).levels[0].forward
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub(crate) fn forward(&self, idx: usize) -> Option<usize> {
        self.node(idx).levels[0].forward
    }

    pub(crate) fn backward(&self, idx: usize) -> Option<usize> {
        self.node(idx).backward
    }

    /// True when `(score, member)` of the forward node at `(node, lv)`
    /// orders strictly before the probe key.
    fn forward_precedes(&self, node: usize, lv: usize, score: f64, member: &str) -> Option<usize> {
        let fwd = self.node(node).levels[lv].forward?;
        let e = &self.node(fwd).element;
        if e.score < score || (e.score == score && e.member.as_str() < member) {
            Some(fwd)
        } else {
            None
        }
    }

    /// Inserts a new `(score, member)` node. The caller must ensure the
    /// member is not already present (the sorted set wrapper does).
    pub fn insert(&mut self, score: f64, member: String) -> usize {
        let mut update = [HEADER; MAX_LEVEL];
        let mut rank = [0i64; MAX_LEVEL];

        let mut node = HEADER;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(fwd) = self.forward_precedes(node, i, score, &member) {
                rank[i] += self.node(node).levels[i].span;
                node = fwd;
            }
            update[i] = node;
        }

        let height = random_level();
        if height > self.level {
            for i in self.level..height {
                rank[i] = 0;
                update[i] = HEADER;
                self.node_mut(HEADER).levels[i].span = self.length as i64;
            }
            self.level = height;
        }

        let new_idx = self.alloc(Node::new(height, score, member));
        for i in 0..height {
            let prev = update[i];
            let prev_level = self.node(prev).levels[i];
            self.node_mut(new_idx).levels[i] = Level {
                forward: prev_level.forward,
                span: prev_level.span - (rank[0] - rank[i]),
            };
            let prev_mut = self.node_mut(prev);
            prev_mut.levels[i].forward = Some(new_idx);
            prev_mut.levels[i].span = (rank[0] - rank[i]) + 1;
        }
        for i in height..self.level {
            self.node_mut(update[i]).levels[i].span += 1;
        }

        self.node_mut(new_idx).backward = if update[0] == HEADER { None } else { Some(update[0]) };
        if let Some(next) = self.node(new_idx).levels[0].forward {
            self.node_mut(next).backward = Some(new_idx);
        } else {
            self.tail = Some(new_idx);
        }

        self.length += 1;
        new_idx
    }

    /// Unlinks `node_idx` given the per-level predecessors in `update`.
    fn remove_node(&mut self, node_idx: usize, update: &[usize; MAX_LEVEL]) {
        for i in 0..self.level {
            let prev = update[i];
            if self.node(prev).levels[i].forward == Some(node_idx) {
                let removed_level = self.node(node_idx).levels[i];
                let prev_mut = self.node_mut(prev);
                prev_mut.levels[i].span += removed_level.span - 1;
                prev_mut.levels[i].forward = removed_level.forward;
            } else {
                self.node_mut(prev).levels[i].span -= 1;
            }
        }

        let backward = self.node(node_idx).backward;
        if let Some(next) = self.node(node_idx).levels[0].forward {
            self.node_mut(next).backward = backward;
        } else {
            self.tail = backward;
        }

        while self.level > 1 && self.node(HEADER).levels[self.level - 1].forward.is_none() {
            self.level -= 1;
        }
        self.length -= 1;
        self.release(node_idx);
    }

    /// Removes the node matching `(score, member)` exactly.
    pub fn remove(&mut self, score: f64, member: &str) -> bool {
        let mut update = [HEADER; MAX_LEVEL];
        let mut node = HEADER;
        for i in (0..self.level).rev() {
            while let Some(fwd) = self.forward_precedes(node, i, score, member) {
                node = fwd;
            }
            update[i] = node;
        }
        match self.node(node).levels[0].forward {
            Some(target)
                if self.node(target).element.score == score
                    && self.node(target).element.member == member =>
            {
                self.remove_node(target, &update);
                true
            }
            _ => false,
        }
    }

    /// 1-based rank of `(member, score)`, 0 when absent.
    pub fn rank(&self, member: &str, score: f64) -> u64 {
        let mut rank = 0i64;
        let mut node = HEADER;
        for i in (0..self.level).rev() {
            loop {
                let Some(fwd) = self.node(node).levels[i].forward else { break };
                let e = &self.node(fwd).element;
                if e.score < score || (e.score == score && e.member.as_str() <= member) {
                    rank += self.node(node).levels[i].span;
                    node = fwd;
                } else {
                    break;
                }
            }
            if node != HEADER && self.node(node).element.member == member {
                return rank as u64;
            }
        }
        0
    }

    /// Node with the given 1-based rank.
    pub(crate) fn node_by_rank(&self, target: u64) -> Option<usize> {
        if target == 0 || target > self.length {
            return None;
        }
        let target = target as i64;
        let mut traversed = 0i64;
        let mut node = HEADER;
        for i in (0..self.level).rev() {
            while let Some(fwd) = self.node(node).levels[i].forward {
                if traversed + self.node(node).levels[i].span > target {
                    break;
                }
                traversed += self.node(node).levels[i].span;
                node = fwd;
            }
            if traversed == target {
                return Some(node);
            }
        }
        None
    }

    pub fn get_by_rank(&self, rank: u64) -> Option<&Element> {
        self.node_by_rank(rank).map(|idx| self.element(idx))
    }

    /// Whether any element falls inside `[min, max]`.
    pub fn has_in_range(&self, min: &Border, max: &Border) -> bool {
        if min.is_intersected(max) {
            return false;
        }
        match self.tail {
            Some(tail) if min.less(self.element(tail)) => {}
            _ => return false,
        }
        match self.first() {
            Some(first) if max.greater(self.element(first)) => {}
            _ => return false,
        }
        true
    }

    /// First node inside the range, walking top-down past everything
    /// below `min`.
    pub(crate) fn first_in_range(&self, min: &Border, max: &Border) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut node = HEADER;
        for i in (0..self.level).rev() {
            while let Some(fwd) = self.node(node).levels[i].forward {
                if min.less(self.element(fwd)) {
                    break;
                }
                node = fwd;
            }
        }
        let candidate = self.node(node).levels[0].forward?;
        if !max.greater(self.element(candidate)) {
            return None;
        }
        Some(candidate)
    }

    /// Last node inside the range, walking top-down past everything
    /// below `max`.
    pub(crate) fn last_in_range(&self, min: &Border, max: &Border) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut node = HEADER;
        for i in (0..self.level).rev() {
            while let Some(fwd) = self.node(node).levels[i].forward {
                if !max.greater(self.element(fwd)) {
                    break;
                }
                node = fwd;
            }
        }
        if node == HEADER || !min.less(self.element(node)) {
            return None;
        }
        Some(node)
    }

    /// Removes elements inside `[min, max]`, up to `limit` when non-zero.
    /// Returns the removed elements in ascending order.
    pub fn remove_range(&mut self, min: &Border, max: &Border, limit: usize) -> Vec<Element> {
        let mut update = [HEADER; MAX_LEVEL];
        let mut removed = Vec::new();

        let mut node = HEADER;
        for i in (0..self.level).rev() {
            while let Some(fwd) = self.node(node).levels[i].forward {
                if min.less(self.element(fwd)) {
                    break;
                }
                node = fwd;
            }
            update[i] = node;
        }

        let mut current = self.node(node).levels[0].forward;
        while let Some(idx) = current {
            if !max.greater(self.element(idx)) {
                break;
            }
            let next = self.node(idx).levels[0].forward;
            removed.push(self.element(idx).clone());
            self.remove_node(idx, &update);
            if limit > 0 && removed.len() == limit {
                break;
            }
            current = next;
        }
        removed
    }

    /// Removes ranks in `[start, stop)`, both 1-based.
    pub fn remove_range_by_rank(&mut self, start: u64, stop: u64) -> Vec<Element> {
        let (start, stop) = (start as i64, stop as i64);
        let mut update = [HEADER; MAX_LEVEL];
        let mut removed = Vec::new();
        let mut traversed = 0i64;

        let mut node = HEADER;
        for i in (0..self.level).rev() {
            while let Some(fwd) = self.node(node).levels[i].forward {
                if traversed + self.node(node).levels[i].span >= start {
                    break;
                }
                traversed += self.node(node).levels[i].span;
                node = fwd;
            }
            update[i] = node;
        }

        traversed += 1;
        let mut current = self.node(node).levels[0].forward;
        while let Some(idx) = current {
            if traversed >= stop {
                break;
            }
            let next = self.node(idx).levels[0].forward;
            removed.push(self.element(idx).clone());
            self.remove_node(idx, &update);
            current = next;
            traversed += 1;
        }
        removed
    }
}

impl Default for Skiplist {
    fn default() -> Self {
        Self::new()
    }
}
