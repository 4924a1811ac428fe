//! Sequence number tracking for duplicate detection and cumulative acks.
//!
//! A `SequenceTracker` holds a set of 64-bit sequence numbers as a sorted
//! list of disjoint closed ranges. Ranges that touch or overlap are merged
//! on insert, so a mostly in-order arrival pattern collapses to a single
//! range regardless of how many sequences it covers. Nodes live in an index
//! arena; a hint index remembers the last touched node so that consecutive
//! operations near the same sequence are O(1).

use serde::{Deserialize, Serialize};

use crate::{Result, TransportError};

const NIL: usize = usize::MAX;

/// Arena growth policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Growth {
    /// Arena grows by `grow_by` nodes when exhausted and sheds trailing free
    /// nodes once more than `shrink_by` are idle.
    Growable { grow_by: usize, shrink_by: usize },
    /// Arena is pre-sized and never reallocates. Used when the tracker lives
    /// in memory shared with other processes.
    Fixed(usize),
}

/// Result of a membership query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// No sequence in the range is present.
    No,
    /// Some but not all sequences in the range are present.
    Partial,
    /// Every sequence in the range is present.
    Complete,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    lower: u64,
    upper: u64,
    next: usize,
    prev: usize,
}

/// Set of u64 sequence numbers stored as disjoint closed ranges.
#[derive(Debug)]
pub struct SequenceTracker {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    hint: usize,
    growth: Growth,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::growable()
    }
}

impl SequenceTracker {
    pub fn new(growth: Growth) -> Self {
        let cap = match growth {
            Growth::Growable { grow_by, .. } => grow_by,
            Growth::Fixed(cap) => cap,
        };
        Self {
            nodes: Vec::with_capacity(cap),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            hint: NIL,
            growth,
        }
    }

    pub fn growable() -> Self {
        Self::new(Growth::Growable {
            grow_by: 16,
            shrink_by: 64,
        })
    }

    pub fn fixed(capacity: usize) -> Self {
        Self::new(Growth::Fixed(capacity))
    }

    /// Records the closed range `[lower, upper]`, merging with any ranges it
    /// touches. Sequence 0 is reserved and silently ignored as a lower bound.
    pub fn record(&mut self, lower: u64, upper: u64) -> Result<()> {
        if lower == 0 {
            return Ok(());
        }
        if lower > upper {
            return Err(TransportError::InvalidRange { lower, upper });
        }
        self.insert(lower, upper)?;
        self.maybe_shrink();
        debug_assert!(self.is_well_formed());
        Ok(())
    }

    /// Records a single sequence number.
    pub fn record_seq(&mut self, seq: u64) -> Result<()> {
        self.record(seq, seq)
    }

    /// Removes the closed range `[lower, upper]` from the set, splitting a
    /// range that strictly contains it.
    pub fn erase(&mut self, lower: u64, upper: u64) -> Result<()> {
        if lower == 0 {
            return Ok(());
        }
        if lower > upper {
            return Err(TransportError::InvalidRange { lower, upper });
        }
        let mut cur = self.first_touching(lower);
        while cur != NIL && self.nodes[cur].lower <= upper {
            let n = self.nodes[cur];
            if n.lower >= lower && n.upper <= upper {
                // fully covered, drop the whole node
                let next = n.next;
                self.free_node(cur);
                cur = next;
            } else if n.lower < lower && n.upper > upper {
                // range is strictly inside: split into two
                let right = self.alloc_node(upper + 1, n.upper)?;
                self.nodes[cur].upper = lower - 1;
                self.link_after(cur, right);
                self.hint = cur;
                break;
            } else if n.lower < lower {
                // trim the tail of this node and keep going
                self.nodes[cur].upper = lower - 1;
                cur = self.nodes[cur].next;
            } else {
                // n.upper > upper: trim the head and stop
                self.nodes[cur].lower = upper + 1;
                self.hint = cur;
                break;
            }
        }
        self.maybe_shrink();
        debug_assert!(self.is_well_formed());
        Ok(())
    }

    /// Reports whether `[lower, upper]` is absent, partially present, or
    /// fully present.
    pub fn is_recorded(&self, lower: u64, upper: u64) -> Recorded {
        if lower == 0 || lower > upper {
            return Recorded::No;
        }
        let mut cur = self.first_touching_from(self.start_node(), lower);
        // skip a node that merely adjoins [lower, upper] without overlap
        while cur != NIL && self.nodes[cur].upper < lower {
            cur = self.nodes[cur].next;
        }
        if cur == NIL || self.nodes[cur].lower > upper {
            return Recorded::No;
        }
        let n = &self.nodes[cur];
        if n.lower <= lower && n.upper >= upper {
            Recorded::Complete
        } else {
            Recorded::Partial
        }
    }

    pub fn seq_is_recorded(&self, seq: u64) -> bool {
        self.is_recorded(seq, seq) == Recorded::Complete
    }

    /// Records `[lower, upper]` unless it is already fully present, and
    /// returns its prior membership. The `Complete` return is the duplicate
    /// signal the receive side keys retransmission suppression off.
    pub fn record_if_not_recorded(&mut self, lower: u64, upper: u64) -> Result<Recorded> {
        let prior = self.is_recorded(lower, upper);
        if prior != Recorded::Complete {
            self.record(lower, upper)?;
        }
        Ok(prior)
    }

    /// Largest sequence S such that every sequence in `[1, S]` has been
    /// recorded, or 0 if sequence 1 has not arrived yet.
    pub fn largest_in_order(&self) -> u64 {
        if self.head != NIL && self.nodes[self.head].lower == 1 {
            self.nodes[self.head].upper
        } else {
            0
        }
    }

    /// Number of disjoint ranges currently held.
    pub fn range_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Nodes the arena can hold before it must grow, or ever for a fixed
    /// arena.
    pub fn capacity(&self) -> usize {
        match self.growth {
            Growth::Growable { .. } => self.nodes.capacity(),
            Growth::Fixed(cap) => cap,
        }
    }

    /// Structural invariant check: the list is sorted, ranges are disjoint
    /// and non-adjacent, links are consistent, and the hint points at a live
    /// node. Debug assertions run this after every mutation.
    pub fn is_well_formed(&self) -> bool {
        if self.hint != NIL && (self.hint >= self.nodes.len() || self.free.contains(&self.hint)) {
            return false;
        }
        let mut cur = self.head;
        let mut prev = NIL;
        let mut live = 0;
        let mut last_upper: Option<u64> = None;
        while cur != NIL {
            let n = &self.nodes[cur];
            if n.prev != prev || n.lower > n.upper {
                return false;
            }
            if let Some(u) = last_upper {
                if u == u64::MAX || n.lower <= u + 1 {
                    return false;
                }
            }
            last_upper = Some(n.upper);
            prev = cur;
            live += 1;
            cur = n.next;
        }
        self.tail == prev && live + self.free.len() == self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Snapshot of the stored ranges in ascending order.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::with_capacity(self.range_count());
        let mut cur = self.head;
        while cur != NIL {
            out.push((self.nodes[cur].lower, self.nodes[cur].upper));
            cur = self.nodes[cur].next;
        }
        out
    }

    fn insert(&mut self, lower: u64, upper: u64) -> Result<()> {
        if self.head == NIL {
            let idx = self.alloc_node(lower, upper)?;
            self.head = idx;
            self.tail = idx;
            self.hint = idx;
            return Ok(());
        }
        let cur = self.first_touching(lower);
        if cur == NIL {
            // past everything, append
            let idx = self.alloc_node(lower, upper)?;
            self.link_after(self.tail, idx);
            self.hint = idx;
            return Ok(());
        }
        if upper.saturating_add(1) < self.nodes[cur].lower {
            // strictly before cur with a gap, insert a fresh node
            let idx = self.alloc_node(lower, upper)?;
            self.link_before(cur, idx);
            self.hint = idx;
            return Ok(());
        }
        // merge into cur, then absorb any following ranges the widened node
        // now touches
        self.nodes[cur].lower = self.nodes[cur].lower.min(lower);
        let mut new_upper = self.nodes[cur].upper.max(upper);
        loop {
            let next = self.nodes[cur].next;
            if next == NIL || self.nodes[next].lower > new_upper.saturating_add(1) {
                break;
            }
            new_upper = new_upper.max(self.nodes[next].upper);
            self.free_node(next);
        }
        self.nodes[cur].upper = new_upper;
        self.hint = cur;
        Ok(())
    }

    /// Index of the first node whose range could touch a range starting at
    /// `lower` (node.upper + 1 >= lower), or NIL.
    fn first_touching(&self, lower: u64) -> usize {
        self.first_touching_from(self.start_node(), lower)
    }

    fn first_touching_from(&self, start: usize, lower: u64) -> usize {
        let mut cur = start;
        if cur == NIL {
            return NIL;
        }
        // back up while the previous node could still touch
        loop {
            let prev = self.nodes[cur].prev;
            if prev == NIL || self.nodes[prev].upper.saturating_add(1) < lower {
                break;
            }
            cur = prev;
        }
        self.skip_until_touching(cur, lower)
    }

    fn skip_until_touching(&self, mut cur: usize, lower: u64) -> usize {
        while cur != NIL && self.nodes[cur].upper.saturating_add(1) < lower {
            cur = self.nodes[cur].next;
        }
        cur
    }

    fn start_node(&self) -> usize {
        if self.hint != NIL {
            self.hint
        } else {
            self.head
        }
    }

    fn alloc_node(&mut self, lower: u64, upper: u64) -> Result<usize> {
        let node = Node {
            lower,
            upper,
            next: NIL,
            prev: NIL,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            return Ok(idx);
        }
        match self.growth {
            Growth::Growable { grow_by, .. } => {
                if self.nodes.len() == self.nodes.capacity() {
                    self.nodes.reserve(grow_by);
                }
            }
            Growth::Fixed(cap) => {
                if self.nodes.len() >= cap {
                    return Err(TransportError::OutOfResource {
                        pool: "sequence tracker",
                    });
                }
            }
        }
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    /// Unlinks `idx` and returns it to the free list, repointing head, tail,
    /// and hint as needed.
    fn free_node(&mut self, idx: usize) {
        let Node { next, prev, .. } = self.nodes[idx];
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        if self.hint == idx {
            self.hint = if prev != NIL { prev } else { next };
        }
        self.free.push(idx);
    }

    fn link_after(&mut self, at: usize, idx: usize) {
        let next = self.nodes[at].next;
        self.nodes[idx].prev = at;
        self.nodes[idx].next = next;
        self.nodes[at].next = idx;
        if next != NIL {
            self.nodes[next].prev = idx;
        } else {
            self.tail = idx;
        }
    }

    fn link_before(&mut self, at: usize, idx: usize) {
        let prev = self.nodes[at].prev;
        self.nodes[idx].next = at;
        self.nodes[idx].prev = prev;
        self.nodes[at].prev = idx;
        if prev != NIL {
            self.nodes[prev].next = idx;
        } else {
            self.head = idx;
        }
    }

    /// Sheds trailing free arena slots once enough have accumulated. Runs
    /// only after the mutation that triggered it has fully completed, so no
    /// live index can point at a shed slot.
    fn maybe_shrink(&mut self) {
        let Growth::Growable { shrink_by, .. } = self.growth else {
            return;
        };
        if self.free.len() < shrink_by {
            return;
        }
        self.free.sort_unstable();
        while let Some(&last) = self.free.last() {
            if last + 1 == self.nodes.len() {
                self.free.pop();
                self.nodes.pop();
            } else {
                break;
            }
        }
    }
}
