//! Credit accounting for remote receive buffers.
//!
//! A sender may only target a remote buffer it holds a credit for. Credits
//! arrive in memory-request acks, are spent when a fragment is addressed at
//! the buffer, and flow back to the owner in memory-release sweeps once the
//! receiver recycles them.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Receive buffer size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BufType {
    Small = 0,
    Large = 1,
}

pub const NUM_BUF_TYPES: usize = 2;

impl BufType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BufType::Small),
            1 => Some(BufType::Large),
            _ => None,
        }
    }

    /// Smallest class whose buffers hold `len` payload bytes, given the two
    /// class capacities.
    pub fn for_len(len: usize, small_bytes: usize) -> Self {
        if len <= small_bytes {
            BufType::Small
        } else {
            BufType::Large
        }
    }
}

/// A credit for one remote receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBuf {
    pub id: u32,
    pub bytes: u32,
}

/// Per-destination credits held by the send side of one rail.
///
/// Credits are spent newest-first so a hot peer keeps reusing the same few
/// buffers; the release sweep drains oldest-first so idle credits go home.
#[derive(Debug, Default)]
pub struct CreditLedger {
    credits: HashMap<u32, [VecDeque<RemoteBuf>; NUM_BUF_TYPES]>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dest: u32, buf_type: BufType, buf: RemoteBuf) {
        self.credits.entry(dest).or_default()[buf_type as usize].push_back(buf);
    }

    /// Spends the most recently granted credit.
    pub fn pop(&mut self, dest: u32, buf_type: BufType) -> Option<RemoteBuf> {
        self.credits.get_mut(&dest)?[buf_type as usize].pop_back()
    }

    /// Takes up to `max` of the oldest credits for the release sweep.
    pub fn pop_lru(&mut self, dest: u32, buf_type: BufType, max: usize) -> Vec<RemoteBuf> {
        let Some(queues) = self.credits.get_mut(&dest) else {
            return Vec::new();
        };
        let queue = &mut queues[buf_type as usize];
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    pub fn count(&self, dest: u32, buf_type: BufType) -> usize {
        self.credits
            .get(&dest)
            .map_or(0, |q| q[buf_type as usize].len())
    }

    /// Empties the ledger, yielding every credit with its destination and
    /// class. Used to move credits off a failed rail.
    pub fn drain_all(&mut self) -> Vec<(u32, BufType, RemoteBuf)> {
        let mut out = Vec::new();
        for (dest, queues) in self.credits.drain() {
            for (buf_type, queue) in [BufType::Small, BufType::Large].into_iter().zip(queues) {
                for buf in queue {
                    out.push((dest, buf_type, buf));
                }
            }
        }
        out
    }

    /// Destinations with at least one idle credit of any class.
    pub fn dests_with_credits(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .credits
            .iter()
            .filter(|(_, q)| q.iter().any(|d| !d.is_empty()))
            .map(|(&dest, _)| dest)
            .collect();
        out.sort_unstable();
        out
    }
}

/// The receive side's local buffer inventory: ids it may grant to peers.
#[derive(Debug)]
pub struct RecvBufRegistry {
    free: [Vec<u32>; NUM_BUF_TYPES],
    bytes: [u32; NUM_BUF_TYPES],
    n_small: u32,
}

impl RecvBufRegistry {
    pub fn new(n_small: usize, small_bytes: u32, n_large: usize, large_bytes: u32) -> Self {
        // ids are disjoint across classes so a returned id names one buffer
        let small: Vec<u32> = (0..n_small as u32).collect();
        let large: Vec<u32> = (n_small as u32..(n_small + n_large) as u32).collect();
        Self {
            free: [small, large],
            bytes: [small_bytes, large_bytes],
            n_small: n_small as u32,
        }
    }

    pub fn buf_bytes(&self, buf_type: BufType) -> u32 {
        self.bytes[buf_type as usize]
    }

    /// Size class an id was issued from.
    pub fn class_of(&self, id: u32) -> BufType {
        if id < self.n_small {
            BufType::Small
        } else {
            BufType::Large
        }
    }

    /// Grants up to `max` buffers of the class to a peer.
    pub fn grant(&mut self, buf_type: BufType, max: usize) -> Vec<u32> {
        let free = &mut self.free[buf_type as usize];
        let n = free.len().min(max);
        free.split_off(free.len() - n)
    }

    /// Returns buffers to the inventory, either after local delivery or via
    /// a peer's memory-release.
    pub fn reclaim(&mut self, buf_type: BufType, ids: impl IntoIterator<Item = u32>) {
        self.free[buf_type as usize].extend(ids);
    }

    pub fn available(&self, buf_type: BufType) -> usize {
        self.free[buf_type as usize].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_is_lifo() {
        let mut ledger = CreditLedger::new();
        ledger.push(7, BufType::Small, RemoteBuf { id: 1, bytes: 2048 });
        ledger.push(7, BufType::Small, RemoteBuf { id: 2, bytes: 2048 });
        assert_eq!(ledger.pop(7, BufType::Small).unwrap().id, 2);
        assert_eq!(ledger.pop(7, BufType::Small).unwrap().id, 1);
        assert!(ledger.pop(7, BufType::Small).is_none());
    }

    #[test]
    fn test_pop_lru_drains_oldest_first() {
        let mut ledger = CreditLedger::new();
        for id in 1..=5 {
            ledger.push(3, BufType::Large, RemoteBuf { id, bytes: 16384 });
        }
        let released = ledger.pop_lru(3, BufType::Large, 3);
        assert_eq!(released.iter().map(|b| b.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(ledger.count(3, BufType::Large), 2);
    }

    #[test]
    fn test_classes_are_independent() {
        let mut ledger = CreditLedger::new();
        ledger.push(1, BufType::Small, RemoteBuf { id: 9, bytes: 2048 });
        assert_eq!(ledger.count(1, BufType::Small), 1);
        assert_eq!(ledger.count(1, BufType::Large), 0);
        assert!(ledger.pop(1, BufType::Large).is_none());
    }

    #[test]
    fn test_drain_all_empties_ledger() {
        let mut ledger = CreditLedger::new();
        ledger.push(1, BufType::Small, RemoteBuf { id: 4, bytes: 2048 });
        ledger.push(1, BufType::Small, RemoteBuf { id: 5, bytes: 2048 });
        ledger.push(2, BufType::Large, RemoteBuf { id: 9, bytes: 16384 });
        let mut all = ledger.drain_all();
        all.sort_by_key(|(dest, _, buf)| (*dest, buf.id));
        assert_eq!(all.len(), 3);
        assert_eq!((all[0].0, all[0].2.id), (1, 4));
        assert_eq!((all[2].0, all[2].1, all[2].2.id), (2, BufType::Large, 9));
        assert!(ledger.dests_with_credits().is_empty());
    }

    #[test]
    fn test_dests_with_credits() {
        let mut ledger = CreditLedger::new();
        ledger.push(5, BufType::Small, RemoteBuf { id: 1, bytes: 2048 });
        ledger.push(2, BufType::Large, RemoteBuf { id: 2, bytes: 16384 });
        ledger.pop(2, BufType::Large).unwrap();
        assert_eq!(ledger.dests_with_credits(), vec![5]);
    }

    #[test]
    fn test_registry_grant_and_reclaim() {
        let mut reg = RecvBufRegistry::new(4, 2048, 2, 16384);
        assert_eq!(reg.available(BufType::Small), 4);
        let granted = reg.grant(BufType::Small, 3);
        assert_eq!(granted.len(), 3);
        assert_eq!(reg.available(BufType::Small), 1);
        reg.reclaim(BufType::Small, granted);
        assert_eq!(reg.available(BufType::Small), 4);
    }

    #[test]
    fn test_registry_grant_clamps_to_inventory() {
        let mut reg = RecvBufRegistry::new(2, 2048, 2, 16384);
        assert_eq!(reg.grant(BufType::Large, 10).len(), 2);
        assert!(reg.grant(BufType::Large, 1).is_empty());
    }

    #[test]
    fn test_registry_ids_disjoint_across_classes() {
        let mut reg = RecvBufRegistry::new(3, 2048, 3, 16384);
        let small = reg.grant(BufType::Small, 3);
        let large = reg.grant(BufType::Large, 3);
        for id in &small {
            assert!(!large.contains(id));
        }
    }

    #[test]
    fn test_buf_type_for_len() {
        assert_eq!(BufType::for_len(100, 2048), BufType::Small);
        assert_eq!(BufType::for_len(2048, 2048), BufType::Small);
        assert_eq!(BufType::for_len(2049, 2048), BufType::Large);
    }
}
