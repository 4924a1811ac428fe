//! Chunked element pools with per-lane free lists.
//!
//! A `ResourcePool` pre-allocates elements in chunks and hands them out from
//! one of several independent free lists ("lanes"). Callers that are already
//! partitioned, such as one lane per rail, get uncontended acquires by
//! sticking to their own lane. Growth is bounded by a per-lane byte cap and
//! exhaustion escalates from a retryable error to a permanent one after a
//! configured number of consecutive failures.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{Result, TransportError};

/// What to do when a lane is permanently out of elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExhaustionPolicy {
    /// Return `OutOfResource` to the caller.
    #[default]
    ReturnError,
    /// Log and abort the process. Used for pools whose exhaustion means the
    /// job cannot make progress at all.
    Abort,
}

/// Where pool memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Backing {
    /// Process-private memory; lanes may grow on demand.
    #[default]
    Private,
    /// Memory shared with other processes. The pool is sized once at
    /// construction and never grows.
    Shared,
}

/// Sizing and failure policy for a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolPolicy {
    /// Bytes pre-allocated on each lane at construction.
    pub min_bytes_per_lane: usize,
    /// Growth cap per lane, or None for unbounded.
    pub max_bytes_per_lane: Option<usize>,
    /// Allocation granularity; each grow adds one chunk of this many bytes.
    pub chunk_bytes: usize,
    /// Consecutive failed acquires on a lane before exhaustion is permanent.
    pub max_consecutive_failures: usize,
    /// Keep retrying inside a single acquire call instead of returning
    /// `TempOutOfResource` to the caller.
    pub retry_for_resources: bool,
    pub on_exhaustion: ExhaustionPolicy,
    pub backing: Backing,
    /// Memory-affinity tag per lane (a NUMA node id, for example), recorded
    /// on each chunk as it is allocated. Applying the binding is the
    /// embedder's concern.
    pub affinity: Option<Vec<u32>>,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_bytes_per_lane: 16 * 1024,
            max_bytes_per_lane: None,
            chunk_bytes: 16 * 1024,
            max_consecutive_failures: 100,
            retry_for_resources: false,
            on_exhaustion: ExhaustionPolicy::ReturnError,
            backing: Backing::Private,
            affinity: None,
        }
    }
}

/// Stable address of a pool slot, used to return an element to its lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementId {
    lane: u32,
    chunk: u32,
    slot: u32,
}

/// An element checked out of a pool. The slot it came from stays reserved
/// until the element is passed back to [`ResourcePool::release`].
#[derive(Debug)]
pub struct PoolElement<T> {
    value: T,
    id: ElementId,
}

impl<T> PoolElement<T> {
    pub fn id(&self) -> ElementId {
        self.id
    }
}

impl<T> Deref for PoolElement<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for PoolElement<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

struct Chunk<T> {
    slots: Box<[Option<T>]>,
    /// Affinity tag this chunk was allocated under, if the lane has one.
    affinity: Option<u32>,
}

struct LaneState<T> {
    chunks: Vec<Chunk<T>>,
    free: Vec<ElementId>,
    bytes: usize,
    consec_failures: usize,
    elements_out: usize,
    max_elements_out: usize,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub bytes: usize,
    pub free_elements: usize,
    pub elements_out: usize,
    pub max_elements_out: usize,
}

pub struct ResourcePool<T> {
    name: &'static str,
    policy: PoolPolicy,
    elem_bytes: usize,
    elems_per_chunk: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    lanes: Vec<Mutex<LaneState<T>>>,
}

impl<T> std::fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("lanes", &self.lanes.len())
            .field("elem_bytes", &self.elem_bytes)
            .finish()
    }
}

impl<T> ResourcePool<T> {
    /// Builds a pool with `n_lanes` independent free lists. `elem_bytes` is
    /// the accounting size of one element and governs the byte caps.
    pub fn new(
        name: &'static str,
        n_lanes: usize,
        elem_bytes: usize,
        policy: PoolPolicy,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<Self> {
        if n_lanes == 0 || elem_bytes == 0 {
            return Err(TransportError::Fatal {
                reason: format!("pool '{name}': lanes and element size must be nonzero"),
            });
        }
        let elems_per_chunk = (policy.chunk_bytes / elem_bytes).max(1);
        let mut pool = Self {
            name,
            policy,
            elem_bytes,
            elems_per_chunk,
            factory: Box::new(factory),
            lanes: Vec::new(),
        };
        let target = match pool.policy.backing {
            Backing::Private => pool.policy.min_bytes_per_lane,
            // shared memory is carved out once, so size to the cap up front
            Backing::Shared => pool
                .policy
                .max_bytes_per_lane
                .unwrap_or(pool.policy.min_bytes_per_lane),
        };
        for lane in 0..n_lanes {
            let mut state = LaneState {
                chunks: Vec::new(),
                free: Vec::new(),
                bytes: 0,
                consec_failures: 0,
                elements_out: 0,
                max_elements_out: 0,
            };
            while state.bytes < target {
                pool.add_chunk(lane, &mut state);
            }
            pool.lanes.push(Mutex::new(state));
        }
        debug!(
            pool = name,
            lanes = n_lanes,
            bytes_per_lane = target,
            "resource pool initialized"
        );
        Ok(pool)
    }

    pub fn n_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Checks an element out of `lane`.
    pub fn acquire(&self, lane: usize) -> Result<PoolElement<T>> {
        let mut state = self.lanes[lane].lock().unwrap();
        self.acquire_inner(lane, &mut state)
    }

    /// Acquire for callers with exclusive access to the pool. The lane mutex
    /// is uncontended on this path.
    pub fn acquire_mut(&mut self, lane: usize) -> Result<PoolElement<T>> {
        self.acquire(lane)
    }

    /// Returns an element to the lane it came from.
    pub fn release(&self, elem: PoolElement<T>) {
        let PoolElement { value, id } = elem;
        let mut state = self.lanes[id.lane as usize].lock().unwrap();
        state.chunks[id.chunk as usize].slots[id.slot as usize] = Some(value);
        state.free.push(id);
        state.elements_out -= 1;
    }

    pub fn stats(&self) -> PoolStats {
        let mut out = PoolStats::default();
        for lane in &self.lanes {
            let state = lane.lock().unwrap();
            out.bytes += state.bytes;
            out.free_elements += state.free.len();
            out.elements_out += state.elements_out;
            out.max_elements_out += state.max_elements_out;
        }
        out
    }

    fn acquire_inner(&self, lane: usize, state: &mut LaneState<T>) -> Result<PoolElement<T>> {
        loop {
            if let Some(id) = state.free.pop() {
                let value = state.chunks[id.chunk as usize].slots[id.slot as usize]
                    .take()
                    .unwrap_or_else(|| (self.factory)());
                state.consec_failures = 0;
                state.elements_out += 1;
                state.max_elements_out = state.max_elements_out.max(state.elements_out);
                return Ok(PoolElement { value, id });
            }
            if self.try_grow(lane, state) {
                continue;
            }
            state.consec_failures += 1;
            if state.consec_failures >= self.policy.max_consecutive_failures {
                match self.policy.on_exhaustion {
                    ExhaustionPolicy::ReturnError => {
                        return Err(TransportError::OutOfResource { pool: self.name });
                    }
                    ExhaustionPolicy::Abort => {
                        error!(pool = self.name, lane, "pool permanently exhausted");
                        panic!("pool '{}' permanently exhausted", self.name);
                    }
                }
            }
            if !self.policy.retry_for_resources {
                return Err(TransportError::TempOutOfResource { pool: self.name });
            }
        }
    }

    fn try_grow(&self, lane: usize, state: &mut LaneState<T>) -> bool {
        if self.policy.backing == Backing::Shared && !state.chunks.is_empty() {
            return false;
        }
        let chunk_bytes = self.elems_per_chunk * self.elem_bytes;
        if let Some(cap) = self.policy.max_bytes_per_lane {
            if state.bytes + chunk_bytes > cap {
                return false;
            }
        }
        self.add_chunk(lane, state);
        true
    }

    /// Affinity tag configured for `lane`, if any.
    pub fn lane_affinity(&self, lane: usize) -> Option<u32> {
        self.policy
            .affinity
            .as_ref()
            .and_then(|tags| tags.get(lane).copied())
    }

    fn add_chunk(&self, lane: usize, state: &mut LaneState<T>) {
        let chunk_idx = state.chunks.len() as u32;
        let slots: Box<[Option<T>]> = (0..self.elems_per_chunk)
            .map(|_| Some((self.factory)()))
            .collect();
        state.chunks.push(Chunk {
            slots,
            affinity: self.lane_affinity(lane),
        });
        for slot in 0..self.elems_per_chunk as u32 {
            state.free.push(ElementId {
                lane: lane as u32,
                chunk: chunk_idx,
                slot,
            });
        }
        state.bytes += self.elems_per_chunk * self.elem_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_bytes: Option<usize>, retry: bool) -> ResourcePool<u64> {
        ResourcePool::new(
            "test",
            2,
            64,
            PoolPolicy {
                min_bytes_per_lane: 256,
                max_bytes_per_lane: max_bytes,
                chunk_bytes: 256,
                max_consecutive_failures: 3,
                retry_for_resources: retry,
                ..Default::default()
            },
            || 0u64,
        )
        .unwrap()
    }

    #[test]
    fn test_acquire_release_cycle() {
        let pool = small_pool(None, false);
        let mut e = pool.acquire(0).unwrap();
        *e = 42;
        assert_eq!(pool.stats().elements_out, 1);
        pool.release(e);
        assert_eq!(pool.stats().elements_out, 0);
    }

    #[test]
    fn test_elements_are_distinct_slots() {
        let pool = small_pool(None, false);
        let a = pool.acquire(0).unwrap();
        let b = pool.acquire(0).unwrap();
        assert_ne!(a.id(), b.id());
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn test_lanes_are_independent() {
        let pool = small_pool(Some(256), false);
        // drain lane 0 completely
        let held: Vec<_> = (0..4).map(|_| pool.acquire(0).unwrap()).collect();
        assert!(pool.acquire(0).is_err());
        // lane 1 is unaffected
        assert!(pool.acquire(1).is_ok());
        for e in held {
            pool.release(e);
        }
    }

    #[test]
    fn test_grows_until_cap() {
        let pool = small_pool(Some(512), false);
        // 512 bytes / 64 per element = 8 elements max
        let held: Vec<_> = (0..8).map(|_| pool.acquire(0).unwrap()).collect();
        assert!(matches!(
            pool.acquire(0),
            Err(TransportError::TempOutOfResource { .. })
        ));
        for e in held {
            pool.release(e);
        }
        assert!(pool.acquire(0).is_ok());
    }

    #[test]
    fn test_exhaustion_escalates_to_permanent() {
        let pool = small_pool(Some(256), false);
        let _held: Vec<_> = (0..4).map(|_| pool.acquire(0).unwrap()).collect();
        // max_consecutive_failures is 3: two temp errors, then permanent
        assert!(matches!(
            pool.acquire(0),
            Err(TransportError::TempOutOfResource { .. })
        ));
        assert!(matches!(
            pool.acquire(0),
            Err(TransportError::TempOutOfResource { .. })
        ));
        assert!(matches!(
            pool.acquire(0),
            Err(TransportError::OutOfResource { .. })
        ));
    }

    #[test]
    fn test_retry_reaches_permanent_in_one_call() {
        let pool = small_pool(Some(256), true);
        let _held: Vec<_> = (0..4).map(|_| pool.acquire(0).unwrap()).collect();
        assert!(matches!(
            pool.acquire(0),
            Err(TransportError::OutOfResource { .. })
        ));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let pool = small_pool(Some(256), false);
        let mut held: Vec<_> = (0..4).map(|_| pool.acquire(0).unwrap()).collect();
        assert!(pool.acquire(0).is_err());
        assert!(pool.acquire(0).is_err());
        pool.release(held.pop().unwrap());
        assert!(pool.acquire(0).is_ok());
    }

    #[test]
    fn test_shared_backing_never_grows() {
        let pool = ResourcePool::new(
            "shared",
            1,
            64,
            PoolPolicy {
                min_bytes_per_lane: 128,
                max_bytes_per_lane: Some(128),
                chunk_bytes: 128,
                max_consecutive_failures: 2,
                retry_for_resources: false,
                backing: Backing::Shared,
                ..Default::default()
            },
            || 0u64,
        )
        .unwrap();
        let _held: Vec<_> = (0..2).map(|_| pool.acquire(0).unwrap()).collect();
        assert!(pool.acquire(0).is_err());
    }

    #[test]
    fn test_affinity_recorded_per_chunk() {
        let pool = ResourcePool::new(
            "affine",
            2,
            64,
            PoolPolicy {
                min_bytes_per_lane: 256,
                chunk_bytes: 128,
                affinity: Some(vec![3, 7]),
                ..Default::default()
            },
            || 0u64,
        )
        .unwrap();
        assert_eq!(pool.lane_affinity(0), Some(3));
        assert_eq!(pool.lane_affinity(1), Some(7));
        let lane = pool.lanes[1].lock().unwrap();
        assert_eq!(lane.chunks.len(), 2);
        assert!(lane.chunks.iter().all(|c| c.affinity == Some(7)));
    }

    #[test]
    fn test_no_affinity_by_default() {
        let pool = small_pool(None, false);
        assert_eq!(pool.lane_affinity(0), None);
        assert!(pool.lanes[0].lock().unwrap().chunks.iter().all(|c| c.affinity.is_none()));
    }

    #[test]
    fn test_acquire_mut_fast_path() {
        let mut pool = small_pool(None, false);
        let e = pool.acquire_mut(1).unwrap();
        assert_eq!(pool.stats().elements_out, 1);
        pool.release(e);
    }

    #[test]
    fn test_released_value_is_reused() {
        let pool = small_pool(None, false);
        let ids: Vec<_> = {
            let held: Vec<_> = (0..4).map(|_| pool.acquire(0).unwrap()).collect();
            let ids = held.iter().map(|e| e.id()).collect();
            for e in held {
                pool.release(e);
            }
            ids
        };
        let again = pool.acquire(0).unwrap();
        assert!(ids.contains(&again.id()));
        pool.release(again);
    }

    #[test]
    fn test_max_elements_out_high_water() {
        let pool = small_pool(None, false);
        let a = pool.acquire(0).unwrap();
        let b = pool.acquire(0).unwrap();
        pool.release(a);
        pool.release(b);
        let c = pool.acquire(0).unwrap();
        pool.release(c);
        assert_eq!(pool.stats().max_elements_out, 2);
    }
}
