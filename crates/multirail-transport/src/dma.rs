//! Per-rail DMA descriptor throttling.
//!
//! Each rail owns a fixed table of `concurrent_dmas` slots. A send may only
//! be posted while holding a slot, which bounds the descriptors in flight on
//! that rail. Completed slots are reclaimed lazily: only when the table is
//! empty does the throttle sweep for slots whose completion event has fired.
//!
//! Every allocation carries a lease number. A holder's handle goes stale the
//! moment the throttle reclaims the slot, so a later `free_slot` from the
//! original holder cannot release the slot's next tenant.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

/// Completion flag shared between the transport and a rail device. The
/// device marks it done when the posted descriptor finishes.
#[derive(Debug, Clone, Default)]
pub struct EventToken(Arc<AtomicBool>);

impl EventToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_done(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A checked-out DMA slot. Not clonable; the lease ties it to one tenancy.
#[derive(Debug)]
pub struct DmaSlot {
    rail: usize,
    index: usize,
    lease: u64,
    token: EventToken,
}

impl DmaSlot {
    pub fn rail(&self) -> usize {
        self.rail
    }

    pub fn token(&self) -> &EventToken {
        &self.token
    }
}

enum SlotState {
    Free,
    Allocated { token: EventToken, lease: u64 },
}

struct RailSlots {
    slots: Vec<SlotState>,
    free: Vec<usize>,
}

/// Bounds concurrent DMA descriptors per rail.
pub struct DmaThrottle {
    rails: Vec<Mutex<RailSlots>>,
    reclaim: bool,
    next_lease: AtomicU64,
}

impl std::fmt::Debug for DmaThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaThrottle")
            .field("rails", &self.rails.len())
            .finish()
    }
}

impl DmaThrottle {
    /// `concurrent` slots per rail; `reclaim` enables the lazy sweep of
    /// completed slots when the table runs dry.
    pub fn new(n_rails: usize, concurrent: usize, reclaim: bool) -> Self {
        let rails = (0..n_rails)
            .map(|_| {
                Mutex::new(RailSlots {
                    slots: (0..concurrent).map(|_| SlotState::Free).collect(),
                    free: (0..concurrent).rev().collect(),
                })
            })
            .collect();
        Self {
            rails,
            reclaim,
            next_lease: AtomicU64::new(1),
        }
    }

    /// Takes a slot on `rail`, or None if the rail is at its concurrency
    /// limit. None is backpressure, not an error.
    pub fn get_slot(&self, rail: usize) -> Option<DmaSlot> {
        let mut state = self.rails[rail].lock().unwrap();
        if state.free.is_empty() && self.reclaim {
            self.sweep(rail, &mut state);
        }
        let index = state.free.pop()?;
        let token = EventToken::new();
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        state.slots[index] = SlotState::Allocated {
            token: token.clone(),
            lease,
        };
        Some(DmaSlot {
            rail,
            index,
            lease,
            token,
        })
    }

    /// Releases a slot. A stale handle, one whose slot was already swept, is
    /// ignored rather than freeing the slot's current tenant.
    pub fn free_slot(&self, slot: DmaSlot) {
        let mut state = self.rails[slot.rail].lock().unwrap();
        match &state.slots[slot.index] {
            SlotState::Allocated { lease, .. } if *lease == slot.lease => {
                state.slots[slot.index] = SlotState::Free;
                state.free.push(slot.index);
            }
            _ => {
                trace!(rail = slot.rail, index = slot.index, "stale slot handle ignored");
            }
        }
    }

    /// True once the DMA behind `slot` has completed. A handle whose slot
    /// was swept reports ready, since the sweep only takes completed slots.
    pub fn is_slot_ready(&self, slot: &DmaSlot) -> bool {
        let state = self.rails[slot.rail].lock().unwrap();
        match &state.slots[slot.index] {
            SlotState::Allocated { token, lease } if *lease == slot.lease => token.is_done(),
            _ => true,
        }
    }

    /// Slots currently allocated on `rail`.
    pub fn in_flight(&self, rail: usize) -> usize {
        let state = self.rails[rail].lock().unwrap();
        state.slots.len() - state.free.len()
    }

    fn sweep(&self, rail: usize, state: &mut RailSlots) {
        let mut reclaimed = 0usize;
        for index in 0..state.slots.len() {
            if let SlotState::Allocated { token, .. } = &state.slots[index] {
                if token.is_done() {
                    state.slots[index] = SlotState::Free;
                    state.free.push(index);
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            trace!(rail, reclaimed, "reclaimed completed dma slots");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_by_concurrency_limit() {
        let t = DmaThrottle::new(1, 4, false);
        let held: Vec<_> = (0..4).map(|_| t.get_slot(0).unwrap()).collect();
        assert!(t.get_slot(0).is_none());
        assert_eq!(t.in_flight(0), 4);
        for s in held {
            t.free_slot(s);
        }
        assert_eq!(t.in_flight(0), 0);
    }

    #[test]
    fn test_rails_throttled_independently() {
        let t = DmaThrottle::new(2, 1, false);
        let _a = t.get_slot(0).unwrap();
        assert!(t.get_slot(0).is_none());
        assert!(t.get_slot(1).is_some());
    }

    #[test]
    fn test_lazy_reclaim_of_done_slots() {
        let t = DmaThrottle::new(1, 2, true);
        let a = t.get_slot(0).unwrap();
        let _b = t.get_slot(0).unwrap();
        assert!(t.get_slot(0).is_none());
        a.token().mark_done();
        // table is full, so the next request sweeps and finds a's slot
        assert!(t.get_slot(0).is_some());
    }

    #[test]
    fn test_no_reclaim_when_disabled() {
        let t = DmaThrottle::new(1, 1, false);
        let a = t.get_slot(0).unwrap();
        a.token().mark_done();
        assert!(t.get_slot(0).is_none());
        t.free_slot(a);
        assert!(t.get_slot(0).is_some());
    }

    #[test]
    fn test_stale_handle_cannot_free_new_tenant() {
        let t = DmaThrottle::new(1, 1, true);
        let old = t.get_slot(0).unwrap();
        old.token().mark_done();
        // sweep hands the slot to a new tenant
        let fresh = t.get_slot(0).unwrap();
        assert_eq!(t.in_flight(0), 1);
        t.free_slot(old);
        // the fresh tenancy is untouched
        assert_eq!(t.in_flight(0), 1);
        assert!(!t.is_slot_ready(&fresh));
    }

    #[test]
    fn test_ready_tracks_completion() {
        let t = DmaThrottle::new(1, 2, false);
        let s = t.get_slot(0).unwrap();
        assert!(!t.is_slot_ready(&s));
        s.token().mark_done();
        assert!(t.is_slot_ready(&s));
    }

    #[test]
    fn test_swept_handle_reports_ready() {
        let t = DmaThrottle::new(1, 1, true);
        let old = t.get_slot(0).unwrap();
        old.token().mark_done();
        let _fresh = t.get_slot(0).unwrap();
        assert!(t.is_slot_ready(&old));
    }
}
