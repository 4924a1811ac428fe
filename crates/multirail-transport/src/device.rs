//! Rail device abstraction and a software rail for tests.
//!
//! A `RailDevice` is one interconnect adapter: it posts 128-byte control
//! frames (plus an optional out-of-band payload DMA) and polls for inbound
//! frames. The engine never talks to hardware directly, so the whole
//! protocol runs against `SimRail` in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

use crate::dma::EventToken;
use crate::wire::CTL_FRAME_BYTES;

/// A frame pulled off a rail, with the payload DMA that accompanied it.
#[derive(Debug)]
pub struct InboundFrame {
    pub frame: [u8; CTL_FRAME_BYTES],
    pub payload: Option<Bytes>,
}

/// Errors a device can report at post time.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The adapter or its link is down. The rail must be failed over.
    #[error("subpath failed")]
    SubpathFailed,
    /// Transient inability to accept work. Retry on the next progress call.
    #[error("device busy")]
    Busy,
}

/// One interconnect rail.
pub trait RailDevice: Send + Sync {
    /// Posts a control frame and optional payload toward `dest`. The device
    /// marks `token` done when the descriptor completes locally; completion
    /// says nothing about delivery.
    fn post(
        &self,
        frame: &[u8; CTL_FRAME_BYTES],
        payload: Option<Bytes>,
        dest: u32,
        token: &EventToken,
    ) -> Result<(), DeviceError>;

    /// Next inbound frame, if any.
    fn poll(&self) -> Option<InboundFrame>;
}

/// In-memory rail connecting two endpoints, with fault injection knobs.
pub struct SimRail {
    /// Peer's inbound queue.
    outbound: Arc<Mutex<VecDeque<InboundFrame>>>,
    inbound: Arc<Mutex<VecDeque<InboundFrame>>>,
    /// Posts fail with `SubpathFailed`.
    fail_sends: AtomicBool,
    /// Posts succeed locally but the frame never arrives.
    drop_frames: AtomicBool,
    /// Hold completion tokens until `complete_pending` is called.
    defer_completion: AtomicBool,
    pending: Mutex<Vec<EventToken>>,
    posted: AtomicUsize,
}

impl SimRail {
    /// Two connected endpoints of one rail.
    pub fn pair() -> (Arc<SimRail>, Arc<SimRail>) {
        let q_ab = Arc::new(Mutex::new(VecDeque::new()));
        let q_ba = Arc::new(Mutex::new(VecDeque::new()));
        let a = Arc::new(Self::with_queues(q_ab.clone(), q_ba.clone()));
        let b = Arc::new(Self::with_queues(q_ba, q_ab));
        (a, b)
    }

    /// An endpoint that receives its own frames.
    pub fn loopback() -> Arc<SimRail> {
        let q = Arc::new(Mutex::new(VecDeque::new()));
        Arc::new(Self::with_queues(q.clone(), q))
    }

    fn with_queues(
        outbound: Arc<Mutex<VecDeque<InboundFrame>>>,
        inbound: Arc<Mutex<VecDeque<InboundFrame>>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            fail_sends: AtomicBool::new(false),
            drop_frames: AtomicBool::new(false),
            defer_completion: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            posted: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_drop_frames(&self, drop: bool) {
        self.drop_frames.store(drop, Ordering::SeqCst);
    }

    pub fn set_defer_completion(&self, defer: bool) {
        self.defer_completion.store(defer, Ordering::SeqCst);
    }

    /// Fires every completion held back by `set_defer_completion`.
    pub fn complete_pending(&self) {
        for token in self.pending.lock().unwrap().drain(..) {
            token.mark_done();
        }
    }

    /// Frames successfully posted so far.
    pub fn posted_count(&self) -> usize {
        self.posted.load(Ordering::SeqCst)
    }
}

impl RailDevice for SimRail {
    fn post(
        &self,
        frame: &[u8; CTL_FRAME_BYTES],
        payload: Option<Bytes>,
        _dest: u32,
        token: &EventToken,
    ) -> Result<(), DeviceError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DeviceError::SubpathFailed);
        }
        self.posted.fetch_add(1, Ordering::SeqCst);
        if !self.drop_frames.load(Ordering::SeqCst) {
            self.outbound.lock().unwrap().push_back(InboundFrame {
                frame: *frame,
                payload,
            });
        }
        if self.defer_completion.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().push(token.clone());
        } else {
            token.mark_done();
        }
        Ok(())
    }

    fn poll(&self) -> Option<InboundFrame> {
        self.inbound.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(byte: u8) -> [u8; CTL_FRAME_BYTES] {
        [byte; CTL_FRAME_BYTES]
    }

    #[test]
    fn test_pair_delivers_both_directions() {
        let (a, b) = SimRail::pair();
        let token = EventToken::new();
        a.post(&frame_of(1), None, 1, &token).unwrap();
        b.post(&frame_of(2), None, 0, &token).unwrap();
        assert_eq!(b.poll().unwrap().frame[0], 1);
        assert_eq!(a.poll().unwrap().frame[0], 2);
        assert!(a.poll().is_none());
    }

    #[test]
    fn test_payload_travels_with_frame() {
        let (a, b) = SimRail::pair();
        let token = EventToken::new();
        a.post(&frame_of(0), Some(Bytes::from_static(b"payload")), 1, &token)
            .unwrap();
        let inbound = b.poll().unwrap();
        assert_eq!(inbound.payload.unwrap().as_ref(), b"payload");
    }

    #[test]
    fn test_completion_fires_immediately_by_default() {
        let (a, _b) = SimRail::pair();
        let token = EventToken::new();
        a.post(&frame_of(0), None, 1, &token).unwrap();
        assert!(token.is_done());
    }

    #[test]
    fn test_deferred_completion() {
        let (a, _b) = SimRail::pair();
        a.set_defer_completion(true);
        let token = EventToken::new();
        a.post(&frame_of(0), None, 1, &token).unwrap();
        assert!(!token.is_done());
        a.complete_pending();
        assert!(token.is_done());
    }

    #[test]
    fn test_fail_sends() {
        let (a, b) = SimRail::pair();
        a.set_fail_sends(true);
        let token = EventToken::new();
        assert_eq!(
            a.post(&frame_of(0), None, 1, &token),
            Err(DeviceError::SubpathFailed)
        );
        assert!(b.poll().is_none());
        assert_eq!(a.posted_count(), 0);
    }

    #[test]
    fn test_drop_frames_completes_locally() {
        let (a, b) = SimRail::pair();
        a.set_drop_frames(true);
        let token = EventToken::new();
        a.post(&frame_of(0), None, 1, &token).unwrap();
        assert!(token.is_done());
        assert!(b.poll().is_none());
        assert_eq!(a.posted_count(), 1);
    }

    #[test]
    fn test_loopback() {
        let rail = SimRail::loopback();
        let token = EventToken::new();
        rail.post(&frame_of(9), None, 0, &token).unwrap();
        assert_eq!(rail.poll().unwrap().frame[0], 9);
    }
}
