//! Per-rail send state.
//!
//! Each rail keeps one control-message queue pair per message type, plus a
//! presence bitmask per pair so the progress loop can skip idle rails with a
//! single integer test.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::credit::CreditLedger;
use crate::device::RailDevice;
use crate::frag::SendFrag;
use crate::pool::PoolElement;
use crate::wire::CTL_MSG_TYPES;

type CtlQueues = [VecDeque<PoolElement<SendFrag>>; CTL_MSG_TYPES];

pub struct RailState {
    pub index: usize,
    /// Cleared when the device reports a subpath failure; queued work is
    /// then rebound to a healthy rail.
    pub ok: bool,
    pub device: Arc<dyn RailDevice>,
    to_send: CtlQueues,
    to_ack: CtlQueues,
    to_send_mask: u32,
    to_ack_mask: u32,
    /// Remote buffer credits granted through this rail.
    pub credits: CreditLedger,
}

impl std::fmt::Debug for RailState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RailState")
            .field("index", &self.index)
            .field("ok", &self.ok)
            .field("to_send_mask", &self.to_send_mask)
            .field("to_ack_mask", &self.to_ack_mask)
            .finish()
    }
}

impl RailState {
    pub fn new(index: usize, device: Arc<dyn RailDevice>) -> Self {
        Self {
            index,
            ok: true,
            device,
            to_send: std::array::from_fn(|_| VecDeque::new()),
            to_ack: std::array::from_fn(|_| VecDeque::new()),
            to_send_mask: 0,
            to_ack_mask: 0,
            credits: CreditLedger::new(),
        }
    }

    /// Queues a control frag for transmission on this rail.
    pub fn enqueue_ctl(&mut self, frag: PoolElement<SendFrag>) {
        let t = frag.msg_type as usize;
        self.to_send[t].push_back(frag);
        self.to_send_mask |= 1 << t;
    }

    /// Moves a posted control frag to the completion-pending queue.
    pub fn note_posted(&mut self, frag: PoolElement<SendFrag>) {
        let t = frag.msg_type as usize;
        self.to_ack[t].push_back(frag);
        self.to_ack_mask |= 1 << t;
    }

    /// Detaches all pending control queues, clearing the mask. The caller
    /// re-enqueues whatever it could not post.
    pub fn take_ctl_queues(&mut self) -> CtlQueues {
        self.to_send_mask = 0;
        std::mem::take(&mut self.to_send)
    }

    /// Detaches the completion-pending queues for sweeping.
    pub fn take_ack_queues(&mut self) -> CtlQueues {
        self.to_ack_mask = 0;
        std::mem::take(&mut self.to_ack)
    }

    pub fn has_ctl_work(&self) -> bool {
        self.to_send_mask != 0
    }

    pub fn has_pending_completions(&self) -> bool {
        self.to_ack_mask != 0
    }

    /// Drains this rail's outbound control work, for rebinding after a
    /// failure.
    pub fn drain_all_ctl(&mut self) -> Vec<PoolElement<SendFrag>> {
        let mut out = Vec::new();
        for queue in self.take_ctl_queues().iter_mut() {
            out.extend(queue.drain(..));
        }
        out
    }
}
