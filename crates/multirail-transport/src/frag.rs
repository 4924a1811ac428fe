//! Send-side fragment descriptors.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::credit::{BufType, RemoteBuf};
use crate::dma::DmaSlot;
use crate::wire::{CtlHeader, CtlMsgType};

/// One outgoing frame: either a fragment of user data or a standalone
/// control message. Fragments are pool-allocated and recycled; `reset`
/// returns one to its post-construction state.
#[derive(Debug)]
pub struct SendFrag {
    pub msg_id: u64,
    pub msg_type: CtlMsgType,
    pub rail: usize,
    pub dest: u32,
    pub msg_seq: u64,
    pub msg_len: u64,
    pub offset: u64,
    pub length: u32,
    pub frag_seq: u64,
    pub buf_type: BufType,
    /// Remote buffer credit spent on this fragment, kept so a retransmit
    /// reuses the same destination.
    pub dest_buf: Option<RemoteBuf>,
    /// Prebuilt header for control-only frags. Data frags build theirs at
    /// post time.
    pub header: Option<CtlHeader>,
    /// Out-of-band payload for non-inline data frags.
    pub payload: Option<Bytes>,
    pub transmit_count: u32,
    pub time_sent: Option<Instant>,
    pub slot: Option<DmaSlot>,
    /// Fire-and-forget: reap on local completion, no ack expected.
    pub free_when_done: bool,
}

impl Default for SendFrag {
    fn default() -> Self {
        Self {
            msg_id: 0,
            msg_type: CtlMsgType::Data,
            rail: 0,
            dest: 0,
            msg_seq: 0,
            msg_len: 0,
            offset: 0,
            length: 0,
            frag_seq: 0,
            buf_type: BufType::Small,
            dest_buf: None,
            header: None,
            payload: None,
            transmit_count: 0,
            time_sent: None,
            slot: None,
            free_when_done: false,
        }
    }
}

impl SendFrag {
    /// Clears the descriptor for reuse. The caller must have detached the
    /// DMA slot first; a slot dropped here would stay allocated until its
    /// rail sweeps it.
    pub fn reset(&mut self) {
        debug_assert!(self.slot.is_none());
        *self = SendFrag::default();
    }

    /// When this fragment becomes eligible for retransmission. The interval
    /// doubles with every transmit, capped at `base << max_power`.
    pub fn resend_deadline(&self, base: Duration, max_power: u32) -> Option<Instant> {
        let sent = self.time_sent?;
        let exp = self.transmit_count.min(max_power);
        Some(sent + base * 2u32.saturating_pow(exp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resend_deadline_backs_off() {
        let base = Duration::from_millis(100);
        let now = Instant::now();
        let mut frag = SendFrag {
            time_sent: Some(now),
            transmit_count: 1,
            ..Default::default()
        };
        assert_eq!(frag.resend_deadline(base, 10), Some(now + base * 2));
        frag.transmit_count = 3;
        assert_eq!(frag.resend_deadline(base, 10), Some(now + base * 8));
    }

    #[test]
    fn test_resend_deadline_capped() {
        let base = Duration::from_millis(100);
        let now = Instant::now();
        let frag = SendFrag {
            time_sent: Some(now),
            transmit_count: 40,
            ..Default::default()
        };
        assert_eq!(frag.resend_deadline(base, 4), Some(now + base * 16));
    }

    #[test]
    fn test_unsent_frag_has_no_deadline() {
        let frag = SendFrag::default();
        assert!(frag.resend_deadline(Duration::from_secs(1), 10).is_none());
    }
}
