//! The multi-rail path engine.
//!
//! A `PathEngine` owns one endpoint's send and receive state across all of
//! its rails: fragmentation of posted messages, credit negotiation for
//! remote receive buffers, retransmission with exponential backoff,
//! duplicate suppression, and failover of queued work when a rail dies.
//!
//! The engine is single-threaded by construction; callers that share one
//! across threads wrap it in a mutex. All time-dependent operations take
//! `now` explicitly so the protocol clock is the caller's.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::checksum;
use crate::config::TransportConfig;
use crate::credit::{BufType, RecvBufRegistry, RemoteBuf};
use crate::device::{DeviceError, InboundFrame, RailDevice};
use crate::dma::DmaThrottle;
use crate::frag::SendFrag;
use crate::message::SendMessage;
use crate::pool::{PoolPolicy, ResourcePool};
use crate::rail::RailState;
use crate::seqtrack::{Recorded, SequenceTracker};
use crate::wire::{
    self, AckHeader, AckStatus, CtlHeader, CtlMsgType, DataHeader, MemRequestAckHeader,
    MemRequestHeader, MemReleaseHeader, CTL_DATA_BYTES, MEM_GRANT_MAX_BUFS, MEM_RELEASE_MAX_BUFS,
};
use crate::{Result, TransportError};

/// A delivered fragment. Reassembly into messages is the layer above.
#[derive(Debug, Clone)]
pub struct ReceivedData {
    pub sender: u32,
    pub msg_seq: u64,
    pub offset: u64,
    pub msg_len: u64,
    pub data: Bytes,
}

/// Counters snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PathStats {
    pub messages_posted: u64,
    pub frags_sent: u64,
    pub frags_retransmitted: u64,
    pub frags_acked: u64,
    pub frags_delivered: u64,
    pub dup_frags_dropped: u64,
    pub checksum_failures: u64,
    pub rail_failovers: u64,
    pub ctl_frames_sent: u64,
    pub mem_requests_sent: u64,
    pub mem_releases_sent: u64,
}

pub struct PathEngine {
    config: TransportConfig,
    my_proc: u32,
    rails: Vec<RailState>,
    throttle: DmaThrottle,
    frag_pool: ResourcePool<SendFrag>,
    messages: HashMap<u64, SendMessage>,
    next_msg_id: u64,
    msg_seq_next: HashMap<u32, u64>,
    frag_seq_next: HashMap<u32, u64>,
    /// Per-sender fragment sequences seen, for duplicate suppression.
    delivered: HashMap<u32, SequenceTracker>,
    /// Per-sender release sequences seen, so a repeated release cannot
    /// double-free buffers.
    release_seqs_seen: HashMap<u32, SequenceTracker>,
    next_release_seq: HashMap<u32, u64>,
    recv_bufs: RecvBufRegistry,
    last_rail: usize,
    last_mem_release: Option<Instant>,
    inbound: VecDeque<ReceivedData>,
    stats: PathStats,
}

impl std::fmt::Debug for PathEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathEngine")
            .field("my_proc", &self.my_proc)
            .field("rails", &self.rails.len())
            .field("messages", &self.messages.len())
            .finish()
    }
}

impl PathEngine {
    pub fn new(
        config: TransportConfig,
        my_proc: u32,
        devices: Vec<Arc<dyn RailDevice>>,
    ) -> Result<Self> {
        config.validate()?;
        if devices.len() != config.n_rails {
            return Err(TransportError::Fatal {
                reason: format!(
                    "{} devices supplied for {} rails",
                    devices.len(),
                    config.n_rails
                ),
            });
        }
        let throttle =
            DmaThrottle::new(config.n_rails, config.concurrent_dmas, config.reclaim_dma_slots);
        let elem_bytes = std::mem::size_of::<SendFrag>();
        let frag_pool = ResourcePool::new(
            "send frags",
            config.n_rails,
            elem_bytes,
            PoolPolicy {
                min_bytes_per_lane: 32 * elem_bytes,
                max_bytes_per_lane: config.max_outstanding_frags.map(|n| n * elem_bytes),
                chunk_bytes: 32 * elem_bytes,
                ..Default::default()
            },
            SendFrag::default,
        )?;
        let recv_bufs = RecvBufRegistry::new(
            config.n_small_recv_bufs,
            config.small_buf_bytes as u32,
            config.n_large_recv_bufs,
            config.large_buf_bytes as u32,
        );
        let rails = devices
            .into_iter()
            .enumerate()
            .map(|(i, d)| RailState::new(i, d))
            .collect();
        Ok(Self {
            config,
            my_proc,
            rails,
            throttle,
            frag_pool,
            messages: HashMap::new(),
            next_msg_id: 1,
            msg_seq_next: HashMap::new(),
            frag_seq_next: HashMap::new(),
            delivered: HashMap::new(),
            release_seqs_seen: HashMap::new(),
            next_release_seq: HashMap::new(),
            recv_bufs,
            last_rail: 0,
            last_mem_release: None,
            inbound: VecDeque::new(),
            stats: PathStats::default(),
        })
    }

    /// Hands a message to the engine. Returns the handle used with [`send`].
    ///
    /// [`send`]: PathEngine::send
    pub fn post_message(&mut self, dest: u32, data: Bytes) -> u64 {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        let seq = self.msg_seq_next.entry(dest).or_insert(1);
        let msg_seq = *seq;
        *seq += 1;
        let msg = SendMessage::new(id, dest, data, msg_seq, self.config.large_buf_bytes);
        debug!(msg_id = id, dest, msg_seq, frags = msg.num_frags, "message posted");
        self.messages.insert(id, msg);
        self.stats.messages_posted += 1;
        id
    }

    /// Pushes a message forward: carves fragments, spends credits, posts
    /// whatever the rails will take. Returns true once the message has fully
    /// completed, at which point the handle is retired.
    pub fn send(&mut self, msg_id: u64, now: Instant) -> Result<bool> {
        let mut msg = self
            .messages
            .remove(&msg_id)
            .ok_or(TransportError::UnknownMessage(msg_id))?;
        let res = self.progress_message(&mut msg, now);
        let done = msg.is_done(self.config.do_ack);
        if done {
            debug!(msg_id, "message complete");
        } else {
            self.messages.insert(msg_id, msg);
        }
        res.map(|_| done)
    }

    /// Drains inbound frames on every rail and dispatches them. Returns the
    /// number of data fragments delivered to the inbound queue.
    pub fn receive(&mut self) -> Result<usize> {
        let mut delivered = 0;
        for rail_idx in 0..self.rails.len() {
            let device = self.rails[rail_idx].device.clone();
            while let Some(inbound) = device.poll() {
                delivered += self.handle_frame(rail_idx, inbound)?;
            }
        }
        Ok(delivered)
    }

    /// Housekeeping pass: retransmits overdue fragments, sweeps idle credits
    /// home, flushes control queues, and reaps completed descriptors.
    pub fn push(&mut self, now: Instant) -> Result<()> {
        self.progress_all_messages(now)?;
        self.release_memory(now)?;
        self.send_ctl_msgs(now)?;
        self.clean_ctl_msgs();
        self.reap_completions();
        Ok(())
    }

    /// True when a [`push`] call has work to do.
    ///
    /// [`push`]: PathEngine::push
    pub fn needs_push(&self, now: Instant) -> bool {
        if self
            .rails
            .iter()
            .any(|r| r.has_ctl_work() || r.has_pending_completions())
        {
            return true;
        }
        self.messages.values().any(|msg| {
            if !msg.to_send.is_empty() || msg.frags_allocated < msg.num_frags {
                return true;
            }
            if self.config.do_ack {
                msg.earliest_resend(self.config.retrans_time, self.config.max_retrans_power)
                    .is_some_and(|d| d <= now)
            } else {
                !msg.to_ack.is_empty()
            }
        })
    }

    /// Next delivered fragment, if any.
    pub fn take_inbound(&mut self) -> Option<ReceivedData> {
        self.inbound.pop_front()
    }

    pub fn stats(&self) -> PathStats {
        self.stats.clone()
    }

    pub fn rail_ok(&self, rail: usize) -> bool {
        self.rails[rail].ok
    }

    /// Local receive buffers not currently granted to a peer.
    pub fn recv_bufs_available(&self, buf_type: BufType) -> usize {
        self.recv_bufs.available(buf_type)
    }

    // ---- send side ----

    fn progress_message(&mut self, msg: &mut SendMessage, now: Instant) -> Result<()> {
        self.allocate_frags(msg, now)?;
        self.post_pending_frags(msg, now)
    }

    fn progress_all_messages(&mut self, now: Instant) -> Result<()> {
        let ids: Vec<u64> = self.messages.keys().copied().collect();
        for id in ids {
            let Some(mut msg) = self.messages.remove(&id) else {
                continue;
            };
            if self.config.do_ack {
                self.requeue_overdue(&mut msg, now);
            }
            let res = self.progress_message(&mut msg, now);
            self.messages.insert(id, msg);
            res?;
        }
        Ok(())
    }

    /// Moves in-flight fragments whose backoff deadline has passed back to
    /// the send queue. Each fragment is requeued at most once per call.
    fn requeue_overdue(&mut self, msg: &mut SendMessage, now: Instant) {
        let base = self.config.retrans_time;
        let max_power = self.config.max_retrans_power;
        let mut i = 0;
        while i < msg.to_ack.len() {
            let overdue = msg.to_ack[i].msg_type == CtlMsgType::Data
                && msg.to_ack[i]
                    .resend_deadline(base, max_power)
                    .is_some_and(|d| d <= now);
            if overdue {
                let mut frag = msg.to_ack.swap_remove(i);
                trace!(
                    msg_id = msg.id,
                    frag_seq = frag.frag_seq,
                    transmit_count = frag.transmit_count,
                    "fragment overdue, retransmitting"
                );
                if let Some(slot) = frag.slot.take() {
                    self.throttle.free_slot(slot);
                }
                frag.time_sent = None;
                msg.to_send.push_back(frag);
            } else {
                i += 1;
            }
        }
    }

    fn allocate_frags(&mut self, msg: &mut SendMessage, now: Instant) -> Result<()> {
        while let Some(len) = msg.next_frag_len(self.config.large_buf_bytes) {
            let inline = len <= CTL_DATA_BYTES;
            let buf_type = BufType::for_len(len, self.config.small_buf_bytes);
            let (rail_idx, credit) = if inline {
                match self.pick_rail() {
                    Some(r) => (r, None),
                    None => return Err(TransportError::BadPath),
                }
            } else {
                match self.pick_rail_with_credit(msg.dest, buf_type) {
                    Some((r, c)) => (r, Some(c)),
                    None => {
                        // out of credits: ask the peer for buffers and stop
                        // carving until a grant arrives
                        self.request_memory(msg, buf_type, now)?;
                        break;
                    }
                }
            };
            let mut frag = match self.frag_pool.acquire(rail_idx) {
                Ok(f) => f,
                Err(TransportError::TempOutOfResource { .. }) => {
                    if let Some(c) = credit {
                        self.rails[rail_idx].credits.push(msg.dest, buf_type, c);
                    }
                    break;
                }
                Err(e) => return Err(e),
            };
            frag.reset();
            frag.msg_id = msg.id;
            frag.msg_type = CtlMsgType::Data;
            frag.rail = rail_idx;
            frag.dest = msg.dest;
            frag.msg_seq = msg.msg_seq;
            frag.msg_len = msg.data.len() as u64;
            frag.offset = msg.next_offset;
            frag.length = len as u32;
            frag.frag_seq = self.next_frag_seq(msg.dest);
            frag.buf_type = buf_type;
            frag.dest_buf = credit;
            let start = msg.next_offset as usize;
            frag.payload = Some(msg.data.slice(start..start + len));
            msg.next_offset += len as u64;
            msg.frags_allocated += 1;
            msg.to_send.push_back(frag);
        }
        Ok(())
    }

    fn post_pending_frags(&mut self, msg: &mut SendMessage, now: Instant) -> Result<()> {
        while let Some(mut frag) = msg.to_send.pop_front() {
            match self.post_data_frag(&mut frag, now) {
                Ok(true) => msg.to_ack.push(frag),
                Ok(false) => {
                    msg.to_send.push_front(frag);
                    break;
                }
                Err(TransportError::BadSubpath { rail }) => {
                    let rebound = self.fail_rail(rail);
                    match self.pick_rail() {
                        Some(idx) => {
                            // the spent credit names remote memory, which is
                            // reachable from any rail
                            frag.rail = idx;
                            msg.to_send.push_front(frag);
                            rebound?;
                        }
                        None => {
                            msg.to_send.push_front(frag);
                            rebound?;
                            return Err(TransportError::BadPath);
                        }
                    }
                }
                Err(e) => {
                    msg.to_send.push_front(frag);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Posts one data fragment. `Ok(false)` is backpressure: no DMA slot or
    /// a busy device; leave the fragment queued.
    fn post_data_frag(&mut self, frag: &mut SendFrag, now: Instant) -> Result<bool> {
        let rail_idx = frag.rail;
        if !self.rails[rail_idx].ok {
            return Err(TransportError::BadSubpath { rail: rail_idx });
        }
        let slot = match frag.slot.take() {
            Some(s) => s,
            None => match self.throttle.get_slot(rail_idx) {
                Some(s) => s,
                None => return Ok(false),
            },
        };
        let payload = frag.payload.clone().unwrap_or_default();
        let payload_checksum = if self.config.do_checksum {
            checksum::compute(self.config.checksum_kind, &payload)
        } else {
            0
        };
        let inline = frag.dest_buf.is_none();
        let header = CtlHeader::Data(DataHeader {
            sender: self.my_proc,
            dest: frag.dest,
            msg_seq: frag.msg_seq,
            frag_seq: frag.frag_seq,
            msg_id: frag.msg_id,
            msg_len: frag.msg_len,
            offset: frag.offset,
            frag_len: frag.length,
            payload_checksum,
            dest_buf: frag.dest_buf.map(|b| b.id),
            inline: inline.then(|| payload.clone()),
        });
        let frame = wire::encode(&header, self.config.checksum_kind)?;
        let device = self.rails[rail_idx].device.clone();
        let out_of_band = (!inline).then_some(payload);
        match device.post(&frame, out_of_band, frag.dest, slot.token()) {
            Ok(()) => {
                frag.slot = Some(slot);
                frag.time_sent = Some(now);
                frag.transmit_count += 1;
                if frag.transmit_count > 1 {
                    self.stats.frags_retransmitted += 1;
                }
                self.stats.frags_sent += 1;
                Ok(true)
            }
            Err(DeviceError::Busy) => {
                frag.slot = Some(slot);
                Ok(false)
            }
            Err(DeviceError::SubpathFailed) => {
                self.throttle.free_slot(slot);
                Err(TransportError::BadSubpath { rail: rail_idx })
            }
        }
    }

    /// Rate-limited request for remote buffers of the given class.
    fn request_memory(
        &mut self,
        msg: &mut SendMessage,
        buf_type: BufType,
        now: Instant,
    ) -> Result<()> {
        if let Some(last) = msg.last_mem_req_time {
            if now.duration_since(last) < self.config.mem_request_interval {
                return Ok(());
            }
        }
        let Some(rail_idx) = self.pick_rail() else {
            return Err(TransportError::BadPath);
        };
        let mut frag = match self.frag_pool.acquire(rail_idx) {
            Ok(f) => f,
            Err(TransportError::TempOutOfResource { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        frag.reset();
        frag.msg_type = CtlMsgType::MemRequest;
        frag.rail = rail_idx;
        frag.dest = msg.dest;
        frag.free_when_done = true;
        frag.header = Some(CtlHeader::MemRequest(MemRequestHeader {
            sender: self.my_proc,
            dest: msg.dest,
            msg_seq: msg.msg_seq,
            offset: msg.next_offset,
            bytes_needed: msg.data.len() as u64 - msg.next_offset,
            buf_type,
        }));
        self.rails[rail_idx].enqueue_ctl(frag);
        msg.last_mem_req_time = Some(now);
        self.stats.mem_requests_sent += 1;
        Ok(())
    }

    /// Next healthy rail, round-robin from the last one used.
    fn pick_rail(&mut self) -> Option<usize> {
        let n = self.rails.len();
        for i in 1..=n {
            let idx = (self.last_rail + i) % n;
            if self.rails[idx].ok {
                self.last_rail = idx;
                return Some(idx);
            }
        }
        None
    }

    /// Next healthy rail holding a credit for `dest`, spending the credit.
    fn pick_rail_with_credit(&mut self, dest: u32, buf_type: BufType) -> Option<(usize, RemoteBuf)> {
        let n = self.rails.len();
        for i in 1..=n {
            let idx = (self.last_rail + i) % n;
            if !self.rails[idx].ok {
                continue;
            }
            if let Some(credit) = self.rails[idx].credits.pop(dest, buf_type) {
                self.last_rail = idx;
                return Some((idx, credit));
            }
        }
        None
    }

    fn next_frag_seq(&mut self, dest: u32) -> u64 {
        let seq = self.frag_seq_next.entry(dest).or_insert(1);
        let s = *seq;
        *seq += 1;
        s
    }

    /// Marks a rail dead and rebinds its queued control work to a healthy
    /// one. Errors with `BadPath` when no rail remains.
    fn fail_rail(&mut self, rail: usize) -> Result<()> {
        if self.rails[rail].ok {
            warn!(rail, "rail failed, rebinding queued work");
            self.rails[rail].ok = false;
            self.stats.rail_failovers += 1;
        }
        let orphans = self.rails[rail].drain_all_ctl();
        let stranded = self.rails[rail].credits.drain_all();
        if orphans.is_empty() && stranded.is_empty() {
            return if self.rails.iter().any(|r| r.ok) {
                Ok(())
            } else {
                Err(TransportError::BadPath)
            };
        }
        let Some(target) = self.pick_rail() else {
            return Err(TransportError::BadPath);
        };
        // a banked credit names the peer's memory, which stays reachable
        // from any rail
        for (dest, buf_type, credit) in stranded {
            self.rails[target].credits.push(dest, buf_type, credit);
        }
        for mut frag in orphans {
            if let Some(slot) = frag.slot.take() {
                self.throttle.free_slot(slot);
            }
            frag.rail = target;
            self.rails[target].enqueue_ctl(frag);
        }
        Ok(())
    }

    // ---- receive side ----

    fn handle_frame(&mut self, rail_idx: usize, inbound: InboundFrame) -> Result<usize> {
        let header = match wire::decode(&inbound.frame, self.config.checksum_kind) {
            Ok(h) => h,
            Err(TransportError::ChecksumMismatch { expected, computed }) => {
                self.stats.checksum_failures += 1;
                if self.config.do_ack {
                    warn!(
                        rail = rail_idx,
                        expected, computed, "dropping corrupt control frame"
                    );
                    return Ok(0);
                }
                return Err(TransportError::Fatal {
                    reason: "corrupt control frame with acknowledgments disabled".into(),
                });
            }
            Err(e) => {
                warn!(rail = rail_idx, error = %e, "dropping undecodable control frame");
                return Ok(0);
            }
        };
        match header {
            CtlHeader::Data(h) => self.handle_data(rail_idx, h, inbound.payload),
            CtlHeader::DataAck(h) => {
                self.handle_ack(&h);
                Ok(0)
            }
            CtlHeader::MemRequest(h) => {
                self.handle_mem_request(rail_idx, &h)?;
                Ok(0)
            }
            CtlHeader::MemRequestAck(h) => {
                self.handle_mem_grant(rail_idx, &h);
                Ok(0)
            }
            CtlHeader::MemRelease(h) => {
                self.handle_mem_release(&h)?;
                Ok(0)
            }
        }
    }

    fn handle_data(
        &mut self,
        rail_idx: usize,
        h: DataHeader,
        out_of_band: Option<Bytes>,
    ) -> Result<usize> {
        let payload = match &h.inline {
            Some(b) => b.clone(),
            None => out_of_band.unwrap_or_default(),
        };
        let mut status = AckStatus::Good;
        if payload.len() != h.frag_len as usize {
            warn!(
                sender = h.sender,
                frag_seq = h.frag_seq,
                expected = h.frag_len,
                got = payload.len(),
                "fragment length mismatch"
            );
            status = AckStatus::DataCorrupt;
        } else if self.config.do_checksum
            && !checksum::verify(self.config.checksum_kind, &payload, h.payload_checksum)
        {
            warn!(sender = h.sender, frag_seq = h.frag_seq, "fragment payload corrupt");
            self.stats.checksum_failures += 1;
            status = AckStatus::DataCorrupt;
        }
        let mut delivered = 0;
        if status == AckStatus::Good {
            let tracker = self.delivered.entry(h.sender).or_default();
            match tracker.record_if_not_recorded(h.frag_seq, h.frag_seq)? {
                Recorded::Complete => {
                    trace!(sender = h.sender, frag_seq = h.frag_seq, "duplicate fragment");
                    self.stats.dup_frags_dropped += 1;
                }
                _ => {
                    self.inbound.push_back(ReceivedData {
                        sender: h.sender,
                        msg_seq: h.msg_seq,
                        offset: h.offset,
                        msg_len: h.msg_len,
                        data: payload,
                    });
                    self.stats.frags_delivered += 1;
                    delivered = 1;
                    // the targeted buffer is idle again and may be
                    // re-granted; a duplicate already reclaimed it
                    if let Some(id) = h.dest_buf {
                        let class = self.recv_bufs.class_of(id);
                        self.recv_bufs.reclaim(class, [id]);
                    }
                }
            }
        }
        if self.config.do_ack {
            self.queue_ack(rail_idx, &h, status)?;
        }
        Ok(delivered)
    }

    fn queue_ack(&mut self, rail_idx: usize, h: &DataHeader, status: AckStatus) -> Result<()> {
        let delivered_through = self
            .delivered
            .get(&h.sender)
            .map_or(0, |t| t.largest_in_order());
        let mut frag = match self.frag_pool.acquire(rail_idx) {
            Ok(f) => f,
            Err(TransportError::TempOutOfResource { .. }) => {
                // no descriptor for the ack; the sender retransmits
                warn!(sender = h.sender, frag_seq = h.frag_seq, "ack suppressed, pool empty");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        frag.reset();
        frag.msg_type = CtlMsgType::DataAck;
        frag.rail = rail_idx;
        frag.dest = h.sender;
        frag.free_when_done = true;
        frag.header = Some(CtlHeader::DataAck(AckHeader {
            status,
            sender: self.my_proc,
            dest: h.sender,
            msg_seq: h.msg_seq,
            frag_seq: h.frag_seq,
            msg_id: h.msg_id,
            delivered_through,
        }));
        self.rails[rail_idx].enqueue_ctl(frag);
        Ok(())
    }

    fn handle_ack(&mut self, h: &AckHeader) {
        if let Some(msg) = self.messages.get_mut(&h.msg_id) {
            if let Some(pos) = msg
                .to_ack
                .iter()
                .position(|f| f.msg_type == CtlMsgType::Data && f.frag_seq == h.frag_seq)
            {
                let mut frag = msg.to_ack.swap_remove(pos);
                if let Some(slot) = frag.slot.take() {
                    self.throttle.free_slot(slot);
                }
                match h.status {
                    AckStatus::Good => {
                        frag.reset();
                        self.frag_pool.release(frag);
                        msg.num_acked += 1;
                        self.stats.frags_acked += 1;
                    }
                    AckStatus::DataCorrupt => {
                        // arrived mangled; send it again right away
                        frag.time_sent = None;
                        msg.to_send.push_back(frag);
                    }
                }
            } else {
                trace!(msg_id = h.msg_id, frag_seq = h.frag_seq, "duplicate ack");
            }
        } else {
            // late ack for a completed message
            trace!(msg_id = h.msg_id, frag_seq = h.frag_seq, "ack for retired message");
        }
        if h.status == AckStatus::Good && h.delivered_through > 0 {
            self.retire_through(h.sender, h.delivered_through);
        }
    }

    /// Retires every in-flight fragment covered by the peer's cumulative
    /// delivery watermark, recovering fragments whose explicit ack was lost.
    fn retire_through(&mut self, dest: u32, through: u64) {
        for msg in self.messages.values_mut() {
            if msg.dest != dest {
                continue;
            }
            let mut i = 0;
            while i < msg.to_ack.len() {
                if msg.to_ack[i].msg_type == CtlMsgType::Data && msg.to_ack[i].frag_seq <= through {
                    let mut frag = msg.to_ack.swap_remove(i);
                    trace!(
                        msg_id = msg.id,
                        frag_seq = frag.frag_seq,
                        through,
                        "fragment retired by delivery watermark"
                    );
                    if let Some(slot) = frag.slot.take() {
                        self.throttle.free_slot(slot);
                    }
                    frag.reset();
                    self.frag_pool.release(frag);
                    msg.num_acked += 1;
                    self.stats.frags_acked += 1;
                } else {
                    i += 1;
                }
            }
            // a fragment requeued for retransmit may already be delivered
            let mut i = 0;
            while i < msg.to_send.len() {
                let covered = msg.to_send[i].msg_type == CtlMsgType::Data
                    && msg.to_send[i].transmit_count > 0
                    && msg.to_send[i].frag_seq <= through;
                if covered {
                    let Some(mut frag) = msg.to_send.remove(i) else {
                        break;
                    };
                    if let Some(slot) = frag.slot.take() {
                        self.throttle.free_slot(slot);
                    }
                    frag.reset();
                    self.frag_pool.release(frag);
                    msg.num_acked += 1;
                    self.stats.frags_acked += 1;
                } else {
                    i += 1;
                }
            }
        }
    }

    fn handle_mem_request(&mut self, rail_idx: usize, h: &MemRequestHeader) -> Result<()> {
        let ids = self.recv_bufs.grant(h.buf_type, MEM_GRANT_MAX_BUFS);
        let mut frag = match self.frag_pool.acquire(rail_idx) {
            Ok(f) => f,
            Err(TransportError::TempOutOfResource { .. }) => {
                self.recv_bufs.reclaim(h.buf_type, ids);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        trace!(sender = h.sender, granted = ids.len(), "memory request");
        frag.reset();
        frag.msg_type = CtlMsgType::MemRequestAck;
        frag.rail = rail_idx;
        frag.dest = h.sender;
        frag.free_when_done = true;
        frag.header = Some(CtlHeader::MemRequestAck(MemRequestAckHeader {
            sender: self.my_proc,
            dest: h.sender,
            msg_seq: h.msg_seq,
            offset: h.offset,
            buf_type: h.buf_type,
            buf_bytes: self.recv_bufs.buf_bytes(h.buf_type),
            buf_ids: ids,
        }));
        self.rails[rail_idx].enqueue_ctl(frag);
        Ok(())
    }

    fn handle_mem_grant(&mut self, rail_idx: usize, h: &MemRequestAckHeader) {
        // an empty grant just means ask again later
        for &id in &h.buf_ids {
            self.rails[rail_idx].credits.push(
                h.sender,
                h.buf_type,
                RemoteBuf {
                    id,
                    bytes: h.buf_bytes,
                },
            );
        }
    }

    fn handle_mem_release(&mut self, h: &MemReleaseHeader) -> Result<()> {
        let tracker = self.release_seqs_seen.entry(h.sender).or_default();
        if tracker.record_if_not_recorded(h.release_seq, h.release_seq)? == Recorded::Complete {
            trace!(sender = h.sender, release_seq = h.release_seq, "duplicate release");
            return Ok(());
        }
        self.recv_bufs.reclaim(h.buf_type, h.buf_ids.iter().copied());
        Ok(())
    }

    // ---- housekeeping ----

    /// Periodic sweep returning idle credits beyond the configured working
    /// set to their owners.
    fn release_memory(&mut self, now: Instant) -> Result<()> {
        if let Some(last) = self.last_mem_release {
            if now.duration_since(last) < self.config.mem_release_interval {
                return Ok(());
            }
        }
        self.last_mem_release = Some(now);
        for rail_idx in 0..self.rails.len() {
            if !self.rails[rail_idx].ok {
                continue;
            }
            for dest in self.rails[rail_idx].credits.dests_with_credits() {
                for buf_type in [BufType::Small, BufType::Large] {
                    let count = self.rails[rail_idx].credits.count(dest, buf_type);
                    if count <= self.config.min_idle_credits {
                        continue;
                    }
                    let excess = count - self.config.min_idle_credits;
                    let bufs = self.rails[rail_idx].credits.pop_lru(
                        dest,
                        buf_type,
                        excess.min(MEM_RELEASE_MAX_BUFS),
                    );
                    if bufs.is_empty() {
                        continue;
                    }
                    let mut frag = match self.frag_pool.acquire(rail_idx) {
                        Ok(f) => f,
                        Err(TransportError::TempOutOfResource { .. }) => {
                            for b in bufs {
                                self.rails[rail_idx].credits.push(dest, buf_type, b);
                            }
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    let seq = {
                        let e = self.next_release_seq.entry(dest).or_insert(1);
                        let s = *e;
                        *e += 1;
                        s
                    };
                    frag.reset();
                    frag.msg_type = CtlMsgType::MemRelease;
                    frag.rail = rail_idx;
                    frag.dest = dest;
                    frag.free_when_done = true;
                    frag.header = Some(CtlHeader::MemRelease(MemReleaseHeader {
                        sender: self.my_proc,
                        dest,
                        buf_type,
                        release_seq: seq,
                        buf_ids: bufs.iter().map(|b| b.id).collect(),
                    }));
                    self.rails[rail_idx].enqueue_ctl(frag);
                    self.stats.mem_releases_sent += 1;
                }
            }
        }
        Ok(())
    }

    /// Flushes queued control frames on every rail.
    fn send_ctl_msgs(&mut self, now: Instant) -> Result<()> {
        for rail_idx in 0..self.rails.len() {
            if !self.rails[rail_idx].has_ctl_work() {
                continue;
            }
            if !self.rails[rail_idx].ok {
                self.fail_rail(rail_idx)?;
                continue;
            }
            let mut queues = self.rails[rail_idx].take_ctl_queues();
            let device = self.rails[rail_idx].device.clone();
            let mut failed = false;
            'types: for queue in queues.iter_mut() {
                while let Some(mut frag) = queue.pop_front() {
                    let slot = match frag.slot.take() {
                        Some(s) => s,
                        None => match self.throttle.get_slot(rail_idx) {
                            Some(s) => s,
                            None => {
                                queue.push_front(frag);
                                break 'types;
                            }
                        },
                    };
                    let Some(header) = frag.header.clone() else {
                        self.throttle.free_slot(slot);
                        return Err(TransportError::Fatal {
                            reason: "control frag without header".into(),
                        });
                    };
                    let frame = wire::encode(&header, self.config.checksum_kind)?;
                    match device.post(&frame, None, frag.dest, slot.token()) {
                        Ok(()) => {
                            frag.slot = Some(slot);
                            frag.time_sent = Some(now);
                            frag.transmit_count += 1;
                            self.stats.ctl_frames_sent += 1;
                            self.rails[rail_idx].note_posted(frag);
                        }
                        Err(DeviceError::Busy) => {
                            frag.slot = Some(slot);
                            queue.push_front(frag);
                            break 'types;
                        }
                        Err(DeviceError::SubpathFailed) => {
                            self.throttle.free_slot(slot);
                            queue.push_front(frag);
                            failed = true;
                            break 'types;
                        }
                    }
                }
            }
            for queue in queues.iter_mut() {
                for frag in queue.drain(..) {
                    self.rails[rail_idx].enqueue_ctl(frag);
                }
            }
            if failed {
                self.fail_rail(rail_idx)?;
            }
        }
        Ok(())
    }

    /// Reaps posted control frames whose local completion has fired.
    /// Everything queued on a dead rail is reaped unconditionally.
    fn clean_ctl_msgs(&mut self) {
        for rail_idx in 0..self.rails.len() {
            if !self.rails[rail_idx].has_pending_completions() {
                continue;
            }
            let rail_ok = self.rails[rail_idx].ok;
            let mut queues = self.rails[rail_idx].take_ack_queues();
            for queue in queues.iter_mut() {
                while let Some(mut frag) = queue.pop_front() {
                    let done = !rail_ok
                        || (frag.free_when_done
                            && frag
                                .slot
                                .as_ref()
                                .map_or(true, |s| self.throttle.is_slot_ready(s)));
                    if done {
                        if let Some(slot) = frag.slot.take() {
                            self.throttle.free_slot(slot);
                        }
                        frag.reset();
                        self.frag_pool.release(frag);
                    } else {
                        self.rails[rail_idx].note_posted(frag);
                    }
                }
            }
        }
    }

    /// When acks are off, a data fragment completes as soon as its local
    /// send event fires.
    fn reap_completions(&mut self) {
        if self.config.do_ack {
            return;
        }
        for msg in self.messages.values_mut() {
            let mut i = 0;
            while i < msg.to_ack.len() {
                let ready = msg.to_ack[i]
                    .slot
                    .as_ref()
                    .map_or(true, |s| self.throttle.is_slot_ready(s));
                if ready {
                    let mut frag = msg.to_ack.swap_remove(i);
                    if let Some(slot) = frag.slot.take() {
                        self.throttle.free_slot(slot);
                    }
                    frag.reset();
                    self.frag_pool.release(frag);
                    msg.num_done += 1;
                } else {
                    i += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimRail;
    use std::time::Duration;

    fn test_config() -> TransportConfig {
        TransportConfig {
            n_rails: 2,
            concurrent_dmas: 8,
            small_buf_bytes: 256,
            large_buf_bytes: 1024,
            retrans_time: Duration::from_millis(100),
            mem_request_interval: Duration::ZERO,
            mem_release_interval: Duration::from_secs(3600),
            min_idle_credits: 0,
            n_small_recv_bufs: 8,
            n_large_recv_bufs: 8,
            ..Default::default()
        }
    }

    struct Pair {
        a: PathEngine,
        b: PathEngine,
        a_rails: Vec<Arc<SimRail>>,
        b_rails: Vec<Arc<SimRail>>,
    }

    fn pair(config: TransportConfig) -> Pair {
        let mut a_rails = Vec::new();
        let mut b_rails = Vec::new();
        for _ in 0..config.n_rails {
            let (a, b) = SimRail::pair();
            a_rails.push(a);
            b_rails.push(b);
        }
        let a_devs: Vec<Arc<dyn RailDevice>> =
            a_rails.iter().map(|r| r.clone() as Arc<dyn RailDevice>).collect();
        let b_devs: Vec<Arc<dyn RailDevice>> =
            b_rails.iter().map(|r| r.clone() as Arc<dyn RailDevice>).collect();
        let a = PathEngine::new(config.clone(), 0, a_devs).unwrap();
        let b = PathEngine::new(config, 1, b_devs).unwrap();
        Pair {
            a,
            b,
            a_rails,
            b_rails,
        }
    }

    /// Drives both endpoints until the message completes at `a`.
    fn drive(p: &mut Pair, msg_id: u64, mut now: Instant) -> bool {
        for _ in 0..100 {
            if p.a.send(msg_id, now).unwrap() {
                return true;
            }
            p.a.push(now).unwrap();
            p.b.receive().unwrap();
            p.b.push(now).unwrap();
            p.a.receive().unwrap();
            p.a.push(now).unwrap();
            now += Duration::from_millis(1);
        }
        false
    }

    fn drain_inbound(engine: &mut PathEngine) -> Vec<ReceivedData> {
        let mut out = Vec::new();
        while let Some(r) = engine.take_inbound() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_inline_message_round_trip() {
        let mut p = pair(test_config());
        let id = p.a.post_message(1, Bytes::from_static(b"hello, rail"));
        assert!(drive(&mut p, id, Instant::now()));
        let got = drain_inbound(&mut p.b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sender, 0);
        assert_eq!(got[0].msg_seq, 1);
        assert_eq!(got[0].data.as_ref(), b"hello, rail");
        assert_eq!(p.a.stats().frags_sent, 1);
        assert_eq!(p.a.stats().frags_acked, 1);
        assert_eq!(p.b.stats().frags_delivered, 1);
    }

    #[test]
    fn test_empty_message_round_trip() {
        let mut p = pair(test_config());
        let id = p.a.post_message(1, Bytes::new());
        assert!(drive(&mut p, id, Instant::now()));
        let got = drain_inbound(&mut p.b);
        assert_eq!(got.len(), 1);
        assert!(got[0].data.is_empty());
    }

    #[test]
    fn test_large_message_uses_credit_flow() {
        let mut p = pair(test_config());
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let id = p.a.post_message(1, Bytes::from(data.clone()));
        assert!(drive(&mut p, id, Instant::now()));

        let mut got = drain_inbound(&mut p.b);
        got.sort_by_key(|r| r.offset);
        assert_eq!(got.len(), 3);
        let mut assembled = Vec::new();
        for r in &got {
            assert_eq!(r.offset as usize, assembled.len());
            assert_eq!(r.msg_len, 3000);
            assembled.extend_from_slice(&r.data);
        }
        assert_eq!(assembled, data);
        assert!(p.a.stats().mem_requests_sent >= 1);
        assert_eq!(p.a.stats().frags_sent, 3);
        assert_eq!(p.a.stats().frags_retransmitted, 0);
    }

    #[test]
    fn test_fragments_stripe_across_rails() {
        let mut p = pair(test_config());
        let now = Instant::now();
        for _ in 0..4 {
            let id = p.a.post_message(1, Bytes::from_static(b"stripe"));
            assert!(drive(&mut p, id, now));
        }
        assert!(p.a_rails[0].posted_count() >= 1);
        assert!(p.a_rails[1].posted_count() >= 1);
    }

    #[test]
    fn test_failover_to_healthy_rail() {
        let mut p = pair(test_config());
        p.a_rails[0].set_fail_sends(true);
        let now = Instant::now();
        // round-robin will land one of these on the dead rail
        let id1 = p.a.post_message(1, Bytes::from_static(b"one"));
        let id2 = p.a.post_message(1, Bytes::from_static(b"two"));
        assert!(drive(&mut p, id1, now));
        assert!(drive(&mut p, id2, now));
        assert!(!p.a.rail_ok(0));
        assert!(p.a.rail_ok(1));
        assert_eq!(p.a.stats().rail_failovers, 1);
        assert_eq!(drain_inbound(&mut p.b).len(), 2);
    }

    #[test]
    fn test_all_rails_dead_is_fatal() {
        let mut p = pair(test_config());
        p.a_rails[0].set_fail_sends(true);
        p.a_rails[1].set_fail_sends(true);
        let id = p.a.post_message(1, Bytes::from_static(b"doomed"));
        assert_eq!(p.a.send(id, Instant::now()), Err(TransportError::BadPath));
    }

    #[test]
    fn test_retransmit_after_loss() {
        let mut p = pair(test_config());
        p.a_rails[0].set_drop_frames(true);
        p.a_rails[1].set_drop_frames(true);
        let t0 = Instant::now();
        let id = p.a.post_message(1, Bytes::from_static(b"lossy"));
        assert!(!p.a.send(id, t0).unwrap());
        assert_eq!(p.a.stats().frags_sent, 1);
        assert_eq!(p.b.receive().unwrap(), 0);

        // before the backoff deadline nothing is resent
        p.a.push(t0 + Duration::from_millis(50)).unwrap();
        assert_eq!(p.a.stats().frags_sent, 1);

        // first deadline is sent + base * 2
        p.a_rails[0].set_drop_frames(false);
        p.a_rails[1].set_drop_frames(false);
        let t1 = t0 + Duration::from_millis(250);
        p.a.push(t1).unwrap();
        assert_eq!(p.a.stats().frags_sent, 2);
        assert_eq!(p.a.stats().frags_retransmitted, 1);

        assert_eq!(p.b.receive().unwrap(), 1);
        p.b.push(t1).unwrap();
        p.a.receive().unwrap();
        assert!(p.a.send(id, t1).unwrap());
    }

    #[test]
    fn test_retransmit_backoff_doubles() {
        let mut p = pair(test_config());
        p.a_rails[0].set_drop_frames(true);
        p.a_rails[1].set_drop_frames(true);
        let t0 = Instant::now();
        let id = p.a.post_message(1, Bytes::from_static(b"backoff"));
        p.a.send(id, t0).unwrap();

        // second transmit at t0 + 200ms
        let t1 = t0 + Duration::from_millis(250);
        p.a.push(t1).unwrap();
        assert_eq!(p.a.stats().frags_sent, 2);

        // third deadline is t1 + 400ms; probing before it does nothing
        p.a.push(t1 + Duration::from_millis(200)).unwrap();
        assert_eq!(p.a.stats().frags_sent, 2);
        p.a.push(t1 + Duration::from_millis(450)).unwrap();
        assert_eq!(p.a.stats().frags_sent, 3);
    }

    #[test]
    fn test_duplicate_fragment_suppressed() {
        let mut p = pair(test_config());
        let t0 = Instant::now();
        // the first ack is lost, forcing a retransmit
        p.b_rails[0].set_drop_frames(true);
        p.b_rails[1].set_drop_frames(true);
        let id = p.a.post_message(1, Bytes::from_static(b"once only"));
        p.a.send(id, t0).unwrap();
        assert_eq!(p.b.receive().unwrap(), 1);
        p.b.push(t0).unwrap();
        p.a.receive().unwrap();

        let t1 = t0 + Duration::from_millis(250);
        p.a.push(t1).unwrap();
        p.b_rails[0].set_drop_frames(false);
        p.b_rails[1].set_drop_frames(false);
        // the retransmit is recognized as a duplicate but still acked
        assert_eq!(p.b.receive().unwrap(), 0);
        assert_eq!(p.b.stats().dup_frags_dropped, 1);
        p.b.push(t1).unwrap();
        p.a.receive().unwrap();
        assert!(p.a.send(id, t1).unwrap());
        assert_eq!(drain_inbound(&mut p.b).len(), 1);
    }

    #[test]
    fn test_corrupt_frame_counted_and_dropped() {
        let mut p = pair(test_config());
        let token = crate::dma::EventToken::new();
        let garbage = [1u8; wire::CTL_FRAME_BYTES];
        p.a_rails[0].post(&garbage, None, 1, &token).unwrap();
        assert_eq!(p.b.receive().unwrap(), 0);
        assert_eq!(p.b.stats().checksum_failures, 1);
    }

    #[test]
    fn test_corrupt_frame_fatal_without_acks() {
        let config = TransportConfig {
            do_ack: false,
            ..test_config()
        };
        let mut p = pair(config);
        let token = crate::dma::EventToken::new();
        let garbage = [1u8; wire::CTL_FRAME_BYTES];
        p.a_rails[0].post(&garbage, None, 1, &token).unwrap();
        assert!(matches!(
            p.b.receive(),
            Err(TransportError::Fatal { .. })
        ));
    }

    #[test]
    fn test_acks_off_completes_on_local_event() {
        let config = TransportConfig {
            do_ack: false,
            ..test_config()
        };
        let mut p = pair(config);
        let t0 = Instant::now();
        let id = p.a.post_message(1, Bytes::from_static(b"fire and forget"));
        assert!(!p.a.send(id, t0).unwrap());
        p.a.push(t0).unwrap();
        assert!(p.a.send(id, t0).unwrap());
        assert_eq!(p.b.receive().unwrap(), 1);
        // the receiver sends nothing back
        p.b.push(t0).unwrap();
        assert_eq!(p.b.stats().ctl_frames_sent, 0);
    }

    #[test]
    fn test_needs_push_tracks_pending_work() {
        let mut p = pair(test_config());
        let t0 = Instant::now();
        assert!(!p.a.needs_push(t0));
        assert!(!p.b.needs_push(t0));

        let id = p.a.post_message(1, Bytes::from_static(b"work"));
        assert!(p.a.needs_push(t0));
        p.a.send(id, t0).unwrap();
        p.b.receive().unwrap();
        // the queued ack makes the receiver busy
        assert!(p.b.needs_push(t0));
        p.b.push(t0).unwrap();
        assert!(!p.b.needs_push(t0));
    }

    #[test]
    fn test_idle_credits_flow_home() {
        let config = TransportConfig {
            mem_release_interval: Duration::ZERO,
            ..test_config()
        };
        let mut p = pair(config);
        let t0 = Instant::now();
        let data = Bytes::from(vec![7u8; 3000]);
        let id = p.a.post_message(1, data);
        assert!(drive(&mut p, id, t0));
        // sweep any credits still held, then let the release land
        p.a.push(t0 + Duration::from_secs(1)).unwrap();
        p.a.push(t0 + Duration::from_secs(2)).unwrap();
        p.b.receive().unwrap();
        assert!(p.a.stats().mem_releases_sent >= 1);
        assert_eq!(p.b.recv_bufs_available(BufType::Large), 8);
    }

    #[test]
    fn test_send_unknown_message() {
        let mut p = pair(test_config());
        assert_eq!(
            p.a.send(99, Instant::now()),
            Err(TransportError::UnknownMessage(99))
        );
    }

    #[test]
    fn test_device_count_must_match_rails() {
        let (a, _b) = SimRail::pair();
        let err = PathEngine::new(test_config(), 0, vec![a as Arc<dyn RailDevice>]);
        assert!(matches!(err, Err(TransportError::Fatal { .. })));
    }

    #[test]
    fn test_duplicate_credit_frag_reclaims_buffer_once() {
        let mut p = pair(test_config());
        let t0 = Instant::now();
        let id = p.a.post_message(1, Bytes::from(vec![9u8; 1000]));
        // negotiate credits: the first send only asks for buffers
        p.a.send(id, t0).unwrap();
        p.a.push(t0).unwrap();
        p.b.receive().unwrap();
        p.b.push(t0).unwrap();
        p.a.receive().unwrap();
        assert_eq!(p.b.recv_bufs_available(BufType::Large), 0);

        // the ack is lost, so the sender retries into the same remote buffer
        p.b_rails[0].set_drop_frames(true);
        p.b_rails[1].set_drop_frames(true);
        p.a.send(id, t0).unwrap();
        assert_eq!(p.b.receive().unwrap(), 1);
        p.b.push(t0).unwrap();
        assert_eq!(p.b.recv_bufs_available(BufType::Large), 1);

        let t1 = t0 + Duration::from_millis(250);
        p.a.push(t1).unwrap();
        assert_eq!(p.b.receive().unwrap(), 0);
        assert_eq!(p.b.stats().dup_frags_dropped, 1);
        // the duplicate only re-acks; its buffer was already reclaimed
        assert_eq!(p.b.recv_bufs_available(BufType::Large), 1);
    }

    #[test]
    fn test_cumulative_ack_retires_earlier_fragments() {
        let mut p = pair(test_config());
        let t0 = Instant::now();
        let id1 = p.a.post_message(1, Bytes::from_static(b"first"));
        let id2 = p.a.post_message(1, Bytes::from_static(b"second"));
        p.a.send(id1, t0).unwrap();
        p.a.send(id2, t0).unwrap();
        assert_eq!(p.b.receive().unwrap(), 2);

        // both explicit acks are lost; a single later ack carries the
        // cumulative delivery watermark covering both fragments
        let ack = CtlHeader::DataAck(AckHeader {
            status: AckStatus::Good,
            sender: 1,
            dest: 0,
            msg_seq: 2,
            frag_seq: 2,
            msg_id: id2,
            delivered_through: 2,
        });
        let frame = wire::encode(&ack, crate::checksum::ChecksumKind::Additive).unwrap();
        let token = crate::dma::EventToken::new();
        p.b_rails[0].post(&frame, None, 0, &token).unwrap();
        p.a.receive().unwrap();
        assert!(p.a.send(id1, t0).unwrap());
        assert!(p.a.send(id2, t0).unwrap());
        assert_eq!(p.a.stats().frags_acked, 2);
    }

    #[test]
    fn test_failed_rail_credits_migrate() {
        let config = TransportConfig {
            mem_request_interval: Duration::from_secs(3600),
            ..test_config()
        };
        let mut p = pair(config);
        let t0 = Instant::now();
        let id = p.a.post_message(1, Bytes::from(vec![1u8; 1000]));
        // bank credits on rail 1, then kill it
        p.a.send(id, t0).unwrap();
        p.a.push(t0).unwrap();
        p.b.receive().unwrap();
        p.b.push(t0).unwrap();
        p.a.receive().unwrap();
        p.a_rails[1].set_fail_sends(true);
        assert!(drive(&mut p, id, t0));
        assert!(!p.a.rail_ok(1));

        // the surviving rail inherited the stranded credits, so the next
        // message needs no new grant
        let id2 = p.a.post_message(1, Bytes::from(vec![2u8; 1000]));
        assert!(drive(&mut p, id2, t0 + Duration::from_secs(1)));
        assert_eq!(p.a.stats().mem_requests_sent, 1);
        assert_eq!(drain_inbound(&mut p.b).len(), 2);
    }

    #[test]
    fn test_msg_seq_increments_per_destination() {
        let mut p = pair(test_config());
        let now = Instant::now();
        let id1 = p.a.post_message(1, Bytes::from_static(b"a"));
        assert!(drive(&mut p, id1, now));
        let id2 = p.a.post_message(1, Bytes::from_static(b"b"));
        assert!(drive(&mut p, id2, now));
        let got = drain_inbound(&mut p.b);
        assert_eq!(got[0].msg_seq, 1);
        assert_eq!(got[1].msg_seq, 2);
    }
}
