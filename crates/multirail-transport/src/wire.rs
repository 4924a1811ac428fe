//! Control frame wire format.
//!
//! Every control message travels in a fixed 128-byte frame: a type word,
//! type-specific fields, zero padding, and a 32-bit checksum over the first
//! 124 bytes in the last word. Small data fragments ride inline in the frame
//! itself; larger fragments carry a remote buffer id and put the payload in
//! a separate DMA.
//!
//! All fields are little-endian.

use bytes::{Buf, BufMut, Bytes};

use crate::checksum::{self, ChecksumKind};
use crate::credit::BufType;
use crate::{Result, TransportError};

/// Size of every control frame.
pub const CTL_FRAME_BYTES: usize = 128;
/// Payload bytes a data frame can carry inline.
pub const CTL_DATA_BYTES: usize = 52;
/// Buffer ids a memory-request ack can grant.
pub const MEM_GRANT_MAX_BUFS: usize = 19;
/// Buffer ids a memory-release can return.
pub const MEM_RELEASE_MAX_BUFS: usize = 23;
/// Number of control message types.
pub const CTL_MSG_TYPES: usize = 5;

const CHECKSUM_OFFSET: usize = CTL_FRAME_BYTES - 4;
/// `dest_buf` value meaning the payload is inline in the frame.
const INLINE_DEST: u32 = u32::MAX;

/// Control message type tags. The values are the on-wire discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CtlMsgType {
    DataAck = 0,
    MemRequest = 1,
    MemRequestAck = 2,
    MemRelease = 3,
    Data = 4,
}

impl CtlMsgType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(CtlMsgType::DataAck),
            1 => Some(CtlMsgType::MemRequest),
            2 => Some(CtlMsgType::MemRequestAck),
            3 => Some(CtlMsgType::MemRelease),
            4 => Some(CtlMsgType::Data),
            _ => None,
        }
    }
}

/// Fragment delivery status carried in an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AckStatus {
    Good = 1,
    DataCorrupt = 2,
}

impl AckStatus {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(AckStatus::Good),
            2 => Some(AckStatus::DataCorrupt),
            _ => None,
        }
    }
}

/// One data fragment. `inline` is Some for payloads of at most
/// [`CTL_DATA_BYTES`]; otherwise `dest_buf` names the remote buffer the
/// payload DMA targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DataHeader {
    pub sender: u32,
    pub dest: u32,
    pub msg_seq: u64,
    pub frag_seq: u64,
    /// Sender-side message handle, echoed back in the ack.
    pub msg_id: u64,
    pub msg_len: u64,
    pub offset: u64,
    pub frag_len: u32,
    pub payload_checksum: u32,
    pub dest_buf: Option<u32>,
    pub inline: Option<Bytes>,
}

/// Acknowledgment of one data fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    pub status: AckStatus,
    pub sender: u32,
    pub dest: u32,
    pub msg_seq: u64,
    pub frag_seq: u64,
    pub msg_id: u64,
    /// Largest fragment sequence delivered in order by the receiver.
    pub delivered_through: u64,
}

/// Request for remote receive buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRequestHeader {
    pub sender: u32,
    pub dest: u32,
    pub msg_seq: u64,
    pub offset: u64,
    pub bytes_needed: u64,
    pub buf_type: BufType,
}

/// Grant of remote receive buffers. An empty grant tells the requester to
/// ask again later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRequestAckHeader {
    pub sender: u32,
    pub dest: u32,
    pub msg_seq: u64,
    pub offset: u64,
    pub buf_type: BufType,
    pub buf_bytes: u32,
    pub buf_ids: Vec<u32>,
}

/// Return of idle buffer credits to their owner. `release_seq` dedupes
/// retransmitted releases on the receive side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemReleaseHeader {
    pub sender: u32,
    pub dest: u32,
    pub buf_type: BufType,
    pub release_seq: u64,
    pub buf_ids: Vec<u32>,
}

/// A decoded control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CtlHeader {
    Data(DataHeader),
    DataAck(AckHeader),
    MemRequest(MemRequestHeader),
    MemRequestAck(MemRequestAckHeader),
    MemRelease(MemReleaseHeader),
}

impl CtlHeader {
    pub fn msg_type(&self) -> CtlMsgType {
        match self {
            CtlHeader::Data(_) => CtlMsgType::Data,
            CtlHeader::DataAck(_) => CtlMsgType::DataAck,
            CtlHeader::MemRequest(_) => CtlMsgType::MemRequest,
            CtlHeader::MemRequestAck(_) => CtlMsgType::MemRequestAck,
            CtlHeader::MemRelease(_) => CtlMsgType::MemRelease,
        }
    }

    pub fn dest(&self) -> u32 {
        match self {
            CtlHeader::Data(h) => h.dest,
            CtlHeader::DataAck(h) => h.dest,
            CtlHeader::MemRequest(h) => h.dest,
            CtlHeader::MemRequestAck(h) => h.dest,
            CtlHeader::MemRelease(h) => h.dest,
        }
    }
}

/// Encodes a control frame, computing the trailing checksum.
pub fn encode(header: &CtlHeader, kind: ChecksumKind) -> Result<[u8; CTL_FRAME_BYTES]> {
    let mut frame = [0u8; CTL_FRAME_BYTES];
    {
        let mut buf = &mut frame[..];
        buf.put_u32_le(header.msg_type() as u32);
        match header {
            CtlHeader::Data(h) => {
                if let Some(inline) = &h.inline {
                    if inline.len() > CTL_DATA_BYTES {
                        return Err(TransportError::Fatal {
                            reason: format!("inline payload of {} bytes", inline.len()),
                        });
                    }
                }
                buf.put_u32_le(h.sender);
                buf.put_u32_le(h.dest);
                buf.put_u32_le(h.frag_len);
                buf.put_u64_le(h.msg_seq);
                buf.put_u64_le(h.frag_seq);
                buf.put_u64_le(h.msg_id);
                buf.put_u64_le(h.msg_len);
                buf.put_u64_le(h.offset);
                buf.put_u32_le(h.payload_checksum);
                buf.put_u32_le(h.dest_buf.unwrap_or(INLINE_DEST));
                if let Some(inline) = &h.inline {
                    buf.put_slice(inline);
                }
            }
            CtlHeader::DataAck(h) => {
                buf.put_u32_le(h.status as u32);
                buf.put_u32_le(h.sender);
                buf.put_u32_le(h.dest);
                buf.put_u64_le(h.msg_seq);
                buf.put_u64_le(h.frag_seq);
                buf.put_u64_le(h.msg_id);
                buf.put_u64_le(h.delivered_through);
            }
            CtlHeader::MemRequest(h) => {
                buf.put_u32_le(h.sender);
                buf.put_u32_le(h.dest);
                buf.put_u64_le(h.msg_seq);
                buf.put_u64_le(h.offset);
                buf.put_u64_le(h.bytes_needed);
                buf.put_u32_le(h.buf_type as u32);
            }
            CtlHeader::MemRequestAck(h) => {
                if h.buf_ids.len() > MEM_GRANT_MAX_BUFS {
                    return Err(TransportError::Fatal {
                        reason: format!("grant of {} buffer ids", h.buf_ids.len()),
                    });
                }
                buf.put_u32_le(h.sender);
                buf.put_u32_le(h.dest);
                buf.put_u64_le(h.msg_seq);
                buf.put_u64_le(h.offset);
                buf.put_u32_le(h.buf_type as u32);
                buf.put_u32_le(h.buf_bytes);
                buf.put_u32_le(h.buf_ids.len() as u32);
                for &id in &h.buf_ids {
                    buf.put_u32_le(id);
                }
            }
            CtlHeader::MemRelease(h) => {
                if h.buf_ids.len() > MEM_RELEASE_MAX_BUFS {
                    return Err(TransportError::Fatal {
                        reason: format!("release of {} buffer ids", h.buf_ids.len()),
                    });
                }
                buf.put_u32_le(h.sender);
                buf.put_u32_le(h.dest);
                buf.put_u32_le(h.buf_type as u32);
                buf.put_u64_le(h.release_seq);
                buf.put_u32_le(h.buf_ids.len() as u32);
                for &id in &h.buf_ids {
                    buf.put_u32_le(id);
                }
            }
        }
    }
    let sum = checksum::compute(kind, &frame[..CHECKSUM_OFFSET]);
    frame[CHECKSUM_OFFSET..].copy_from_slice(&sum.to_le_bytes());
    Ok(frame)
}

/// Decodes a control frame after verifying its checksum.
pub fn decode(frame: &[u8; CTL_FRAME_BYTES], kind: ChecksumKind) -> Result<CtlHeader> {
    let expected = u32::from_le_bytes(frame[CHECKSUM_OFFSET..].try_into().unwrap());
    let computed = checksum::compute(kind, &frame[..CHECKSUM_OFFSET]);
    if computed != expected {
        return Err(TransportError::ChecksumMismatch { expected, computed });
    }
    let mut buf = &frame[..CHECKSUM_OFFSET];
    let type_word = buf.get_u32_le();
    let msg_type =
        CtlMsgType::from_u32(type_word).ok_or(TransportError::UnknownCtlType(type_word))?;
    Ok(match msg_type {
        CtlMsgType::Data => {
            let sender = buf.get_u32_le();
            let dest = buf.get_u32_le();
            let frag_len = buf.get_u32_le();
            let msg_seq = buf.get_u64_le();
            let frag_seq = buf.get_u64_le();
            let msg_id = buf.get_u64_le();
            let msg_len = buf.get_u64_le();
            let offset = buf.get_u64_le();
            let payload_checksum = buf.get_u32_le();
            let dest_word = buf.get_u32_le();
            let (dest_buf, inline) = if dest_word == INLINE_DEST {
                if frag_len as usize > CTL_DATA_BYTES {
                    return Err(TransportError::Fatal {
                        reason: format!("inline fragment length {frag_len}"),
                    });
                }
                (None, Some(Bytes::copy_from_slice(&buf[..frag_len as usize])))
            } else {
                (Some(dest_word), None)
            };
            CtlHeader::Data(DataHeader {
                sender,
                dest,
                msg_seq,
                frag_seq,
                msg_id,
                msg_len,
                offset,
                frag_len,
                payload_checksum,
                dest_buf,
                inline,
            })
        }
        CtlMsgType::DataAck => {
            let status_word = buf.get_u32_le();
            let status = AckStatus::from_u32(status_word).ok_or(TransportError::Fatal {
                reason: format!("ack status {status_word}"),
            })?;
            CtlHeader::DataAck(AckHeader {
                status,
                sender: buf.get_u32_le(),
                dest: buf.get_u32_le(),
                msg_seq: buf.get_u64_le(),
                frag_seq: buf.get_u64_le(),
                msg_id: buf.get_u64_le(),
                delivered_through: buf.get_u64_le(),
            })
        }
        CtlMsgType::MemRequest => {
            let sender = buf.get_u32_le();
            let dest = buf.get_u32_le();
            let msg_seq = buf.get_u64_le();
            let offset = buf.get_u64_le();
            let bytes_needed = buf.get_u64_le();
            let type_word = buf.get_u32_le();
            let buf_type = BufType::from_u32(type_word).ok_or(TransportError::Fatal {
                reason: format!("buffer type {type_word}"),
            })?;
            CtlHeader::MemRequest(MemRequestHeader {
                sender,
                dest,
                msg_seq,
                offset,
                bytes_needed,
                buf_type,
            })
        }
        CtlMsgType::MemRequestAck => {
            let sender = buf.get_u32_le();
            let dest = buf.get_u32_le();
            let msg_seq = buf.get_u64_le();
            let offset = buf.get_u64_le();
            let type_word = buf.get_u32_le();
            let buf_type = BufType::from_u32(type_word).ok_or(TransportError::Fatal {
                reason: format!("buffer type {type_word}"),
            })?;
            let buf_bytes = buf.get_u32_le();
            let n = buf.get_u32_le() as usize;
            if n > MEM_GRANT_MAX_BUFS {
                return Err(TransportError::Fatal {
                    reason: format!("grant of {n} buffer ids"),
                });
            }
            let buf_ids = (0..n).map(|_| buf.get_u32_le()).collect();
            CtlHeader::MemRequestAck(MemRequestAckHeader {
                sender,
                dest,
                msg_seq,
                offset,
                buf_type,
                buf_bytes,
                buf_ids,
            })
        }
        CtlMsgType::MemRelease => {
            let sender = buf.get_u32_le();
            let dest = buf.get_u32_le();
            let type_word = buf.get_u32_le();
            let buf_type = BufType::from_u32(type_word).ok_or(TransportError::Fatal {
                reason: format!("buffer type {type_word}"),
            })?;
            let release_seq = buf.get_u64_le();
            let n = buf.get_u32_le() as usize;
            if n > MEM_RELEASE_MAX_BUFS {
                return Err(TransportError::Fatal {
                    reason: format!("release of {n} buffer ids"),
                });
            }
            let buf_ids = (0..n).map(|_| buf.get_u32_le()).collect();
            CtlHeader::MemRelease(MemReleaseHeader {
                sender,
                dest,
                buf_type,
                release_seq,
                buf_ids,
            })
        }
    })
}
