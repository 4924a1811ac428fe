//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumKind;

/// Tunables for a transport path.
///
/// All fields have production defaults; deserialize from JSON to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of interconnect rails the path stripes over.
    pub n_rails: usize,
    /// Maximum in-flight DMA descriptors per rail.
    pub concurrent_dmas: usize,
    /// Reclaim completed DMA slots lazily when the table fills.
    pub reclaim_dma_slots: bool,
    /// Payload capacity of a small receive buffer.
    pub small_buf_bytes: usize,
    /// Payload capacity of a large receive buffer.
    pub large_buf_bytes: usize,
    /// Run the acknowledgment protocol. When false, fragments complete when
    /// their local send event fires and reliability is the fabric's problem.
    pub do_ack: bool,
    /// Checksum fragment payloads in addition to headers.
    pub do_checksum: bool,
    /// Checksum function shared by both ends.
    pub checksum_kind: ChecksumKind,
    /// Base retransmission interval; doubles per transmit up to
    /// `max_retrans_power`.
    pub retrans_time: Duration,
    /// Cap on the retransmission backoff exponent.
    pub max_retrans_power: u32,
    /// Minimum gap between memory requests for the same message.
    pub mem_request_interval: Duration,
    /// Gap between sweeps that return idle remote buffers to their owner.
    pub mem_release_interval: Duration,
    /// Idle credits kept per destination and class; only the excess is
    /// returned by a release sweep.
    pub min_idle_credits: usize,
    /// Cap on concurrently outstanding send fragments per rail, or None for
    /// pool-growth-limited.
    pub max_outstanding_frags: Option<usize>,
    /// Small receive buffers advertised to peers.
    pub n_small_recv_bufs: usize,
    /// Large receive buffers advertised to peers.
    pub n_large_recv_bufs: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            n_rails: 2,
            concurrent_dmas: 128,
            reclaim_dma_slots: true,
            small_buf_bytes: 2048,
            large_buf_bytes: 16384,
            do_ack: true,
            do_checksum: true,
            checksum_kind: ChecksumKind::default(),
            retrans_time: Duration::from_secs(1),
            max_retrans_power: 10,
            mem_request_interval: Duration::from_millis(250),
            mem_release_interval: Duration::from_secs(5),
            min_idle_credits: 4,
            max_outstanding_frags: None,
            n_small_recv_bufs: 64,
            n_large_recv_bufs: 32,
        }
    }
}

impl TransportConfig {
    /// Checks internal consistency before a path is constructed.
    pub fn validate(&self) -> crate::Result<()> {
        if self.n_rails == 0 {
            return Err(crate::TransportError::Fatal {
                reason: "n_rails must be at least 1".into(),
            });
        }
        if self.concurrent_dmas == 0 {
            return Err(crate::TransportError::Fatal {
                reason: "concurrent_dmas must be at least 1".into(),
            });
        }
        if self.small_buf_bytes == 0 || self.large_buf_bytes < self.small_buf_bytes {
            return Err(crate::TransportError::Fatal {
                reason: "buffer sizes must satisfy 0 < small <= large".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_rails_rejected() {
        let cfg = TransportConfig {
            n_rails: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_buf_sizes_rejected() {
        let cfg = TransportConfig {
            small_buf_bytes: 4096,
            large_buf_bytes: 1024,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = TransportConfig {
            n_rails: 4,
            checksum_kind: ChecksumKind::Crc32,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_rails, 4);
        assert_eq!(back.checksum_kind, ChecksumKind::Crc32);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: TransportConfig = serde_json::from_str(r#"{"n_rails": 3}"#).unwrap();
        assert_eq!(cfg.n_rails, 3);
        assert_eq!(cfg.concurrent_dmas, 128);
        assert!(cfg.do_ack);
    }
}
