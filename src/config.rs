use std::time::Duration;
use anyhow::bail;
use crate::sequence::Sequence;
use crate::slice_header::SliceHeader;

/// Where the receiver starts consuming a peer's stream
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamStart {
    /// Start at the first key-aligned slice that arrives. This allows joining a stream in
    ///  progress, and recovers if the very first slice is lost.
    FirstKeyFrame,
    /// Start at a fixed sequence, typically [Sequence::FIRST]. Nothing is consumed until that
    ///  slice arrives.
    Sequence(Sequence),
}

/// Sequence comparisons are done in a half-space of the wrapping `u32` sequence numbers, and a
///  ring must fit into it
const MAX_RING_SIZE: usize = 1 << 31;

pub struct QueueConnConfig {
    /// The maximum datagram size on the transport, including the slice header. Datagrams are
    ///  never bigger than this, so it must be supported end-to-end.
    ///
    /// For an ICE path over UDP this is 8 KiB; for plain UDP over full Ethernet frames it is
    ///  `1500 - 20 - 8 = 1472` (IPV4).
    pub mtu: usize,

    /// Number of sent slices that are retained for re-sending. A NACK for a slice that is older
    ///  than this is unrecoverable. Must be a power of two.
    pub send_cache_size: usize,

    /// Number of slots in the receiver's reassembly ring. Must be a power of two.
    pub ring_size: usize,

    /// The number of consume steps a missing slice is waited for before it is NAK'ed (and
    ///  re-NAK'ed after every further `nack_wait` steps)
    pub nack_wait: u32,

    /// The number of consume steps after which the receiver gives up on a missing slice and
    ///  skips to the next key frame
    pub skip_threshold: u32,

    pub stream_start: StreamStart,

    /// The consumer runs a consume step at least this often, so gaps are detected even when no
    ///  slices arrive
    pub consume_poll_interval: Duration,

    /// capacity of the channel delivering reassembled frames; a full channel back-pressures the
    ///  consumer loop
    pub sink_capacity: usize,

    /// re-sends that are requested but not yet written; requests in excess of this are dropped
    pub resend_queue_capacity: usize,

    /// if set, video frames from the source are dropped until the first frame that contains a
    ///  parameter set or IDR unit
    pub wait_for_key_frame: bool,
}

impl QueueConnConfig {
    /// defaults for a negotiated ICE / UDP path with 8 KiB datagrams
    pub fn default_ice() -> QueueConnConfig {
        QueueConnConfig {
            mtu: 1 << 13,
            send_cache_size: 1 << 11,
            ring_size: 1 << 11,
            nack_wait: 1 << 3,
            skip_threshold: 1 << 4,
            stream_start: StreamStart::FirstKeyFrame,
            consume_poll_interval: Duration::from_millis(5),
            sink_capacity: 64,
            resend_queue_capacity: 256,
            wait_for_key_frame: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= SliceHeader::SERIALIZED_LEN + Sequence::SERIALIZED_LEN {
            bail!("MTU of {} is too small to hold a slice", self.mtu);
        }
        if !self.send_cache_size.is_power_of_two() {
            bail!("send cache size must be a power of two, was {}", self.send_cache_size);
        }
        if !self.ring_size.is_power_of_two() || self.ring_size < 2 {
            bail!("reassembly ring size must be a power of two of at least 2, was {}", self.ring_size);
        }
        if self.ring_size > MAX_RING_SIZE || self.send_cache_size > MAX_RING_SIZE {
            bail!("ring sizes must not exceed half the sequence number space");
        }
        if self.nack_wait >= self.skip_threshold {
            bail!("NACK wait ({}) must be below the skip threshold ({})", self.nack_wait, self.skip_threshold);
        }
        if self.sink_capacity == 0 || self.resend_queue_capacity == 0 {
            bail!("channel capacities must be positive");
        }
        if self.consume_poll_interval.is_zero() {
            bail!("consume poll interval must be positive");
        }

        Ok(())
    }

    pub fn max_slice_payload(&self) -> usize {
        self.mtu - SliceHeader::SERIALIZED_LEN
    }

    pub fn get_effective_reassembly_config(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            ring_size: self.ring_size,
            nack_wait: self.nack_wait,
            skip_threshold: self.skip_threshold,
            stream_start: self.stream_start,
        }
    }
}

/// The part of the configuration that drives the reassembly state machine
#[derive(Clone, Debug)]
pub struct ReassemblyConfig {
    pub ring_size: usize,
    pub nack_wait: u32,
    pub skip_threshold: u32,
    pub stream_start: StreamStart,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = QueueConnConfig::default_ice();
        config.validate().unwrap();
        assert_eq!(config.max_slice_payload(), 8192 - 5);
    }

    #[rstest]
    #[case::mtu_too_small(|c: &mut QueueConnConfig| c.mtu = 9)]
    #[case::cache_not_pow2(|c: &mut QueueConnConfig| c.send_cache_size = 1000)]
    #[case::cache_zero(|c: &mut QueueConnConfig| c.send_cache_size = 0)]
    #[case::ring_not_pow2(|c: &mut QueueConnConfig| c.ring_size = 12)]
    #[case::ring_one(|c: &mut QueueConnConfig| c.ring_size = 1)]
    #[case::wait_above_skip(|c: &mut QueueConnConfig| c.nack_wait = 16)]
    #[case::sink_zero(|c: &mut QueueConnConfig| c.sink_capacity = 0)]
    #[case::resend_zero(|c: &mut QueueConnConfig| c.resend_queue_capacity = 0)]
    #[case::poll_zero(|c: &mut QueueConnConfig| c.consume_poll_interval = Duration::ZERO)]
    fn test_validate_rejects(#[case] modify: fn(&mut QueueConnConfig)) {
        let mut config = QueueConnConfig::default_ice();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
