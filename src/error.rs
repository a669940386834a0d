use std::io;
use thiserror::Error;
use crate::sequence::Sequence;

/// Everything that can go wrong on a queue connection.
///
/// Only [QueueConnError::CacheEvicted] is recoverable: it means the peer asked for a slice that
///  was already overwritten in the send cache, and the peer's reassembly queue will skip the
///  frame it belonged to. Everything else tears down the whole connection.
#[derive(Debug, Error)]
pub enum QueueConnError {
    #[error("datagram of {len} bytes is shorter than the slice header")]
    HeaderTruncated { len: usize },

    #[error("datagram exceeds the MTU of {mtu} bytes - the peer is configured with a bigger MTU")]
    DatagramTooLarge { mtu: usize },

    #[error("unknown data type tag {0}")]
    UnknownDataType(u8),

    #[error("NACK payload must be exactly 4 bytes, was {len}")]
    MalformedNack { len: usize },

    #[error("slice #{0} is no longer in the send cache")]
    CacheEvicted(Sequence),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("transport error: {0}")]
    TransportIo(#[from] io::Error),

    #[error("frame source failed: {0}")]
    SourceFailed(anyhow::Error),

    #[error("frame sink was closed")]
    SinkClosed,
}

impl QueueConnError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, QueueConnError::CacheEvicted(_))
    }
}

pub type QueueConnResult<T> = Result<T, QueueConnError>;
