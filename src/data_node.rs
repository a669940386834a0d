use std::fmt::{Display, Formatter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::data_type::DataType;
use crate::error::{QueueConnError, QueueConnResult};
use crate::key_frame::is_key_frame_start;
use crate::sequence::Sequence;
use crate::slice_header::SliceHeader;

/// A received media slice as it is held in the reassembly ring. While a frame is being
///  assembled, the payloads of its continuation slices are appended to the node of the slice
///  that started it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataNode {
    pub data_type: DataType,
    pub sequence: Sequence,
    pub payload: BytesMut,
    pub is_key_frame_start: bool,
}

impl Display for DataNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{seq:{} type:{} key:{} len:{}}}", self.sequence, self.data_type, self.is_key_frame_start, self.payload.len())
    }
}

impl DataNode {
    pub fn new(data_type: DataType, sequence: Sequence, payload: &[u8]) -> DataNode {
        DataNode {
            data_type,
            sequence,
            payload: BytesMut::from(payload),
            is_key_frame_start: is_key_frame_start(data_type, payload),
        }
    }
}

/// A parsed incoming datagram
#[derive(Debug, PartialEq, Eq)]
pub enum Datagram {
    Media(DataNode),
    /// the peer requests a re-send of the given sequence
    Nack(Sequence),
}

impl Datagram {
    /// Parses a raw datagram as read from the transport. Malformed datagrams are reported as
    ///  errors - they are fatal for the connection, there is no per-datagram skipping.
    pub fn parse(mut buf: &[u8]) -> QueueConnResult<Datagram> {
        let header = SliceHeader::deser(&mut buf)?;

        match header.data_type {
            DataType::Nack => {
                if buf.len() != Sequence::SERIALIZED_LEN {
                    return Err(QueueConnError::MalformedNack { len: buf.len() });
                }
                Ok(Datagram::Nack(Sequence::from_raw(buf.get_u32())))
            }
            data_type => Ok(Datagram::Media(DataNode::new(data_type, header.sequence, buf))),
        }
    }
}

/// Serializes a NACK datagram requesting a re-send of `requested`. NACKs live outside the data
///  sequence space, their header sequence is always zero.
pub fn nack_datagram(requested: Sequence) -> Bytes {
    let mut buf = BytesMut::with_capacity(SliceHeader::SERIALIZED_LEN + Sequence::SERIALIZED_LEN);
    SliceHeader::new(Sequence::ZERO, DataType::Nack).ser(&mut buf);
    buf.put_u32(requested.to_raw());
    buf.freeze()
}
