use bytes::{Buf, BufMut};
use crate::data_type::DataType;
use crate::error::{QueueConnError, QueueConnResult};
use crate::sequence::Sequence;

/// The fixed header in front of every datagram:
///
/// ```ascii
/// 0: sequence (u32 BE)
/// 4: data type (u8)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub sequence: Sequence,
    pub data_type: DataType,
}

impl SliceHeader {
    pub const SERIALIZED_LEN: usize = Sequence::SERIALIZED_LEN + size_of::<u8>();

    pub fn new(sequence: Sequence, data_type: DataType) -> SliceHeader {
        SliceHeader { sequence, data_type }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sequence.to_raw());
        buf.put_u8(self.data_type.into());
    }

    /// Parses the header, leaving `buf` positioned at the start of the payload
    pub fn deser(buf: &mut impl Buf) -> QueueConnResult<SliceHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(QueueConnError::HeaderTruncated { len: buf.remaining() });
        }

        let sequence = buf.get_u32();
        let tag = buf.get_u8();
        let data_type = DataType::try_from(tag)
            .map_err(|_| QueueConnError::UnknownDataType(tag))?;

        Ok(SliceHeader {
            sequence: Sequence::from_raw(sequence),
            data_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::first(1, DataType::PrimaryVideo, vec![0,0,0,1, 1])]
    #[case::secondary(258, DataType::SecondaryVideo, vec![0,0,1,2, 2])]
    #[case::audio(0x01020304, DataType::Audio, vec![1,2,3,4, 3])]
    #[case::nack(0, DataType::Nack, vec![0,0,0,0, 4])]
    fn test_ser(#[case] sequence: u32, #[case] data_type: DataType, #[case] expected: Vec<u8>) {
        let header = SliceHeader::new(Sequence::from_raw(sequence), data_type);

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(SliceHeader::deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::sequence_only(vec![0,0,0,1])]
    #[case::partial_sequence(vec![0,0])]
    fn test_deser_truncated(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        match SliceHeader::deser(&mut b) {
            Err(QueueConnError::HeaderTruncated { len }) => assert_eq!(len, raw.len()),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[rstest]
    #[case(0)]
    #[case(5)]
    #[case(200)]
    fn test_deser_unknown_type(#[case] tag: u8) {
        let raw = vec![0,0,0,1, tag, 9,9];
        let mut b: &[u8] = &raw;
        assert!(matches!(SliceHeader::deser(&mut b), Err(QueueConnError::UnknownDataType(t)) if t == tag));
    }
}
