use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The type tag in every slice header
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DataType {
    PrimaryVideo = 1,
    SecondaryVideo = 2,
    Audio = 3,
    Nack = 4,
}

impl DataType {
    pub fn is_video(&self) -> bool {
        matches!(self, DataType::PrimaryVideo | DataType::SecondaryVideo)
    }

    /// media slices take part in reassembly, NACKs are control datagrams
    pub fn is_media(&self) -> bool {
        !matches!(self, DataType::Nack)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::PrimaryVideo => "video1",
            DataType::SecondaryVideo => "video2",
            DataType::Audio => "audio",
            DataType::Nack => "nack",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Some(DataType::PrimaryVideo))]
    #[case(2, Some(DataType::SecondaryVideo))]
    #[case(3, Some(DataType::Audio))]
    #[case(4, Some(DataType::Nack))]
    #[case::zero(0, None)]
    #[case::above(5, None)]
    #[case::max(255, None)]
    fn test_from_tag(#[case] tag: u8, #[case] expected: Option<DataType>) {
        assert_eq!(DataType::try_from(tag).ok(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(DataType::PrimaryVideo.to_string(), "video1");
        assert_eq!(DataType::Nack.to_string(), "nack");
    }
}
