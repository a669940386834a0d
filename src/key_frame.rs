//! Frame boundary detection on H.264 Annex-B payloads.
//!
//! The reassembly queue only needs to know whether a slice *begins* an independently decodable
//!  unit; that is the case iff the payload starts with an Annex-B start code. The sender side
//!  additionally inspects NAL unit types to hold back video until the first parameter set or
//!  IDR slice, since nothing before that can be decoded by the peer.

use crate::data_type::DataType;

pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const NAL_TYPE_MASK: u8 = 0x1f;

/// NAL unit types (5 bits) relevant to frame boundary handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    SliceNonIdr,
    /// IDR slice (keyframe)
    SliceIdr,
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value & NAL_TYPE_MASK {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            n => NalUnitType::Other(n),
        }
    }
}

impl NalUnitType {
    /// `true` for units that allow a decoder to (re-)start: parameter sets and IDR slices
    pub fn starts_decodable_sequence(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr | NalUnitType::Sps | NalUnitType::Pps)
    }
}

/// Whether a received slice starts a new frame. Audio frames always fit into a single slice, so
///  every audio slice is key-aligned.
pub fn is_key_frame_start(data_type: DataType, payload: &[u8]) -> bool {
    match data_type {
        DataType::PrimaryVideo | DataType::SecondaryVideo => payload.starts_with(&ANNEX_B_START_CODE),
        DataType::Audio => true,
        DataType::Nack => false,
    }
}

/// Iterates over the types of all NAL units in an Annex-B buffer
pub fn nal_unit_types(buf: &[u8]) -> impl Iterator<Item = NalUnitType> + '_ {
    let code_len = ANNEX_B_START_CODE.len();
    buf.windows(code_len + 1)
        .filter(move |w| w[..code_len] == ANNEX_B_START_CODE)
        .map(move |w| NalUnitType::from(w[code_len]))
}

/// Holds back video frames on the sending side until the first frame that contains a parameter
///  set or IDR unit has been seen
#[derive(Debug)]
pub struct KeyFrameGate {
    open: bool,
}

impl KeyFrameGate {
    pub fn new(enabled: bool) -> KeyFrameGate {
        KeyFrameGate { open: !enabled }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Returns `true` if the frame may be sent
    pub fn admit(&mut self, data_type: DataType, frame: &[u8]) -> bool {
        if self.open || !data_type.is_video() {
            return true;
        }
        if nal_unit_types(frame).any(|t| t.starts_decodable_sequence()) {
            self.open = true;
        }
        self.open
    }
}
