use super::{AccessUnitInfo, ParameterSets};
use bytes::Bytes;

/// H.264 NAL unit types the splice engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Coded slice of a non-IDR picture
    NonIdrSlice,
    /// Coded slice of an IDR picture
    IdrSlice,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    AccessUnitDelimiter,
    /// Anything else
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            other => Self::Other(other),
        }
    }
}

/// Extracts the type field from a NAL header byte.
pub fn nal_unit_type(header: u8) -> NalUnitType {
    NalUnitType::from(header & 0x1f)
}

/// Builds an access unit delimiter NAL (primary_pic_type = any).
pub fn access_unit_delimiter() -> [u8; 6] {
    [0x00, 0x00, 0x00, 0x01, 0x09, 0xf0]
}

/// Removes emulation-prevention bytes (0x000003 -> 0x0000) from a raw NAL
/// body, yielding the RBSP for header-level inspection.
pub fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x03 {
            out.push(0x00);
            out.push(0x00);
            i += 3;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Profile and level from the first SPS bytes, for discovery logging.
pub fn sps_profile_level(sps_unit: &[u8]) -> Option<(u8, u8)> {
    // skip start code and NAL header to the profile_idc byte
    let offset = if sps_unit.get(2) == Some(&1) { 4 } else { 5 };
    let rbsp = strip_emulation_prevention(sps_unit.get(offset..)?);
    if rbsp.len() < 3 {
        return None;
    }
    Some((rbsp[0], rbsp[2]))
}

/// Classifies one NAL unit into the access-unit summary; `unit` includes
/// the start code, `body` starts at the NAL header byte.
pub(super) fn classify(
    body: &[u8],
    unit: &[u8],
    info: &mut AccessUnitInfo,
    params: &mut ParameterSets,
) {
    match nal_unit_type(body[0]) {
        NalUnitType::IdrSlice => info.is_idr = true,
        NalUnitType::Sps => params.sps = Some(Bytes::copy_from_slice(unit)),
        NalUnitType::Pps => params.pps = Some(Bytes::copy_from_slice(unit)),
        _ => {}
    }
}
