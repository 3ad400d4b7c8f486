use super::{AccessUnitInfo, ParameterSets};
use bytes::Bytes;

/// H.265 NAL unit type range for random-access pictures (BLA/IDR/CRA).
const IRAP_FIRST: u8 = 16;
const IRAP_LAST: u8 = 21;

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;

/// Extracts the 6-bit type field from the first H.265 NAL header byte.
pub fn nal_unit_type(header: u8) -> u8 {
    (header >> 1) & 0x3f
}

/// Whether the type is an intra random access point (decoder refresh).
pub fn is_irap(nal_type: u8) -> bool {
    (IRAP_FIRST..=IRAP_LAST).contains(&nal_type)
}

/// Classifies one NAL unit into the access-unit summary; `unit` includes
/// the start code, `body` starts at the two-byte NAL header.
pub(super) fn classify(
    body: &[u8],
    unit: &[u8],
    info: &mut AccessUnitInfo,
    params: &mut ParameterSets,
) {
    match nal_unit_type(body[0]) {
        t if is_irap(t) => info.is_idr = true,
        NAL_VPS => params.vps = Some(Bytes::copy_from_slice(unit)),
        NAL_SPS => params.sps = Some(Bytes::copy_from_slice(unit)),
        NAL_PPS => params.pps = Some(Bytes::copy_from_slice(unit)),
        _ => {}
    }
}
