//! # Video codec inspection
//!
//! Just enough H.264/H.265 parsing to drive splice decisions: Annex-B NAL
//! iteration, IDR (random-access point) detection, and raw parameter-set
//! capture for re-injection at cut points. No slice data is ever decoded.

use crate::ts::{STREAM_TYPE_H264, STREAM_TYPE_H265};
use bytes::Bytes;

/// H.264 specifics
pub mod h264;
/// H.265 specifics
pub mod h265;

/// Video codec family carried in a PMT stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.264 / AVC
    H264,
    /// H.265 / HEVC
    H265,
}

impl VideoCodec {
    /// Maps a PMT stream type to a codec family.
    pub fn from_stream_type(stream_type: u8) -> Option<Self> {
        match stream_type {
            STREAM_TYPE_H264 => Some(Self::H264),
            STREAM_TYPE_H265 => Some(Self::H265),
            _ => None,
        }
    }
}

/// Raw parameter-set NAL units captured from a stream, start codes included.
///
/// These are byte-for-byte what the encoder emitted (emulation prevention
/// intact) so they can be replayed verbatim ahead of an IDR.
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    /// H.265 video parameter set
    pub vps: Option<Bytes>,
    /// Sequence parameter set
    pub sps: Option<Bytes>,
    /// Picture parameter set
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Whether enough parameter sets are present to decode an IDR.
    pub fn complete(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264 => self.sps.is_some() && self.pps.is_some(),
            VideoCodec::H265 => {
                self.vps.is_some() && self.sps.is_some() && self.pps.is_some()
            }
        }
    }

    /// Concatenates the parameter sets in decode order (VPS, SPS, PPS).
    pub fn annex_b(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in [&self.vps, &self.sps, &self.pps].into_iter().flatten() {
            out.extend_from_slice(nal);
        }
        out
    }
}

/// What an access-unit scan found.
#[derive(Debug, Default)]
pub struct AccessUnitInfo {
    /// The unit contains an IDR (or H.265 IRAP) slice
    pub is_idr: bool,
}

/// Iterates Annex-B NAL units in `data`, yielding each unit *including* its
/// start code. Both 3-byte and 4-byte start codes are recognized; emulation
/// prevention guarantees no false start code inside a NAL, so a plain byte
/// scan is exact.
pub fn nal_units(data: &[u8]) -> NalUnitIter<'_> {
    NalUnitIter { data, pos: 0 }
}

/// Iterator over Annex-B NAL units.
pub struct NalUnitIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NalUnitIter<'a> {
    fn find_start_code(&self, from: usize) -> Option<usize> {
        let data = self.data;
        let mut i = from;
        while i + 3 <= data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                // fold a preceding zero into a 4-byte start code
                if i > from && data[i - 1] == 0 {
                    return Some(i - 1);
                }
                return Some(i);
            }
            i += 1;
        }
        None
    }
}

impl<'a> Iterator for NalUnitIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let start = self.find_start_code(self.pos)?;
        let header = start + if self.data[start + 2] == 1 { 3 } else { 4 };
        let end = self
            .find_start_code(header)
            .unwrap_or(self.data.len());
        self.pos = end;
        Some(&self.data[start..end])
    }
}

/// First byte (or two for H.265) of the NAL unit proper, after the start code.
fn nal_header(unit: &[u8]) -> Option<&[u8]> {
    let offset = if unit.len() >= 4 && unit[2] == 1 {
        3
    } else if unit.len() >= 5 && unit[3] == 1 {
        4
    } else {
        return None;
    };
    Some(&unit[offset..])
}

/// Scans one complete access unit for IDR slices and parameter sets.
pub fn scan_access_unit(codec: VideoCodec, au: &[u8], params: &mut ParameterSets) -> AccessUnitInfo {
    let mut info = AccessUnitInfo::default();
    for unit in nal_units(au) {
        let Some(body) = nal_header(unit) else {
            continue;
        };
        if body.is_empty() {
            continue;
        }
        match codec {
            VideoCodec::H264 => h264::classify(body, unit, &mut info, params),
            VideoCodec::H265 => h265::classify(body, unit, &mut info, params),
        }
    }
    info
}
