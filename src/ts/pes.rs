use super::types::{TsPacket, SYNC_BYTE, TS_PACKET_SIZE};
use crate::error::{RelayError, Result};
use bytes::{BufMut, BytesMut};

/// Decodes a 5-byte PES timestamp field into 90 kHz ticks.
pub fn decode_timestamp(b: &[u8]) -> u64 {
    (((b[0] as u64 >> 1) & 0x07) << 30)
        | ((b[1] as u64) << 22)
        | (((b[2] as u64 >> 1) & 0x7f) << 15)
        | ((b[3] as u64) << 7)
        | ((b[4] as u64 >> 1) & 0x7f)
}

/// Encodes 90 kHz ticks into a 5-byte PES timestamp field. `prefix` is the
/// 4-bit marker nibble (0b0010 PTS-only, 0b0011 PTS-of-pair, 0b0001 DTS).
pub fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    let ts = ts & 0x1_ffff_ffff;
    [
        (prefix << 4) | (((ts >> 29) & 0x0e) as u8) | 0x01,
        ((ts >> 22) & 0xff) as u8,
        ((((ts >> 14) & 0x7f) as u8) << 1) | 0x01,
        ((ts >> 7) & 0xff) as u8,
        (((ts & 0x7f) as u8) << 1) | 0x01,
    ]
}

/// Parsed PES header with byte offsets of the timestamp fields.
///
/// The offsets are relative to the start of the payload slice the header
/// was parsed from, so the splice engine can rewrite PTS/DTS in place in
/// the wire packet without re-serializing anything.
#[derive(Debug, Clone)]
pub struct PesHeader {
    /// PES stream ID (0xE0.. video, 0xC0.. audio)
    pub stream_id: u8,
    /// Declared PES packet length; 0 means unbounded (video)
    pub packet_length: u16,
    /// Presentation timestamp, 90 kHz
    pub pts: Option<u64>,
    /// Decode timestamp, 90 kHz
    pub dts: Option<u64>,
    /// Byte offset of the 5-byte PTS field
    pub pts_offset: Option<usize>,
    /// Byte offset of the 5-byte DTS field
    pub dts_offset: Option<usize>,
    /// Total header size: payload data starts here
    pub header_len: usize,
}

/// Timestamp pair carried by a PES header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesTimestamps {
    /// Presentation timestamp, 90 kHz
    pub pts: u64,
    /// Decode timestamp, 90 kHz; equals `pts` when the header carries none
    pub dts: u64,
}

impl PesHeader {
    /// Parses a PES header from the first payload of a PUSI packet.
    ///
    /// The header including any timestamp fields must be fully contained in
    /// `payload`; a straddled header is malformed data from the rewrite
    /// path's point of view and is reported as a parser error.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 9 {
            return Err(RelayError::Parser("PES header truncated".into()));
        }
        if payload[0] != 0x00 || payload[1] != 0x00 || payload[2] != 0x01 {
            return Err(RelayError::Parser("PES start code missing".into()));
        }
        let stream_id = payload[3];
        let packet_length = ((payload[4] as u16) << 8) | payload[5] as u16;
        if payload[6] & 0xc0 != 0x80 {
            return Err(RelayError::Parser("PES marker bits invalid".into()));
        }
        let pts_dts_flags = (payload[7] >> 6) & 0x03;
        if pts_dts_flags == 0x01 {
            return Err(RelayError::Parser("forbidden pts_dts_flags 01".into()));
        }
        let header_data_length = payload[8] as usize;
        let header_len = 9 + header_data_length;
        if payload.len() < header_len {
            return Err(RelayError::Parser("PES header straddles packet".into()));
        }

        let mut header = Self {
            stream_id,
            packet_length,
            pts: None,
            dts: None,
            pts_offset: None,
            dts_offset: None,
            header_len,
        };

        if pts_dts_flags >= 0x02 {
            if header_data_length < 5 {
                return Err(RelayError::Parser("PTS field missing".into()));
            }
            header.pts = Some(decode_timestamp(&payload[9..14]));
            header.pts_offset = Some(9);
        }
        if pts_dts_flags == 0x03 {
            if header_data_length < 10 {
                return Err(RelayError::Parser("DTS field missing".into()));
            }
            header.dts = Some(decode_timestamp(&payload[14..19]));
            header.dts_offset = Some(14);
        }
        Ok(header)
    }

    /// The effective timestamps, with DTS defaulting to PTS.
    pub fn timestamps(&self) -> Option<PesTimestamps> {
        self.pts.map(|pts| PesTimestamps {
            pts,
            dts: self.dts.unwrap_or(pts),
        })
    }

    /// Rewrites the PTS (and DTS, when present) fields inside `payload`
    /// with new values, preserving the marker nibbles.
    pub fn rewrite_timestamps(&self, payload: &mut [u8], pts: u64, dts: u64) {
        if let Some(offset) = self.pts_offset {
            let prefix = if self.dts_offset.is_some() { 0x3 } else { 0x2 };
            payload[offset..offset + 5].copy_from_slice(&encode_timestamp(prefix, pts));
        }
        if let Some(offset) = self.dts_offset {
            payload[offset..offset + 5].copy_from_slice(&encode_timestamp(0x1, dts));
        }
    }
}

/// Serializes a complete, bounded PES packet carrying `data` with a
/// PTS+DTS pair. Used for the synthetic parameter-set PES injected at cuts.
pub fn build_pes(stream_id: u8, pts: u64, dts: u64, data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(19 + data.len());
    buf.put_u8(0x00);
    buf.put_u8(0x00);
    buf.put_u8(0x01);
    buf.put_u8(stream_id);
    // length counts everything after the length field
    let length = 3 + 10 + data.len();
    buf.put_u16(if length <= u16::MAX as usize {
        length as u16
    } else {
        0
    });
    buf.put_u8(0x84); // marker + data_alignment
    buf.put_u8(0xc0); // PTS + DTS present
    buf.put_u8(10); // header data length
    buf.put_slice(&encode_timestamp(0x3, pts));
    buf.put_slice(&encode_timestamp(0x1, dts));
    buf.put_slice(data);
    buf
}

/// Splits an elementary-stream byte sequence into TS packets on `pid`.
///
/// The first packet carries PUSI; short tails are padded with adaptation
/// field stuffing. Continuity counters start at `first_cc` and increment
/// per packet; the caller owns the counter state.
pub fn packetize_es(pid: u16, data: &[u8], first_cc: u8) -> Vec<TsPacket> {
    let mut packets = Vec::with_capacity(data.len() / 184 + 1);
    let mut cc = first_cc;
    let mut first = true;

    for chunk in data.chunks(184) {
        let mut raw = [0xffu8; TS_PACKET_SIZE];
        raw[0] = SYNC_BYTE;
        raw[1] = ((pid >> 8) as u8 & 0x1f) | if first { 0x40 } else { 0x00 };
        raw[2] = (pid & 0xff) as u8;

        if chunk.len() == 184 {
            raw[3] = 0x10 | (cc & 0x0f);
            raw[4..].copy_from_slice(chunk);
        } else {
            // adaptation field soaks up the slack
            let stuffing = 184 - chunk.len();
            let af_len = stuffing - 1;
            raw[3] = 0x30 | (cc & 0x0f);
            raw[4] = af_len as u8;
            if af_len > 0 {
                raw[5] = 0x00; // no flags, rest is stuffing
            }
            let start = 5 + af_len;
            raw[start..].copy_from_slice(chunk);
        }

        packets.push(TsPacket::from_slice(&raw).expect("constructed packet"));
        cc = (cc + 1) & 0x0f;
        first = false;
    }
    packets
}
