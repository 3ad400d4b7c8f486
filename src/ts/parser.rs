use super::types::*;
use crate::error::{RelayError, Result};
use crate::utils::Crc32Mpeg2;
use bytes::{Bytes, BytesMut};

/// Parser for PSI sections carried in TS packets.
///
/// Stateless over packets; pair it with a [`SectionAssembler`] per PID to
/// handle tables that straddle packet boundaries.
pub struct TsPacketParser {
    crc: Crc32Mpeg2,
}

impl TsPacketParser {
    /// Creates a new parser.
    pub fn new() -> Self {
        Self {
            crc: Crc32Mpeg2::new(),
        }
    }

    /// Parses a complete PAT section, validating table ID and CRC.
    pub fn parse_pat(&self, section: &[u8]) -> Result<Pat> {
        self.check_section(section, TABLE_ID_PAT)?;
        let total = 3 + (((section[1] as usize & 0x0f) << 8) | section[2] as usize);

        let mut pat = Pat::default();
        let mut pos = 8;
        while pos + 4 <= total - 4 {
            let program_number = ((section[pos] as u16) << 8) | section[pos + 1] as u16;
            let pid = ((section[pos + 2] as u16 & 0x1f) << 8) | section[pos + 3] as u16;
            if program_number != 0 {
                pat.entries.push(PatEntry {
                    program_number,
                    pmt_pid: pid,
                });
            }
            pos += 4;
        }
        Ok(pat)
    }

    /// Parses a complete PMT section, validating table ID and CRC.
    pub fn parse_pmt(&self, section: &[u8]) -> Result<Pmt> {
        self.check_section(section, TABLE_ID_PMT)?;
        let total = 3 + (((section[1] as usize & 0x0f) << 8) | section[2] as usize);
        if total < 16 {
            return Err(RelayError::Parser("PMT section too short".into()));
        }

        let mut pmt = Pmt::default();
        let mut pos = 8;
        pmt.pcr_pid = ((section[pos] as u16 & 0x1f) << 8) | section[pos + 1] as u16;
        pos += 2;

        let program_info_length =
            ((section[pos] as usize & 0x0f) << 8) | section[pos + 1] as usize;
        pos += 2 + program_info_length;

        while pos + 5 <= total - 4 {
            let stream_type = section[pos];
            let elementary_pid = ((section[pos + 1] as u16 & 0x1f) << 8) | section[pos + 2] as u16;
            let es_info_length =
                ((section[pos + 3] as usize & 0x0f) << 8) | section[pos + 4] as usize;
            pos += 5 + es_info_length;
            if pos > total - 4 {
                return Err(RelayError::Parser("ES info extends beyond section".into()));
            }
            pmt.streams.push(EsInfo {
                stream_type,
                elementary_pid,
            });
        }
        Ok(pmt)
    }

    /// Program number carried in a PMT section header.
    pub fn pmt_program_number(&self, section: &[u8]) -> Option<u16> {
        if section.len() < 5 || section[0] != TABLE_ID_PMT {
            return None;
        }
        Some(((section[3] as u16) << 8) | section[4] as u16)
    }

    fn check_section(&self, section: &[u8], table_id: u8) -> Result<()> {
        if section.len() < 12 {
            return Err(RelayError::Parser("section too short".into()));
        }
        if section[0] != table_id {
            return Err(RelayError::Parser(format!(
                "unexpected table id 0x{:02x}",
                section[0]
            )));
        }
        let total = 3 + (((section[1] as usize & 0x0f) << 8) | section[2] as usize);
        if section.len() < total || total < 12 {
            return Err(RelayError::Parser("section shorter than declared".into()));
        }
        // A valid section CRCs to zero when the stored CRC32 is included.
        if self.crc.calculate(&section[..total]) != 0 {
            return Err(RelayError::Parser("section CRC mismatch".into()));
        }
        Ok(())
    }
}

impl Default for TsPacketParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles PSI sections for one PID across packet boundaries.
///
/// Feed every packet of the table's PID; a completed section is returned as
/// soon as its declared length has accumulated. Pointer fields are honored
/// on payload-unit-start packets; a new PUSI mid-section discards the stale
/// partial section.
pub struct SectionAssembler {
    buf: BytesMut,
    expected: Option<usize>,
}

impl SectionAssembler {
    /// Creates an idle assembler.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            expected: None,
        }
    }

    /// Pushes one packet's payload; returns a complete section when ready.
    pub fn push(&mut self, packet: &TsPacket) -> Option<Bytes> {
        let payload = packet.payload()?;

        if packet.payload_unit_start() {
            if payload.is_empty() {
                return None;
            }
            let pointer = payload[0] as usize;
            if 1 + pointer >= payload.len() {
                self.reset();
                return None;
            }
            self.buf.clear();
            self.expected = None;
            self.buf.extend_from_slice(&payload[1 + pointer..]);
        } else if self.buf.is_empty() {
            // continuation without a start; nothing to append to
            return None;
        } else {
            self.buf.extend_from_slice(payload);
        }

        if self.expected.is_none() && self.buf.len() >= 3 {
            let section_length = ((self.buf[1] as usize & 0x0f) << 8) | self.buf[2] as usize;
            self.expected = Some(3 + section_length);
        }

        match self.expected {
            Some(expected) if self.buf.len() >= expected => {
                let mut section = self.buf.split().freeze();
                section.truncate(expected);
                self.reset();
                Some(section)
            }
            _ => None,
        }
    }

    /// Drops any partially accumulated section.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = None;
    }
}

impl Default for SectionAssembler {
    fn default() -> Self {
        Self::new()
    }
}
