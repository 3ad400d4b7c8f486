use super::types::*;
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, BytesMut};

/// Generates the output stream's PAT and PMT packets.
///
/// The multiplexer never forwards input PSI; both tables are regenerated
/// as single sections with a fixed program layout, CRC32-correct, and
/// repeated on the engine's injection cadence. Version bumps happen on
/// every table change so downstream demuxers re-read stream types after a
/// codec change across a cut.
pub struct PsiGenerator {
    program_number: u16,
    pmt_pid: u16,
    version: u8,
    crc: Crc32Mpeg2,
}

impl PsiGenerator {
    /// Creates a generator for one program.
    pub fn new(program_number: u16, pmt_pid: u16) -> Self {
        Self {
            program_number,
            pmt_pid,
            version: 0,
            crc: Crc32Mpeg2::new(),
        }
    }

    /// Advances the table version (modulo 32), to be called when the PMT
    /// contents change.
    pub fn bump_version(&mut self) {
        self.version = (self.version + 1) & 0x1f;
    }

    /// Builds the single-section PAT packet.
    pub fn pat_packet(&mut self, cc: u8) -> TsPacket {
        let pat = Pat {
            entries: vec![PatEntry {
                program_number: self.program_number,
                pmt_pid: self.pmt_pid,
            }],
        };
        let mut body = BytesMut::new();
        pat.write_to(&mut body);
        // PAT table_id_extension is the transport stream id
        self.section_packet(PID_PAT, TABLE_ID_PAT, 1, &body, cc)
    }

    /// Builds the single-section PMT packet for the given table contents.
    pub fn pmt_packet(&mut self, pmt: &Pmt, cc: u8) -> TsPacket {
        let mut body = BytesMut::new();
        pmt.write_to(&mut body);
        self.section_packet(self.pmt_pid, TABLE_ID_PMT, self.program_number, &body, cc)
    }

    fn section_packet(
        &self,
        pid: u16,
        table_id: u8,
        table_ext: u16,
        body: &[u8],
        cc: u8,
    ) -> TsPacket {
        let mut section = BytesMut::with_capacity(12 + body.len());
        let section_length = 5 + body.len() + 4;
        section.put_u8(table_id);
        section.put_u16(0xb000 | (section_length as u16 & 0x03ff));
        section.put_u16(table_ext);
        section.put_u8(0xc1 | ((self.version & 0x1f) << 1));
        section.put_u8(0x00); // section number
        section.put_u8(0x00); // last section number
        section.put_slice(body);
        let crc = self.crc.calculate(&section);
        section.put_u32(crc);

        let mut raw = [0xffu8; TS_PACKET_SIZE];
        raw[0] = SYNC_BYTE;
        raw[1] = 0x40 | ((pid >> 8) as u8 & 0x1f);
        raw[2] = (pid & 0xff) as u8;
        raw[3] = 0x10 | (cc & 0x0f);
        raw[4] = 0x00; // pointer field
        raw[5..5 + section.len()].copy_from_slice(&section);
        TsPacket::from_slice(&raw).expect("constructed packet")
    }
}
