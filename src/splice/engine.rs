use super::timestamps::*;
use crate::codec::{h264, VideoCodec};
use crate::config::OutputConfig;
use crate::input::StreamInfo;
use crate::ts::pes::{build_pes, packetize_es, PesHeader, PesTimestamps};
use crate::ts::types::{EsInfo, Pmt, STREAM_ID_VIDEO};
use crate::ts::{PsiGenerator, TsPacket, PID_PAT};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// PAT/PMT injection cadence during steady state.
const PSI_INTERVAL: Duration = Duration::from_millis(100);

/// Fallback frame duration (90 kHz ticks) until a source reports one.
const DEFAULT_FRAME_DURATION: u64 = 3000;

/// Counters the engine exposes for the periodic stats line.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    /// Cuts performed (including the initial one)
    pub cuts: u64,
    /// PTS/DTS regressions corrected by forward bumps
    pub pts_bumps: u64,
    /// PCR fields suppressed to preserve monotonicity
    pub pcr_suppressed: u64,
    /// PES headers dropped as malformed
    pub malformed_pes: u64,
    /// PAT+PMT injection rounds
    pub psi_injections: u64,
}

/// PID mapping of the currently selected source.
#[derive(Debug, Clone, Copy)]
struct SourceMap {
    video_pid: u16,
    audio_pid: Option<u16>,
    pcr_pid: u16,
}

/// Transforms packets from whichever source is active into the normalized,
/// continuously-timed output stream.
///
/// Single-owner state: only the orchestrator task calls into the engine, so
/// nothing here is locked. All output-side invariants live in this type:
/// per-PID continuity counters, the global PTS/PCR offsets, the last
/// emitted PCR, and the PSI repetition clock.
pub struct SpliceEngine {
    out_video_pid: u16,
    out_audio_pid: u16,
    out_pmt_pid: u16,
    psi: PsiGenerator,
    pmt: Pmt,
    active: Option<SourceMap>,
    codec: VideoCodec,

    // rebasing state, output-clock units
    pts_offset: u64,
    pcr_offset: u64,
    last_out_pcr: Option<u64>,
    last_out_pts: HashMap<u16, u64>,
    frame_duration: u64,
    max_reorder: u64,

    continuity: HashMap<u16, u8>,
    last_psi: Option<Instant>,
    stats: EngineStats,
}

impl SpliceEngine {
    /// Creates an engine normalizing onto the configured output PIDs.
    pub fn new(output: &OutputConfig, max_reorder_ms: u64) -> Self {
        Self {
            out_video_pid: output.pid_video,
            out_audio_pid: output.pid_audio,
            out_pmt_pid: output.pid_pmt,
            psi: PsiGenerator::new(output.program_number, output.pid_pmt),
            pmt: Pmt::default(),
            active: None,
            codec: VideoCodec::H264,
            pts_offset: 0,
            pcr_offset: 0,
            last_out_pcr: None,
            last_out_pts: HashMap::new(),
            frame_duration: DEFAULT_FRAME_DURATION,
            max_reorder: max_reorder_ms * 90,
            continuity: HashMap::new(),
            last_psi: None,
            stats: EngineStats::default(),
        }
    }

    /// Performs the cut procedure onto a new source.
    ///
    /// `first` carries the incoming IDR's timestamps, still in the source's
    /// own clock. The returned packets (PAT, PMT, synthetic parameter-set
    /// PES) must be written before any payload from the new source, which
    /// the caller then feeds through [`transform`](Self::transform)
    /// starting at the IDR's first packet.
    pub fn begin_source(&mut self, info: &StreamInfo, first: PesTimestamps) -> Vec<TsPacket> {
        // Choose where the new material lands on the output clock: one
        // frame after the last video presentation instant, or unshifted on
        // the very first cut.
        self.pts_offset = match self.last_out_pts.get(&self.out_video_pid) {
            Some(&last) => {
                let target = pts_add(last, self.frame_duration.max(1));
                pts_offset_between(first.pts, target)
            }
            None => 0,
        };
        self.pcr_offset = pcr_offset_from_pts_offset(self.pts_offset);

        self.active = Some(SourceMap {
            video_pid: info.video_pid,
            audio_pid: info.audio_pid,
            pcr_pid: info.pcr_pid,
        });
        self.codec = info.codec;
        if info.frame_duration != 0 {
            self.frame_duration = info.frame_duration;
        }

        let pmt = self.build_pmt(info);
        if self.pmt.streams.len() != pmt.streams.len()
            || self
                .pmt
                .streams
                .iter()
                .zip(&pmt.streams)
                .any(|(a, b)| a.stream_type != b.stream_type)
        {
            if !self.pmt.streams.is_empty() {
                self.psi.bump_version();
            }
            self.pmt = pmt;
        }

        let out_pts = pts_add(first.pts, self.pts_offset);
        let out_dts = pts_add(first.dts, self.pts_offset);

        let mut packets = Vec::new();
        let cc = self.next_cc(PID_PAT);
        packets.push(self.psi.pat_packet(cc));
        let cc = self.next_cc(self.out_pmt_pid);
        packets.push(self.psi.pmt_packet(&self.pmt, cc));

        // Access unit delimiter plus the incoming stream's parameter sets,
        // timestamped like the IDR they precede.
        let mut prefix = Vec::new();
        if self.codec == VideoCodec::H264 {
            prefix.extend_from_slice(&h264::access_unit_delimiter());
        }
        prefix.extend_from_slice(&info.params.annex_b());
        let pes = build_pes(STREAM_ID_VIDEO, out_pts, out_dts, &prefix);
        for mut packet in packetize_es(self.out_video_pid, &pes, 0) {
            let cc = self.next_cc(self.out_video_pid);
            packet.set_continuity_counter(cc);
            packets.push(packet);
        }

        self.last_psi = Some(Instant::now());
        self.stats.cuts += 1;
        self.stats.psi_injections += 1;
        log::info!(
            "cut to {:?}: pts_offset={} pcr_offset={} out_pts={}",
            info.name,
            self.pts_offset,
            self.pcr_offset,
            out_pts
        );
        packets
    }

    /// Applies the per-packet transform. Returns `None` for packets that do
    /// not belong in the output (source PSI, null packets, unmapped PIDs,
    /// malformed PES starts).
    pub fn transform(&mut self, packet: &TsPacket) -> Option<TsPacket> {
        let map = self.active?;
        let pid = packet.pid();

        let out_pid = if pid == map.video_pid {
            self.out_video_pid
        } else if Some(pid) == map.audio_pid {
            self.out_audio_pid
        } else if pid == map.pcr_pid {
            // PCR on its own PID folds onto the output video PID
            self.out_video_pid
        } else {
            // source PAT/PMT, null packets, and foreign PIDs all stop here
            return None;
        };

        let mut out = packet.clone();
        out.set_pid(out_pid);

        // Continuity: payload packets advance the output counter,
        // adaptation-only packets repeat it.
        if out.has_payload() {
            let cc = self.next_cc(out_pid);
            out.set_continuity_counter(cc);
        } else {
            let cc = self.current_cc(out_pid);
            out.set_continuity_counter(cc);
        }

        if let Some(in_pcr) = out.pcr() {
            let rebased = pcr_add(in_pcr, self.pcr_offset);
            match self.last_out_pcr {
                Some(last) if !pcr_is_after(last, rebased) => {
                    out.suppress_pcr();
                    self.stats.pcr_suppressed += 1;
                    log::warn!("pcr regression suppressed: last={} new={}", last, rebased);
                }
                _ => {
                    out.set_pcr(rebased);
                    self.last_out_pcr = Some(rebased);
                }
            }
        }

        if out.payload_unit_start() {
            if let Err(e) = self.rewrite_pes(&mut out, out_pid) {
                self.stats.malformed_pes += 1;
                log::warn!("dropping packet with malformed PES header: {}", e);
                return None;
            }
        }

        Some(out)
    }

    fn rewrite_pes(&mut self, out: &mut TsPacket, out_pid: u16) -> crate::error::Result<()> {
        let offset = match out.payload_offset() {
            Some(offset) => offset,
            None => return Ok(()), // PUSI with no payload: nothing to rewrite
        };
        let header = PesHeader::parse(&out.as_bytes()[offset..])?;
        let Some(ts) = header.timestamps() else {
            return Ok(());
        };

        let mut out_pts = pts_add(ts.pts, self.pts_offset);
        let mut out_dts = pts_add(ts.dts, self.pts_offset);

        // regression guard per output PID
        if let Some(&last) = self.last_out_pts.get(&out_pid) {
            if !pts_is_after(last, out_pts) {
                let bumped = pts_add(last, self.frame_duration.max(1));
                let shift = pts_forward(out_pts, bumped);
                out_pts = bumped;
                out_dts = pts_add(out_dts, shift);
                self.stats.pts_bumps += 1;
                log::warn!("pts regression on pid {}: bumped to {}", out_pid, out_pts);
            }
        }

        // PTS must not precede DTS, and reorder depth stays bounded
        if !pts_is_after(out_dts, out_pts) && out_dts != out_pts {
            out_dts = out_pts;
        } else if pts_forward(out_dts, out_pts) > self.max_reorder {
            out_dts = pts_sub(out_pts, self.max_reorder);
        }

        let payload = &mut out.as_bytes_mut()[offset..];
        header.rewrite_timestamps(payload, out_pts, out_dts);
        self.last_out_pts.insert(out_pid, out_pts);
        Ok(())
    }

    /// Returns a fresh PAT+PMT pair when the repetition interval elapsed.
    pub fn psi_if_due(&mut self) -> Vec<TsPacket> {
        let due = match self.last_psi {
            None => true,
            Some(at) => at.elapsed() >= PSI_INTERVAL,
        };
        if !due || self.pmt.streams.is_empty() {
            return Vec::new();
        }
        self.last_psi = Some(Instant::now());
        self.stats.psi_injections += 1;
        let cc = self.next_cc(PID_PAT);
        let pat = self.psi.pat_packet(cc);
        let cc = self.next_cc(self.out_pmt_pid);
        let pmt = self.psi.pmt_packet(&self.pmt, cc);
        vec![pat, pmt]
    }

    /// Counter snapshot for logging.
    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    fn build_pmt(&self, info: &StreamInfo) -> Pmt {
        let mut streams = vec![EsInfo {
            stream_type: info.video_stream_type,
            elementary_pid: self.out_video_pid,
        }];
        if let Some(audio_type) = info.audio_stream_type {
            streams.push(EsInfo {
                stream_type: audio_type,
                elementary_pid: self.out_audio_pid,
            });
        }
        Pmt {
            // output PCR rides the video PID
            pcr_pid: self.out_video_pid,
            streams,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0f);
        *cc = (*cc + 1) & 0x0f;
        *cc
    }

    fn current_cc(&mut self, pid: u16) -> u8 {
        *self.continuity.entry(pid).or_insert(0x0f)
    }
}
