use super::ring::PacketRing;
use super::source::{make_source, ByteSource};
use crate::codec::{scan_access_unit, ParameterSets, VideoCodec};
use crate::config::{HealthConfig, InputConfig};
use crate::error::{RelayError, Result};
use crate::splice::timestamps::pts_forward;
use crate::ts::pes::{PesHeader, PesTimestamps};
use crate::ts::{Reassembler, SectionAssembler, TsPacket, TsPacketParser, PID_PAT};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Ring depth: a few seconds of a typical contribution bitrate, enough to
/// rewind to the most recent IDR when a cut is chosen.
const BUFFER_PACKETS: usize = 1500;

/// Read chunk handed to the reassembler.
const READ_CHUNK: usize = 32 * 1024;

/// Cap on one access unit's scanned bytes; beyond this the unit is skipped.
const AU_SCAN_CAP: usize = 1 << 20;

/// Plausible per-frame DTS deltas (120 fps .. 15 fps) for rate estimation.
const FRAME_TICKS_MIN: u64 = 750;
const FRAME_TICKS_MAX: u64 = 6000;

/// Reconnect backoff bounds for the ingest loop.
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Everything discovered about one input's structure.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Input label from config
    pub name: String,
    /// Program number from the input's PMT
    pub program_number: u16,
    /// PID the input's PMT arrived on
    pub pmt_pid: u16,
    /// Input video PID
    pub video_pid: u16,
    /// Input audio PID, when the PMT announces audio
    pub audio_pid: Option<u16>,
    /// Input PCR PID
    pub pcr_pid: u16,
    /// Video stream type code (0x1b H.264, 0x24 H.265)
    pub video_stream_type: u8,
    /// Audio stream type code, when audio is present
    pub audio_stream_type: Option<u8>,
    /// Codec family derived from the video stream type
    pub codec: VideoCodec,
    /// Most recently captured parameter sets, start codes included
    pub params: ParameterSets,
    /// Estimated frame duration in 90 kHz ticks; 0 until measured
    pub frame_duration: u64,
}

/// A chosen splice-in point: the first packet of an IDR access unit.
#[derive(Debug, Clone, Copy)]
pub struct IdrPoint {
    /// Absolute ring index of the access unit's first packet
    pub index: u64,
    /// The unit's PES timestamps in the source clock
    pub timestamps: PesTimestamps,
}

/// Health snapshot for one input.
#[derive(Debug, Clone)]
pub struct Health {
    /// Transport currently open
    pub connected: bool,
    /// Rolling bitrate over the configured window
    pub bitrate_bps: u64,
    /// Milliseconds since the last byte arrived
    pub ms_since_last_byte: u64,
    /// Total packets ingested
    pub packets_received: u64,
    /// Data arrived recently enough
    pub data_fresh: bool,
    /// Rolling bitrate clears the configured floor (or checking disabled)
    pub bitrate_healthy: bool,
}

impl Health {
    /// The composite health predicate the arbiter evaluates.
    pub fn is_healthy(&self) -> bool {
        self.connected && self.data_fresh && self.bitrate_healthy
    }
}

struct Shared {
    ring: PacketRing,
    info: Option<StreamInfo>,
    idr: Option<IdrPoint>,
    audio_sync: Option<u64>,
    connected: bool,
    packets_received: u64,
    last_byte_at: Option<Instant>,
    bytes_window: VecDeque<(Instant, usize)>,
    resyncs: u64,
}

impl Shared {
    fn new() -> Self {
        Self {
            ring: PacketRing::new(BUFFER_PACKETS),
            info: None,
            idr: None,
            audio_sync: None,
            connected: false,
            packets_received: 0,
            last_byte_at: None,
            bytes_window: VecDeque::new(),
            resyncs: 0,
        }
    }

    fn info_ready(&self) -> bool {
        self.info
            .as_ref()
            .map_or(false, |info| info.params.complete(info.codec))
    }
}

/// Owns one upstream source: a dedicated ingest task, the packet ring, and
/// the readiness signals the orchestrator blocks on.
pub struct InputReader {
    name: String,
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
    health_config: HealthConfig,
    task: Option<JoinHandle<()>>,
}

impl InputReader {
    /// Creates the reader and starts its ingest task.
    pub fn spawn(config: &InputConfig, health_config: &HealthConfig) -> Result<Self> {
        let source = make_source(&config.source)?;
        let shared = Arc::new(Mutex::new(Shared::new()));
        let notify = Arc::new(Notify::new());

        let task = tokio::spawn(ingest_loop(
            config.name.clone(),
            source,
            Arc::clone(&shared),
            Arc::clone(&notify),
        ));

        Ok(Self {
            name: config.name.clone(),
            shared,
            notify,
            health_config: health_config.clone(),
            task: Some(task),
        })
    }

    /// Input label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until PAT, PMT, and codec parameters have been observed.
    pub async fn await_stream_info(&self, deadline: Duration) -> Result<StreamInfo> {
        self.await_with(deadline, "stream info", |shared| {
            if shared.info_ready() {
                shared.info.clone()
            } else {
                None
            }
        })
        .await
    }

    /// Blocks until a video IDR access unit is present in the buffer.
    pub async fn await_idr(&self, deadline: Duration) -> Result<IdrPoint> {
        self.await_with(deadline, "idr", |shared| shared.idr).await
    }

    /// Blocks until the first audio payload start at or after the most
    /// recent IDR. Resolves immediately for audio-less inputs.
    pub async fn await_audio_sync(&self, deadline: Duration) -> Result<u64> {
        self.await_with(deadline, "audio sync", |shared| {
            match shared.info.as_ref().map(|i| i.audio_pid) {
                Some(None) => shared.idr.map(|idr| idr.index),
                _ => shared.audio_sync,
            }
        })
        .await
    }

    /// Copies packets from absolute index `from` up to the current head.
    pub fn snapshot_from(&self, from: u64) -> (u64, Vec<TsPacket>) {
        self.shared.lock().ring.snapshot_from(from)
    }

    /// Pulls freshly arrived packets after `cursor`, waiting up to
    /// `timeout` when none are buffered. Advances the cursor past what it
    /// returns; an empty result means the wait timed out.
    pub async fn consume_live(
        &self,
        cursor: &mut u64,
        max: usize,
        timeout: Duration,
    ) -> Vec<TsPacket> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let shared = self.shared.lock();
                if shared.ring.head() > *cursor {
                    let (start, packets) = shared.ring.copy_range(*cursor, max);
                    if start > *cursor {
                        log::warn!(
                            "{}: consumer overrun, skipped {} packets",
                            self.name,
                            start - *cursor
                        );
                    }
                    *cursor = start + packets.len() as u64;
                    return packets;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    /// Clears IDR and audio-sync readiness so the next cut-in waits for a
    /// fresh alignment point instead of a stale buffered one.
    pub fn reset_readiness(&self) {
        let mut shared = self.shared.lock();
        shared.idr = None;
        shared.audio_sync = None;
    }

    /// Whether PSI, IDR, and audio alignment are all satisfied.
    pub fn is_ready(&self) -> bool {
        let shared = self.shared.lock();
        if !shared.info_ready() || shared.idr.is_none() {
            return false;
        }
        match shared.info.as_ref().map(|i| i.audio_pid) {
            Some(None) => true,
            _ => shared.audio_sync.is_some(),
        }
    }

    /// The most recent IDR point, if one is flagged.
    pub fn idr_point(&self) -> Option<IdrPoint> {
        self.shared.lock().idr
    }

    /// Current stream info, if discovery completed.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        let shared = self.shared.lock();
        if shared.info_ready() {
            shared.info.clone()
        } else {
            None
        }
    }

    /// Health snapshot against the configured thresholds.
    pub fn health(&self) -> Health {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        let window = Duration::from_secs(self.health_config.bitrate_window_seconds.max(1));
        while let Some(&(at, _)) = shared.bytes_window.front() {
            if now.duration_since(at) > window {
                shared.bytes_window.pop_front();
            } else {
                break;
            }
        }
        let bytes: usize = shared.bytes_window.iter().map(|&(_, n)| n).sum();
        let bitrate_bps = (bytes as u64 * 8) / window.as_secs().max(1);

        let ms_since_last_byte = shared
            .last_byte_at
            .map(|at| now.duration_since(at).as_millis() as u64)
            .unwrap_or(u64::MAX);

        Health {
            connected: shared.connected,
            bitrate_bps,
            ms_since_last_byte,
            packets_received: shared.packets_received,
            data_fresh: ms_since_last_byte < self.health_config.max_data_age_ms,
            bitrate_healthy: self.health_config.min_bitrate_bps == 0
                || bitrate_bps >= self.health_config.min_bitrate_bps,
        }
    }

    /// Resync count from the reassembler.
    pub fn resyncs(&self) -> u64 {
        self.shared.lock().resyncs
    }

    /// Stops the ingest task. Packets already buffered stay readable.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.lock().connected = false;
    }

    async fn await_with<T>(
        &self,
        deadline: Duration,
        what: &str,
        check: impl Fn(&Shared) -> Option<T>,
    ) -> Result<T> {
        let until = Instant::now() + deadline;
        loop {
            if let Some(value) = check(&self.shared.lock()) {
                return Ok(value);
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RelayError::NotReady(format!(
                    "{}: {} not observed within {:?}",
                    self.name, what, deadline
                )));
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}

impl Drop for InputReader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-connection parse state: packet reassembly, PSI section assembly,
/// and video access-unit tracking.
struct Discovery {
    name: String,
    parser: TsPacketParser,
    pat_sections: SectionAssembler,
    pmt_sections: SectionAssembler,
    pmt_pid: Option<u16>,
    params: ParameterSets,
    params_announced: bool,
    au_start: Option<u64>,
    au_timestamps: Option<PesTimestamps>,
    au_buffer: Vec<u8>,
    last_video_dts: Option<u64>,
}

impl Discovery {
    fn new(name: String) -> Self {
        Self {
            name,
            parser: TsPacketParser::new(),
            pat_sections: SectionAssembler::new(),
            pmt_sections: SectionAssembler::new(),
            pmt_pid: None,
            params: ParameterSets::default(),
            params_announced: false,
            au_start: None,
            au_timestamps: None,
            au_buffer: Vec::new(),
            last_video_dts: None,
        }
    }

    fn inspect(&mut self, packet: &TsPacket, index: u64, shared: &mut Shared) {
        if packet.transport_error() {
            return;
        }
        let pid = packet.pid();

        if pid == PID_PAT {
            if let Some(section) = self.pat_sections.push(packet) {
                match self.parser.parse_pat(&section) {
                    Ok(pat) => {
                        if let Some(entry) = pat.entries.first() {
                            if self.pmt_pid != Some(entry.pmt_pid) {
                                log::debug!(
                                    "{}: PAT maps program {} to PMT pid 0x{:x}",
                                    self.name,
                                    entry.program_number,
                                    entry.pmt_pid
                                );
                                self.pmt_pid = Some(entry.pmt_pid);
                                self.pmt_sections.reset();
                            }
                        }
                    }
                    Err(e) => log::debug!("{}: bad PAT section: {}", self.name, e),
                }
            }
            return;
        }

        if Some(pid) == self.pmt_pid {
            if let Some(section) = self.pmt_sections.push(packet) {
                let program_number = self.parser.pmt_program_number(&section).unwrap_or(1);
                match self.parser.parse_pmt(&section) {
                    Ok(pmt) => self.apply_pmt(program_number, pid, &pmt, shared),
                    Err(e) => log::debug!("{}: bad PMT section: {}", self.name, e),
                }
            }
            return;
        }

        let (video_pid, audio_pid) = match shared.info.as_ref() {
            Some(info) => (info.video_pid, info.audio_pid),
            None => return,
        };

        if pid == video_pid {
            self.inspect_video(packet, index, shared);
        } else if Some(pid) == audio_pid && packet.payload_unit_start() {
            if let Some(idr) = shared.idr {
                let stale = shared.audio_sync.map_or(true, |at| at < idr.index);
                if stale && index >= idr.index {
                    shared.audio_sync = Some(index);
                }
            }
        }
    }

    fn apply_pmt(&mut self, program_number: u16, pmt_pid: u16, pmt: &crate::ts::Pmt, shared: &mut Shared) {
        let Some(video) = pmt.video_stream() else {
            log::warn!("{}: PMT carries no video stream", self.name);
            return;
        };
        let Some(codec) = VideoCodec::from_stream_type(video.stream_type) else {
            return;
        };
        let audio = pmt.audio_stream();

        let changed = shared.info.as_ref().map_or(true, |info| {
            info.video_pid != video.elementary_pid
                || info.audio_pid != audio.map(|a| a.elementary_pid)
                || info.video_stream_type != video.stream_type
                || info.pcr_pid != pmt.pcr_pid
        });
        if changed {
            log::info!(
                "{}: program {} video pid 0x{:x} ({:?}) audio pid {:?}",
                self.name,
                program_number,
                video.elementary_pid,
                codec,
                audio.map(|a| a.elementary_pid)
            );
            // structure changed: previously chosen alignment points are void
            shared.idr = None;
            shared.audio_sync = None;
            self.params = ParameterSets::default();
            self.params_announced = false;
            self.au_start = None;
            self.au_buffer.clear();
        }

        let frame_duration = shared
            .info
            .as_ref()
            .map(|info| info.frame_duration)
            .unwrap_or(0);
        shared.info = Some(StreamInfo {
            name: self.name.clone(),
            program_number,
            pmt_pid,
            video_pid: video.elementary_pid,
            audio_pid: audio.map(|a| a.elementary_pid),
            pcr_pid: pmt.pcr_pid,
            video_stream_type: video.stream_type,
            audio_stream_type: audio.map(|a| a.stream_type),
            codec,
            params: self.params.clone(),
            frame_duration,
        });
    }

    fn inspect_video(&mut self, packet: &TsPacket, index: u64, shared: &mut Shared) {
        if packet.payload_unit_start() {
            self.finish_access_unit(shared);

            let Some(payload) = packet.payload() else {
                return;
            };
            match PesHeader::parse(payload) {
                Ok(header) => {
                    self.au_start = Some(index);
                    self.au_timestamps = header.timestamps();
                    self.au_buffer.clear();
                    self.au_buffer
                        .extend_from_slice(&payload[header.header_len.min(payload.len())..]);
                }
                Err(e) => {
                    log::debug!("{}: unreadable video PES start: {}", self.name, e);
                    self.au_start = None;
                    self.au_buffer.clear();
                }
            }
        } else if self.au_start.is_some() {
            if let Some(payload) = packet.payload() {
                if self.au_buffer.len() + payload.len() <= AU_SCAN_CAP {
                    self.au_buffer.extend_from_slice(payload);
                } else {
                    // oversized unit: give up on scanning this one
                    self.au_start = None;
                    self.au_buffer.clear();
                }
            }
        }
    }

    fn finish_access_unit(&mut self, shared: &mut Shared) {
        let Some(start) = self.au_start.take() else {
            return;
        };
        let buffer = std::mem::take(&mut self.au_buffer);
        let timestamps = self.au_timestamps.take();

        let Some(info) = shared.info.as_mut() else {
            return;
        };
        let scan = scan_access_unit(info.codec, &buffer, &mut self.params);
        if self.params.sps.is_some() {
            info.params = self.params.clone();
            if !self.params_announced {
                self.params_announced = true;
                if info.codec == VideoCodec::H264 {
                    if let Some((profile, level)) = self
                        .params
                        .sps
                        .as_deref()
                        .and_then(crate::codec::h264::sps_profile_level)
                    {
                        log::info!(
                            "{}: H.264 profile_idc={} level_idc={}",
                            self.name,
                            profile,
                            level
                        );
                    }
                }
            }
        }

        if let Some(ts) = timestamps {
            if let Some(prev) = self.last_video_dts {
                let delta = pts_forward(prev, ts.dts);
                if (FRAME_TICKS_MIN..=FRAME_TICKS_MAX).contains(&delta) {
                    info.frame_duration = delta;
                }
            }
            self.last_video_dts = Some(ts.dts);
        }

        if scan.is_idr && info.params.complete(info.codec) {
            if let Some(ts) = timestamps {
                let point = IdrPoint {
                    index: start,
                    timestamps: ts,
                };
                // a newer IDR supersedes the old one; audio sync must
                // follow the new alignment
                if shared
                    .audio_sync
                    .map_or(false, |at| at < point.index)
                {
                    shared.audio_sync = None;
                }
                shared.idr = Some(point);
            }
        }
    }
}

async fn ingest_loop(
    name: String,
    mut source: Box<dyn ByteSource>,
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        match source.open().await {
            Ok(()) => {
                log::info!("{}: connected to {}", name, source.describe());
                backoff = BACKOFF_INITIAL;
                shared.lock().connected = true;
                notify.notify_waiters();

                read_until_failure(&name, source.as_mut(), &shared, &notify).await;

                source.close();
                {
                    let mut guard = shared.lock();
                    guard.connected = false;
                    guard.idr = None;
                    guard.audio_sync = None;
                }
                notify.notify_waiters();
            }
            Err(e) => {
                log::warn!("{}: open {} failed: {}", name, source.describe(), e);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn read_until_failure(
    name: &str,
    source: &mut dyn ByteSource,
    shared: &Mutex<Shared>,
    notify: &Notify,
) {
    let mut reassembler = Reassembler::new();
    let mut discovery = Discovery::new(name.to_string());
    let mut buf = vec![0u8; READ_CHUNK];
    let mut packets = Vec::new();

    loop {
        match source.read(&mut buf).await {
            Ok(0) => {
                log::info!("{}: source EOF", name);
                return;
            }
            Ok(n) => {
                packets.clear();
                if let Err(e) = reassembler.push(&buf[..n], &mut packets) {
                    log::warn!("{}: {}, reopening source", name, e);
                    return;
                }
                let mut guard = shared.lock();
                let now = Instant::now();
                guard.last_byte_at = Some(now);
                guard.bytes_window.push_back((now, n));
                guard.resyncs = reassembler.resyncs();
                for packet in &packets {
                    let index = guard.ring.push(packet.clone());
                    guard.packets_received += 1;
                    discovery.inspect(packet, index, &mut guard);
                }
                drop(guard);
                if !packets.is_empty() {
                    notify.notify_waiters();
                }
            }
            Err(e) => {
                log::warn!("{}: read error: {}", name, e);
                return;
            }
        }
    }
}
