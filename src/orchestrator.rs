//! Steady-state composition: readers in, arbiter decides, splice engine
//! transforms, sink writes.
//!
//! All output-side state is owned by this task. Cuts are performed
//! asynchronously: while a switch is pending the previous source keeps
//! feeding the output, so a slow IDR on the target never stalls downstream.

use crate::arbiter::{ActiveSource, ArbiterTimers, Decision, SourceArbiter};
use crate::config::{Config, InputRole};
use crate::error::{RelayError, Result};
use crate::input::InputReader;
use crate::sink::OutputSink;
use crate::splice::SpliceEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Arbiter tick and idle pump cadence.
const TICK: Duration = Duration::from_millis(100);

/// How long a pending cut may wait for the target's fresh IDR.
const CUT_DEADLINE: Duration = Duration::from_secs(5);

/// Packets pulled per pump iteration.
const PUMP_BATCH: usize = 128;

/// Cadence of the periodic stats line.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

struct PendingCut {
    target: ActiveSource,
    since: Instant,
}

/// Owns the steady-state loop and everything on the output side.
pub struct Orchestrator {
    config: Config,
    live: Option<InputReader>,
    fallback: InputReader,
    engine: SpliceEngine,
    arbiter: SourceArbiter,
    sink: OutputSink,
    active: ActiveSource,
    cursor: u64,
    pending: Option<PendingCut>,
    last_stats: Instant,
}

impl Orchestrator {
    /// Constructs readers, engine, arbiter, and sink from config. Ingest
    /// tasks start immediately.
    pub fn new(config: Config) -> Result<Self> {
        let mut live = None;
        let mut fallback = None;
        for input in &config.inputs {
            match input.role {
                InputRole::Fallback => {
                    fallback = Some(InputReader::spawn(input, &config.health)?);
                }
                InputRole::Live => {
                    if live.is_some() {
                        log::warn!("ignoring extra live input {:?}", input.name);
                        continue;
                    }
                    live = Some(InputReader::spawn(input, &config.health)?);
                }
            }
        }
        let fallback =
            fallback.ok_or_else(|| RelayError::Config("no fallback input".into()))?;

        let timers = ArbiterTimers {
            min_dwell: Duration::from_millis(config.splice.min_dwell_ms),
            recovery_dwell: Duration::from_millis(config.splice.recovery_dwell_ms),
            loss_tolerance: Duration::from_millis(config.splice.loss_tolerance_ms),
        };
        let engine = SpliceEngine::new(&config.output, config.splice.max_reorder_ms);
        let sink = OutputSink::new(config.output.pipe.clone());

        Ok(Self {
            arbiter: SourceArbiter::new(timers, Instant::now()),
            engine,
            sink,
            live,
            fallback,
            config,
            active: ActiveSource::Fallback,
            cursor: 0,
            pending: None,
            last_stats: Instant::now(),
        })
    }

    /// Runs until the shutdown signal flips. Returns a fatal error when the
    /// fallback never becomes ready inside the boot deadline.
    pub async fn run(
        &mut self,
        shutdown: watch::Receiver<bool>,
        privacy: Arc<AtomicBool>,
    ) -> Result<()> {
        self.boot().await?;

        while !*shutdown.borrow() {
            self.arbiter.set_privacy_hold(privacy.load(Ordering::Relaxed));

            let (live_healthy, live_ready) = match &self.live {
                Some(live) => (live.health().is_healthy(), live.is_ready()),
                None => (false, false),
            };
            let decision = self.arbiter.tick(Instant::now(), live_healthy, live_ready);
            if let Decision::SwitchTo(target) = decision {
                self.advance_pending_cut(target).await?;
            }

            self.pump().await?;
            self.maybe_log_stats();
        }

        log::info!("shutdown: closing output");
        if let Some(live) = &mut self.live {
            live.stop();
        }
        self.fallback.stop();
        self.sink.close().await;
        Ok(())
    }

    /// Boot sequence: fallback must become fully ready inside the
    /// deadline, then the downstream reader is awaited and the first cut
    /// emitted.
    async fn boot(&mut self) -> Result<()> {
        let deadline = Duration::from_millis(self.config.splice.boot_deadline_ms);
        let start = Instant::now();

        let info = self
            .fallback
            .await_stream_info(deadline)
            .await
            .map_err(|e| RelayError::Fatal(format!("fallback never became ready: {}", e)))?;
        log::info!(
            "fallback stream: program {} video 0x{:x} audio {:?}",
            info.program_number,
            info.video_pid,
            info.audio_pid
        );

        let remaining = deadline.saturating_sub(start.elapsed());
        self.fallback
            .await_idr(remaining)
            .await
            .map_err(|e| RelayError::Fatal(format!("fallback delivered no IDR: {}", e)))?;
        let remaining = deadline.saturating_sub(start.elapsed());
        self.fallback
            .await_audio_sync(remaining)
            .await
            .map_err(|e| RelayError::Fatal(format!("fallback audio never aligned: {}", e)))?;

        self.sink.open().await?;
        self.cut_to(ActiveSource::Fallback).await?;
        self.arbiter.commit(Instant::now());
        Ok(())
    }

    /// Drives a pending switch forward without stalling the output: reset
    /// readiness once, then cut as soon as the target re-reports ready.
    async fn advance_pending_cut(&mut self, target: ActiveSource) -> Result<()> {
        match self.pending.as_ref().map(|p| (p.target, p.since)) {
            None => {
                self.reader(target).reset_readiness();
                self.pending = Some(PendingCut {
                    target,
                    since: Instant::now(),
                });
                log::info!("awaiting fresh splice point on {:?}", target);
            }
            Some((pending_target, since)) if pending_target == target => {
                if self.reader(target).is_ready() {
                    match self.cut_to(target).await {
                        Ok(()) => {
                            self.arbiter.commit(Instant::now());
                            self.pending = None;
                        }
                        Err(e) => {
                            log::warn!("cut to {:?} failed: {}", target, e);
                            self.arbiter.abort_switch();
                            self.pending = None;
                        }
                    }
                } else if since.elapsed() > CUT_DEADLINE {
                    log::warn!("{:?} produced no splice point in time, holding", target);
                    self.arbiter.abort_switch();
                    self.pending = None;
                }
            }
            Some(_) => {
                // arbiter changed its mind mid-switch; restart tracking
                self.pending = None;
            }
        }
        Ok(())
    }

    /// The cut procedure: PSI + parameter sets, then the target's packets
    /// from its IDR forward.
    async fn cut_to(&mut self, target: ActiveSource) -> Result<()> {
        let reader = self.reader(target);
        let info = reader
            .stream_info()
            .ok_or_else(|| RelayError::NotReady("stream info vanished".into()))?;
        let idr = reader
            .idr_point()
            .ok_or_else(|| RelayError::NotReady("idr vanished".into()))?;

        if info.audio_pid.is_none()
            && !self.config.splice.allow_video_only
            && target == ActiveSource::Live
        {
            return Err(RelayError::NotReady(
                "live source has no audio and allow_video_only is off".into(),
            ));
        }

        let (start, packets) = reader.snapshot_from(idr.index);
        if start != idr.index {
            return Err(RelayError::NotReady("idr already evicted from buffer".into()));
        }

        let lead_in = self.engine.begin_source(&info, idr.timestamps);
        self.sink.write_packets(&lead_in).await?;
        for packet in &packets {
            if let Some(out) = self.engine.transform(packet) {
                self.sink.write_packet(&out).await?;
            }
        }
        self.cursor = start + packets.len() as u64;
        self.active = target;
        Ok(())
    }

    /// Moves freshly arrived packets from the active source to the sink.
    async fn pump(&mut self) -> Result<()> {
        let psi = self.engine.psi_if_due();
        if !psi.is_empty() {
            self.sink.write_packets(&psi).await?;
        }

        let reader = self.reader(self.active);
        let mut cursor = self.cursor;
        let packets = reader.consume_live(&mut cursor, PUMP_BATCH, TICK).await;
        self.cursor = cursor;

        for packet in &packets {
            if let Some(out) = self.engine.transform(packet) {
                self.sink.write_packet(&out).await?;
            }
        }
        Ok(())
    }

    fn reader(&self, source: ActiveSource) -> &InputReader {
        match source {
            ActiveSource::Fallback => &self.fallback,
            ActiveSource::Live => self
                .live
                .as_ref()
                .expect("arbiter never selects live without a live reader"),
        }
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats.elapsed() < STATS_INTERVAL {
            return;
        }
        self.last_stats = Instant::now();
        let engine = self.engine.stats();
        let sink = self.sink.stats();
        let live_bitrate = self
            .live
            .as_ref()
            .map(|r| r.health().bitrate_bps)
            .unwrap_or(0);
        let fallback_bitrate = self.fallback.health().bitrate_bps;
        let resyncs = self.fallback.resyncs()
            + self.live.as_ref().map(|r| r.resyncs()).unwrap_or(0);
        log::info!(
            "state={:?} written={}pkt/{}B reconnects={} cuts={} pts_bumps={} pcr_suppressed={} resyncs={} live={}bps fallback={}bps",
            self.active,
            sink.packets_written,
            sink.bytes_written,
            sink.reconnects,
            engine.cuts,
            engine.pts_bumps,
            engine.pcr_suppressed,
            resyncs,
            live_bitrate,
            fallback_bitrate,
        );
    }
}
