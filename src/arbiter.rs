//! Source arbitration: which input drives the output at each instant.
//!
//! The arbiter is pure state plus timers; it never touches packets. The
//! orchestrator ticks it (default every 100 ms) with the live input's
//! health and readiness, acts on the returned decision, and reports back
//! whether the cut actually happened. Dwell timers and the anti-flap
//! window gate every transition, including operator commands.

use std::time::{Duration, Instant};

/// The source currently driving (or chosen to drive) the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSource {
    /// The preferred live input
    Live,
    /// The always-available fallback loop
    Fallback,
}

/// What the orchestrator should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep feeding from the current source
    Stay,
    /// Perform the cut procedure onto the given source
    SwitchTo(ActiveSource),
}

/// Arbiter timer settings, in milliseconds as configured.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterTimers {
    /// Minimum spacing between any two transitions
    pub min_dwell: Duration,
    /// Continuous live health required before cutting back in
    pub recovery_dwell: Duration,
    /// Continuous live unhealth tolerated before cutting away
    pub loss_tolerance: Duration,
}

/// Health-driven source selection with anti-flap protection.
pub struct SourceArbiter {
    state: ActiveSource,
    switching_to: Option<ActiveSource>,
    timers: ArbiterTimers,
    last_transition: Instant,
    live_healthy_since: Option<Instant>,
    live_unhealthy_since: Option<Instant>,
    privacy_hold: bool,
}

impl SourceArbiter {
    /// Starts in `FALLBACK`; the fallback source must carry boot.
    pub fn new(timers: ArbiterTimers, now: Instant) -> Self {
        Self {
            state: ActiveSource::Fallback,
            switching_to: None,
            timers,
            // allow the first switch as soon as recovery dwell is served
            last_transition: now.checked_sub(timers.min_dwell).unwrap_or(now),
            live_healthy_since: None,
            live_unhealthy_since: None,
            privacy_hold: false,
        }
    }

    /// Currently committed source.
    pub fn state(&self) -> ActiveSource {
        self.state
    }

    /// Target of an in-flight cut, when one is pending.
    pub fn switching_to(&self) -> Option<ActiveSource> {
        self.switching_to
    }

    /// Operator privacy hold: pin the output to fallback while set.
    pub fn set_privacy_hold(&mut self, hold: bool) {
        if self.privacy_hold != hold {
            log::info!("privacy hold {}", if hold { "engaged" } else { "released" });
        }
        self.privacy_hold = hold;
    }

    /// Whether the privacy hold is engaged.
    pub fn privacy_hold(&self) -> bool {
        self.privacy_hold
    }

    /// Evaluates one tick. `live_ready` means the live reader reports PSI,
    /// IDR, and audio alignment all satisfied.
    pub fn tick(&mut self, now: Instant, live_healthy: bool, live_ready: bool) -> Decision {
        // streak bookkeeping first, decisions second
        if live_healthy {
            self.live_unhealthy_since = None;
            self.live_healthy_since.get_or_insert(now);
        } else {
            self.live_healthy_since = None;
            self.live_unhealthy_since.get_or_insert(now);
        }

        if let Some(target) = self.switching_to {
            // cut in flight; the orchestrator resolves it via commit/abort
            return Decision::SwitchTo(target);
        }

        if now.duration_since(self.last_transition) < self.timers.min_dwell {
            return Decision::Stay;
        }

        match self.state {
            ActiveSource::Live => {
                let lost = self
                    .live_unhealthy_since
                    .map_or(false, |since| now.duration_since(since) >= self.timers.loss_tolerance);
                if lost || self.privacy_hold {
                    self.switching_to = Some(ActiveSource::Fallback);
                    return Decision::SwitchTo(ActiveSource::Fallback);
                }
            }
            ActiveSource::Fallback => {
                let recovered = self
                    .live_healthy_since
                    .map_or(false, |since| now.duration_since(since) >= self.timers.recovery_dwell);
                if recovered && live_ready && !self.privacy_hold {
                    self.switching_to = Some(ActiveSource::Live);
                    return Decision::SwitchTo(ActiveSource::Live);
                }
            }
        }
        Decision::Stay
    }

    /// The cut completed; the target is now the committed source.
    pub fn commit(&mut self, now: Instant) {
        if let Some(target) = self.switching_to.take() {
            log::info!("source transition: {:?} -> {:?}", self.state, target);
            self.state = target;
            self.last_transition = now;
        }
    }

    /// The cut could not be performed (target readiness lapsed); stay on
    /// the committed source and re-evaluate on later ticks.
    pub fn abort_switch(&mut self) {
        if let Some(target) = self.switching_to.take() {
            log::warn!("switch to {:?} aborted, holding {:?}", target, self.state);
        }
    }
}
