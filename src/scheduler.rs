//! # Capture Scheduler
//!
//! Decides when the next capture happens and when the day is over.
//!
//! ## States
//! - `Warmup`: fixed delay after start, then `Capturing`
//! - `Capturing`: configured period, captures aligned to 30-second marks
//! - `NearNoonAccelerated`: the next capture would fall within the noon
//!   window, so the period drops to 30 s (the persisted period is untouched)
//! - `Terminating`: after sunset, the scene is Night and the dark-boundary
//!   image has been delivered
//!
//! ## Timing
//! A capture starts `prolog` before a mark so the still lands on it. The
//! end-of-cycle sleep wakes `wake_ahead` before the next mark and the
//! alignment wait covers the remainder, which absorbs processing overhead.

use crate::config::ScheduleConfig;
use crate::ephemeris::{Daylight, SolarDay};
use crate::SceneState;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shortest period, used for `period_m = 0` and near noon.
pub const MIN_PERIOD_SECS: u64 = 30;
/// Longest period, 15 minutes.
pub const MAX_PERIOD_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Warmup,
    Capturing,
    NearNoonAccelerated,
    Terminating,
}

/// Convert the configured period (minutes) into seconds.
///
/// # Example
/// ```
/// use sundial_cam_lib::scheduler::normalize_period;
///
/// assert_eq!(normalize_period(0), 30);
/// assert_eq!(normalize_period(7), 420);
/// assert_eq!(normalize_period(20), 900);
/// ```
pub fn normalize_period(period_m: u32) -> u64 {
    match period_m {
        0 => MIN_PERIOD_SECS,
        m if m > 15 => MAX_PERIOD_SECS,
        m => u64::from(m) * 60,
    }
}

/// The scheduler's decision for the end of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextWait {
    /// Period in force for the next capture, seconds
    pub period_secs: u64,
    /// Sleep before the alignment wait
    pub sleep: Duration,
    /// Noon window forced the short period
    pub accelerated: bool,
}

/// Cycle-duration bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleMetrics {
    pub cycles: u64,
    pub overruns: u64,
    pub worst_cycle: Duration,
}

#[derive(Debug, Clone)]
pub struct CaptureScheduler {
    config: ScheduleConfig,
    state: SchedulerState,
    metrics: CycleMetrics,
}

impl CaptureScheduler {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Warmup,
            metrics: CycleMetrics::default(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn metrics(&self) -> CycleMetrics {
        self.metrics
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.config.warmup_secs)
    }

    /// Leave `Warmup`. Called once, with or without the delay.
    pub fn start_capturing(&mut self) {
        if self.state == SchedulerState::Warmup {
            info!("Warmup over, capturing");
            self.state = SchedulerState::Capturing;
        }
    }

    /// Time from `now` to the capture start for the next alignment mark.
    pub fn alignment_wait(&self, now: DateTime<Utc>) -> Duration {
        let mark = (self.config.align_secs.max(1) * 1000) as i64;
        let target = mark - self.config.prolog_ms as i64;
        let into = now.timestamp_millis().rem_euclid(mark);
        Duration::from_millis((target - into).rem_euclid(mark) as u64)
    }

    /// Period for the capture after `capture_at`, honouring the noon window.
    pub fn period_for(&self, capture_at: DateTime<Utc>, period_m: u32, solar: &SolarDay) -> (u64, bool) {
        let configured = normalize_period(period_m);
        if matches!(solar.daylight, Daylight::PolarDay | Daylight::PolarNight) {
            return (self.config.polar_period_secs, false);
        }

        let half = chrono::Duration::minutes(self.config.noon_window_mins);
        let window_start = solar.noon - half;
        let window_end = solar.noon + half;
        let next = capture_at + chrono::Duration::seconds(configured as i64);
        let inside = |t: DateTime<Utc>| t >= window_start && t <= window_end;

        if !inside(capture_at) && !inside(next) {
            return (configured, false);
        }
        // Land on the window start if it is still more than one short
        // period away, then run at the short period.
        let lead = (window_start - capture_at).num_seconds();
        if lead > MIN_PERIOD_SECS as i64 {
            (lead as u64, false)
        } else {
            (MIN_PERIOD_SECS, true)
        }
    }

    /// Plan the sleep that ends this cycle.
    ///
    /// `capture_at` is the capture instant, `now` the end of processing.
    pub fn plan_next(
        &mut self,
        capture_at: DateTime<Utc>,
        now: DateTime<Utc>,
        period_m: u32,
        solar: &SolarDay,
    ) -> NextWait {
        let (period_secs, accelerated) = self.period_for(capture_at, period_m, solar);
        if self.state != SchedulerState::Terminating {
            self.state = if accelerated {
                SchedulerState::NearNoonAccelerated
            } else {
                SchedulerState::Capturing
            };
        }

        // Next mark after the period, minus the wake-ahead margin
        let align = self.config.align_secs.max(1) as i64;
        let secs_into = capture_at.timestamp().rem_euclid(align);
        let wake = capture_at + chrono::Duration::seconds(period_secs as i64 - secs_into)
            - chrono::Duration::seconds(self.config.wake_ahead_secs as i64);
        let sleep = (wake - now).to_std().unwrap_or(Duration::ZERO);

        debug!(
            "Next capture in {} s (sleep {:?}, accelerated {})",
            period_secs, sleep, accelerated
        );
        NextWait {
            period_secs,
            sleep,
            accelerated,
        }
    }

    /// Record a cycle's duration. Returns whether it overran.
    pub fn record_cycle(&mut self, elapsed: Duration) -> bool {
        self.metrics.cycles += 1;
        if elapsed > self.metrics.worst_cycle {
            self.metrics.worst_cycle = elapsed;
        }
        let overrun = elapsed > Duration::from_secs(self.config.max_cycle_secs);
        if overrun {
            self.metrics.overruns += 1;
            warn!(
                "Cycle took {:.1} s (limit {} s, {} overruns in {} cycles, worst {:.1} s)",
                elapsed.as_secs_f64(),
                self.config.max_cycle_secs,
                self.metrics.overruns,
                self.metrics.cycles,
                self.metrics.worst_cycle.as_secs_f64()
            );
        }
        overrun
    }

    /// Enter `Terminating` when the day is over.
    ///
    /// Requires the capture to be after sunset, the scene to be Night and no
    /// dark-boundary image to be waiting for delivery.
    pub fn check_termination(
        &mut self,
        capture_at: DateTime<Utc>,
        solar: &SolarDay,
        scene: SceneState,
        boundary_pending: bool,
    ) -> bool {
        if self.state == SchedulerState::Terminating {
            return true;
        }
        if solar.is_after_sunset(capture_at) && scene == SceneState::Night && !boundary_pending {
            info!("After sunset and dark boundary delivered, terminating");
            self.state = SchedulerState::Terminating;
            return true;
        }
        false
    }
}
