//! Input scheduler.
//!
//! Drives the hardware input selector through the source list and attributes
//! every dequeued frame to the source it was actually captured from.
//!
//! Attribution is by timestamp. Each switch records when `VIDIOC_S_INPUT` was
//! issued and when it (and the optional standard change) completed; the
//! settling window closes at completion plus a configurable margin. Frames
//! captured before the window closes still show the previous input and go to
//! the previous source's sink; frames captured afterwards belong to the newly
//! selected source. Drivers fill buffers in queue order, so once a frame of
//! the new source has been seen no older frame can follow it.
//!
//! ```text
//! Idle ─▶ SelectSource(k) ─▶ CollectQuota ─▶ SelectSource(k+1 mod N) ─▶ …
//! ```
//!
//! The cursor advances only after `quota` frames were attributed to the
//! current source, which bounds the latency of every source to roughly
//! `N × quota` frame intervals.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::device::{CaptureDevice, VideoStandard};
use crate::error::{Result, UnmixError};
use crate::pool::{BufferPool, FilledBuffer};
use crate::relay::Stage;
use crate::Timestamp;

/// Position of a source in the source list; also selects its sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(usize);

impl SourceId {
    pub const fn new(position: usize) -> Self {
        SourceId(position)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical input on the shared capture path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    pub id: SourceId,
    /// Hardware input index (`VIDIOC_S_INPUT`).
    pub input: u32,
    /// Standard applied after every switch to this input.
    pub standard: Option<VideoStandard>,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Frames per source before switching, at least 1.
    pub quota: u32,
    /// Negotiated frame size; frames of any other length are dropped.
    pub frame_size: usize,
    /// How long to wait for a capture before giving up.
    pub capture_timeout: Duration,
    /// Extra settling time after a switch completes.
    pub settle_margin: Duration,
    pub stats_interval: Duration,
}

impl SchedulerConfig {
    /// Check the settings against the source list before any device state is
    /// touched.
    pub fn check(&self, sources: &[Source]) -> Result<()> {
        if sources.is_empty() {
            return Err(UnmixError::Config("should specify at least one input".into()));
        }
        if self.quota == 0 {
            return Err(UnmixError::Config("quota must be at least 1".into()));
        }
        if let Some((position, source)) = sources.iter().enumerate().find(|(i, s)| s.id.0 != *i) {
            return Err(UnmixError::Config(format!(
                "source {} listed at position {}",
                source.id, position
            )));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quota: 2,
            frame_size: 0,
            capture_timeout: Duration::from_secs(2),
            settle_margin: Duration::ZERO,
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Result of attributing one captured frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attribution {
    Source(SourceId),
    /// Captured before the first selection settled; nobody's frame.
    Stale,
}

/// Timing of one input switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchWindow {
    pub previous: Option<SourceId>,
    pub current: SourceId,
    pub issued_at: Timestamp,
    pub closes_at: Timestamp,
}

impl SwitchWindow {
    pub fn attribute(&self, captured_at: Timestamp) -> Attribution {
        if captured_at >= self.closes_at {
            return Attribution::Source(self.current);
        }
        match self.previous {
            Some(previous) => Attribution::Source(previous),
            None => Attribution::Stale,
        }
    }
}

/// Scheduler position. Only the scheduler advances it.
#[derive(Clone, Debug, Default)]
pub struct SchedulerCursor {
    current: SourceId,
    collected: u32,
    window: Option<SwitchWindow>,
    rounds: u64,
}

impl SchedulerCursor {
    pub fn current(&self) -> SourceId {
        self.current
    }

    /// Frames attributed to the current source since it was selected.
    pub fn collected(&self) -> u32 {
        self.collected
    }

    pub fn window(&self) -> Option<SwitchWindow> {
        self.window
    }

    /// Completed passes over the whole source list.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    fn advance(&mut self, sources: usize) {
        let next = (self.current.0 + 1) % sources;
        if next == 0 {
            self.rounds += 1;
        }
        self.current = SourceId(next);
        self.collected = 0;
    }
}

/// What one SelectSource + CollectQuota cycle did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepReport {
    pub source: SourceId,
    pub window: SwitchWindow,
    /// Frames attributed to `source`.
    pub collected: u32,
    /// Late frames routed to the previous source.
    pub stale_routed: u32,
    /// Frames captured before the first selection settled.
    pub stale_dropped: u32,
    /// Frames with the wrong length.
    pub corrupt_dropped: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Completed(StepReport),
    Stopped,
}

/// Counters over the whole run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub frames_per_source: Vec<u64>,
    pub stale_routed: u64,
    pub stale_dropped: u64,
    pub corrupt_dropped: u64,
    pub switches: u64,
}

pub struct Scheduler<D: CaptureDevice> {
    pool: BufferPool<D>,
    sources: Vec<Source>,
    config: SchedulerConfig,
    cursor: SchedulerCursor,
    stats: SchedulerStats,
}

impl<D: CaptureDevice> Scheduler<D> {
    pub fn new(pool: BufferPool<D>, sources: Vec<Source>, config: SchedulerConfig) -> Result<Self> {
        config.check(&sources)?;
        let stats = SchedulerStats {
            frames_per_source: vec![0; sources.len()],
            ..SchedulerStats::default()
        };
        Ok(Self {
            pool,
            sources,
            config,
            cursor: SchedulerCursor::default(),
            stats,
        })
    }

    pub fn pool(&self) -> &BufferPool<D> {
        &self.pool
    }

    pub fn cursor(&self) -> &SchedulerCursor {
        &self.cursor
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Queue every buffer and start streaming.
    pub fn start(&mut self) -> Result<()> {
        self.pool.queue_all()?;
        self.pool.start_streaming()
    }

    /// Stop issuing captures; the driver gives all queued buffers back.
    pub fn stop(&mut self) -> Result<()> {
        self.pool.stop_streaming()
    }

    pub fn into_pool(self) -> BufferPool<D> {
        self.pool
    }

    /// Select the current source and collect its quota.
    pub fn step<S: Stage>(&mut self, relay: &mut S, shutdown: &AtomicBool) -> Result<StepOutcome> {
        if !self.pool.is_streaming() {
            self.start()?;
        }
        let window = self.select(self.cursor.current)?;
        let mut report = StepReport {
            source: window.current,
            window,
            collected: 0,
            stale_routed: 0,
            stale_dropped: 0,
            corrupt_dropped: 0,
        };

        while report.collected < self.config.quota {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(StepOutcome::Stopped);
            }
            let Some(filled) = self.pool.dequeue()? else {
                if !self.pool.device_mut().wait_ready(self.config.capture_timeout)?
                    && !shutdown.load(Ordering::Relaxed)
                {
                    return Err(UnmixError::CaptureTimeout(self.config.capture_timeout));
                }
                continue;
            };
            self.handle(filled, &window, relay, &mut report)?;
            self.cursor.collected = report.collected;
        }

        self.cursor.advance(self.sources.len());
        Ok(StepOutcome::Completed(report))
    }

    /// Cycle through the sources until `shutdown` is set.
    pub fn run<S: Stage>(&mut self, relay: &mut S, shutdown: &AtomicBool) -> Result<()> {
        let mut last_stats = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            match self.step(relay, shutdown)? {
                StepOutcome::Stopped => break,
                StepOutcome::Completed(report) => {
                    if report.corrupt_dropped > 0 || report.stale_routed > 0 {
                        log::debug!(
                            "source {}: {} frames, {} late frames to previous source, {} corrupt",
                            report.source,
                            report.collected,
                            report.stale_routed,
                            report.corrupt_dropped
                        );
                    }
                }
            }
            if last_stats.elapsed() >= self.config.stats_interval {
                self.log_stats();
                last_stats = Instant::now();
            }
        }
        self.log_stats();
        Ok(())
    }

    fn log_stats(&self) {
        log::info!(
            "rounds={} frames={:?} late={} dropped_stale={} dropped_corrupt={}",
            self.cursor.rounds,
            self.stats.frames_per_source,
            self.stats.stale_routed,
            self.stats.stale_dropped,
            self.stats.corrupt_dropped
        );
    }

    fn select(&mut self, id: SourceId) -> Result<SwitchWindow> {
        let source = &self.sources[id.0];
        let device = self.pool.device_mut();
        let issued_at = device.now();
        device.select_input(source.input)?;
        if let Some(standard) = source.standard {
            device.set_standard(standard)?;
        }
        let completed_at = device.now();

        let window = SwitchWindow {
            previous: self.cursor.window.map(|w| w.current),
            current: id,
            issued_at,
            closes_at: completed_at.saturating_add(self.config.settle_margin),
        };
        self.cursor.window = Some(window);
        self.cursor.collected = 0;
        self.stats.switches += 1;
        log::trace!(
            "selected input {} for source {} ({} .. {})",
            source.input,
            id,
            window.issued_at,
            window.closes_at
        );
        Ok(window)
    }

    fn handle<S: Stage>(
        &mut self,
        filled: FilledBuffer,
        window: &SwitchWindow,
        relay: &mut S,
        report: &mut StepReport,
    ) -> Result<()> {
        if filled.bytes_used() != self.config.frame_size {
            log::debug!(
                "dropping frame in buffer {}: {} bytes, expected {}",
                filled.index(),
                filled.bytes_used(),
                self.config.frame_size
            );
            report.corrupt_dropped += 1;
            self.stats.corrupt_dropped += 1;
            return self.pool.recycle(filled);
        }

        let id = match window.attribute(filled.captured_at()) {
            Attribution::Source(id) => id,
            Attribution::Stale => {
                log::debug!(
                    "dropping frame captured at {} before the first switch settled",
                    filled.captured_at()
                );
                report.stale_dropped += 1;
                self.stats.stale_dropped += 1;
                return self.pool.recycle(filled);
            }
        };

        // The relay copies the frame, so the buffer can go straight back.
        self.pool.read(&filled, |bytes| relay.stage(id, bytes))?;
        self.pool.recycle(filled)?;

        if id == window.current {
            report.collected += 1;
        } else {
            report.stale_routed += 1;
            self.stats.stale_routed += 1;
        }
        self.stats.frames_per_source[id.0] += 1;
        log::trace!("{}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(us: u64) -> Timestamp {
        Timestamp::from_micros(us)
    }

    #[test]
    fn frames_straddling_a_switch() {
        let window = SwitchWindow {
            previous: Some(SourceId::new(0)),
            current: SourceId::new(1),
            issued_at: ts(101),
            closes_at: ts(103),
        };
        let attributed: Vec<_> = (100..=106).map(|t| window.attribute(ts(t))).collect();
        let s0 = Attribution::Source(SourceId::new(0));
        let s1 = Attribution::Source(SourceId::new(1));
        assert_eq!(attributed, vec![s0, s0, s0, s1, s1, s1, s1]);
    }

    #[test]
    fn first_window_has_no_previous_source() {
        let window = SwitchWindow {
            previous: None,
            current: SourceId::new(0),
            issued_at: ts(10),
            closes_at: ts(12),
        };
        assert_eq!(window.attribute(ts(11)), Attribution::Stale);
        assert_eq!(
            window.attribute(ts(12)),
            Attribution::Source(SourceId::new(0))
        );
    }

    #[test]
    fn cursor_wraps_and_counts_rounds() {
        let mut cursor = SchedulerCursor::default();
        cursor.collected = 3;
        cursor.advance(3);
        assert_eq!(cursor.current(), SourceId::new(1));
        assert_eq!(cursor.collected(), 0);
        cursor.advance(3);
        cursor.advance(3);
        assert_eq!(cursor.current(), SourceId::new(0));
        assert_eq!(cursor.rounds(), 1);
    }

    #[test]
    fn single_source_cursor_stays_put() {
        let mut cursor = SchedulerCursor::default();
        cursor.advance(1);
        cursor.advance(1);
        assert_eq!(cursor.current(), SourceId::new(0));
        assert_eq!(cursor.rounds(), 2);
    }
}
