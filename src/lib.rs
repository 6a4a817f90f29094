//! v4l2-unmix
//!
//! Splits a single time-division-multiplexed V4L2 capture input into one
//! output device per source. The capture hardware is switched between its
//! inputs in round-robin; every captured frame is attributed to the input it
//! was actually taken from and written to that input's output (typically a
//! v4l2loopback device), so consumers see one continuous stream per camera.
//!
//! # Architecture
//!
//! Two threads, one shared structure:
//!
//! 1. **Capture thread**: [`BufferPool`] (kernel-mapped frame buffers and their
//!    lifecycle) driven by the [`Scheduler`] (input switching, timestamp
//!    attribution, per-source quota).
//! 2. **Relay consumer**: the output side of the [`FrameRelay`], writing staged
//!    frames to their [`OutputSink`] in FIFO order.
//!
//! The relay's slot arena is the only state crossing the thread boundary. A
//! frame is copied into a slot before its mapped buffer is handed back to the
//! hardware, so slow sinks never delay buffer reclamation.
//!
//! # Module Structure
//!
//! - `device`: capture device ports (V4L2, synthetic `stub://`)
//! - `pool`: mapped buffer pool and buffer state machine
//! - `scheduler`: input switching and frame attribution
//! - `relay`: bounded staging queue and its consumer thread
//! - `sink`: output device ports
//! - `unmix`: wiring and orderly shutdown
//! - `config`: configuration file, environment overrides, validation

use std::fmt;
use std::time::Duration;

pub mod config;
pub mod device;
pub mod error;
pub mod pool;
pub mod relay;
pub mod scheduler;
pub mod sink;
pub mod unmix;

pub use config::{SourceSettings, UnmixConfig};
pub use device::{
    CaptureDevice, CapturePort, DequeuedBuffer, FieldOrder, MappedRegion, NegotiatedFormat,
    PixelFormat, VideoStandard,
};
pub use error::{Result, UnmixError};
pub use pool::{BufferIndex, BufferPool, BufferState, FilledBuffer};
pub use relay::{FrameRelay, RelayConfig, RelayStats, ShutdownMode, Stage, StagedFrame};
pub use scheduler::{
    Attribution, Scheduler, SchedulerConfig, SchedulerCursor, SchedulerStats, Source, SourceId,
    StepOutcome, StepReport, SwitchWindow,
};
pub use sink::{FileSink, NullSink, OutputSink, SinkPort};
pub use unmix::{run, run_pipeline, RunSummary};

// -------------------- Timestamps --------------------

/// Point on the monotonic clock, in microseconds.
///
/// V4L2 drivers stamp buffers with `CLOCK_MONOTONIC`, so capture timestamps and
/// switch timestamps taken with [`Timestamp::monotonic_now`] are comparable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_micros(us: u64) -> Self {
        Timestamp(us)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Convert a `struct timeval` as reported in `v4l2_buffer.timestamp`.
    pub fn from_timeval(sec: i64, usec: i64) -> Self {
        let sec = sec.max(0) as u64;
        let usec = usec.max(0) as u64;
        Timestamp(sec.saturating_mul(1_000_000).saturating_add(usec))
    }

    pub fn monotonic_now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        Timestamp::from_timeval(ts.tv_sec as i64, ts.tv_nsec as i64 / 1_000)
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_micros() as u64))
    }

    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}
