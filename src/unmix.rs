//! Wiring: open the devices, run the scheduler against the relay, shut down in
//! order.
//!
//! Shutdown order matters: streaming stops first so the driver gives every
//! queued buffer back, then the relay drains (or discards, after a failure),
//! and only then are the buffers unmapped and freed.

use std::sync::atomic::AtomicBool;

use anyhow::{anyhow, Context, Result};

use crate::config::UnmixConfig;
use crate::device::{CaptureDevice, CapturePort};
use crate::error::UnmixError;
use crate::pool::BufferPool;
use crate::relay::{FrameRelay, RelayConfig, RelayStats, ShutdownMode};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerStats, Source};
use crate::sink::{OutputSink, SinkPort};

/// Counters of a finished run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Frames staged per source, late frames included.
    pub frames_per_source: Vec<u64>,
    /// Frames written per sink.
    pub written: Vec<u64>,
    pub discarded: u64,
    pub stale_routed: u64,
    pub stale_dropped: u64,
    pub corrupt_dropped: u64,
    pub switches: u64,
    pub rounds: u64,
}

impl RunSummary {
    fn new(stats: &SchedulerStats, rounds: u64, relay: RelayStats) -> Self {
        Self {
            frames_per_source: stats.frames_per_source.clone(),
            written: relay.written,
            discarded: relay.discarded,
            stale_routed: stats.stale_routed,
            stale_dropped: stats.stale_dropped,
            corrupt_dropped: stats.corrupt_dropped,
            switches: stats.switches,
            rounds,
        }
    }
}

/// Open the configured devices and demultiplex until `shutdown` is set or a
/// fatal error occurs.
pub fn run(config: &UnmixConfig, shutdown: &AtomicBool) -> Result<RunSummary> {
    config.validate()?;

    let mut port = CapturePort::open(&config.input)
        .with_context(|| format!("cannot open capture device {}", config.input))?;
    let sources = config.scheduler_sources();
    let negotiated = port
        .configure(&sources, config.standard, &config.format)
        .with_context(|| format!("cannot configure capture device {}", config.input))?;
    log::info!(
        "Format for input {} will be {}, frame with {} bytes.",
        port.name(),
        negotiated.format,
        negotiated.frame_size
    );
    if negotiated.min_settle > config.settle_margin {
        log::info!(
            "settle margin raised from {:?} to {:?} for {}",
            config.settle_margin,
            negotiated.min_settle,
            port.name()
        );
    }

    let mut sinks = Vec::with_capacity(config.sources.len());
    for output in config.outputs() {
        let sink = SinkPort::open(output, &negotiated.format)
            .with_context(|| format!("cannot open output {}", output))?;
        sinks.push(sink);
    }

    run_pipeline(
        port,
        sources,
        sinks,
        config.buffers,
        config.scheduler_config(&negotiated),
        config.relay_config(&negotiated),
        shutdown,
    )
}

/// Run an already configured capture device against `sinks`; source `k`
/// writes to `sinks[k]`.
pub fn run_pipeline<D, S>(
    device: D,
    sources: Vec<Source>,
    sinks: Vec<S>,
    buffers: u32,
    scheduler_config: SchedulerConfig,
    relay_config: RelayConfig,
    shutdown: &AtomicBool,
) -> Result<RunSummary>
where
    D: CaptureDevice,
    S: OutputSink + 'static,
{
    if sinks.len() != sources.len() {
        return Err(anyhow!(
            "{} sources but {} outputs",
            sources.len(),
            sinks.len()
        ));
    }

    scheduler_config.check(&sources)?;

    let pool = BufferPool::allocate(device, buffers).context("cannot allocate capture buffers")?;
    let relay = match FrameRelay::spawn(relay_config, sinks) {
        Ok(relay) => relay,
        Err(err) => {
            if let Err(release_err) = pool.release() {
                log::warn!("releasing capture buffers failed: {}", release_err);
            }
            return Err(err).context("cannot start frame relay");
        }
    };
    let mut relay = relay;
    let mut scheduler = Scheduler::new(pool, sources, scheduler_config)?;

    let run_result = scheduler
        .start()
        .and_then(|()| scheduler.run(&mut relay, shutdown));
    if let Err(err) = &run_result {
        log::error!("capture stopped: {}", err);
    }

    let stop_result = scheduler.stop();
    let mode = match &run_result {
        Ok(()) => ShutdownMode::Drain,
        Err(_) => ShutdownMode::Discard,
    };
    let relay_result = relay.shutdown(mode);
    let rounds = scheduler.cursor().rounds();
    let stats = scheduler.stats().clone();
    let release_result = scheduler.into_pool().release().map(drop);

    if run_result.is_err() {
        if let Err(err) = &stop_result {
            log::warn!("stopping capture failed: {}", err);
        }
        if let Err(err) = &release_result {
            log::warn!("releasing capture buffers failed: {}", err);
        }
    }
    // A closed relay on the capture side means the consumer failed; its error
    // says why.
    let relay_stats = match (run_result, relay_result) {
        (Err(UnmixError::RelayClosed), Err(relay_err)) => return Err(relay_err.into()),
        (Err(err), _) => return Err(err.into()),
        (Ok(()), Err(relay_err)) => return Err(relay_err.into()),
        (Ok(()), Ok(relay_stats)) => relay_stats,
    };
    stop_result.context("cannot stop streaming")?;
    release_result.context("cannot release capture buffers")?;

    let summary = RunSummary::new(&stats, rounds, relay_stats);
    log::info!(
        "done: frames={:?} written={:?} late={} dropped_stale={} dropped_corrupt={}",
        summary.frames_per_source,
        summary.written,
        summary.stale_routed,
        summary.stale_dropped,
        summary.corrupt_dropped
    );
    Ok(summary)
}
