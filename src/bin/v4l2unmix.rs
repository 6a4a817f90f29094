//! v4l2unmix - demultiplex a round-robin capture input
//!
//! Cycles the capture device through its inputs, attributes every frame to
//! the input it came from and writes it to that input's output device.
//! Runs until Ctrl-C or a fatal device/sink error.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use v4l2_unmix::UnmixConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Split a time-multiplexed V4L2 input into one output per source")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "V4L2UNMIX_CONFIG")]
    config: Option<PathBuf>,

    /// Capture device path, or stub://<name> for a synthetic input.
    #[arg(long)]
    input: Option<String>,

    /// Output path per source, in source order (repeatable). Configured
    /// sources keep their input and standard; extra outputs take the input
    /// numbered by their position.
    #[arg(long = "output")]
    outputs: Vec<String>,

    /// Frames per source before switching to the next input.
    #[arg(long)]
    quota: Option<u32>,

    /// Capture buffers to request.
    #[arg(long)]
    buffers: Option<u32>,

    /// Frames the relay may hold for slow outputs.
    #[arg(long)]
    relay_capacity: Option<usize>,
}

impl Args {
    fn apply(self, cfg: &mut UnmixConfig) {
        if let Some(input) = self.input {
            cfg.input = input;
        }
        if !self.outputs.is_empty() {
            cfg.set_outputs(self.outputs);
        }
        if let Some(quota) = self.quota {
            cfg.quota = quota;
        }
        if let Some(buffers) = self.buffers {
            cfg.buffers = buffers;
        }
        if let Some(capacity) = self.relay_capacity {
            cfg.relay_capacity = capacity;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = UnmixConfig::load(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate()?;

    log::info!(
        "v4l2unmix {}: {} -> {} outputs, quota {}",
        env!("CARGO_PKG_VERSION"),
        cfg.input,
        cfg.sources.len(),
        cfg.quota
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })?;
    }

    let summary = v4l2_unmix::run(&cfg, &shutdown)?;
    log::info!(
        "stopped after {} rounds, {} frames written",
        summary.rounds,
        summary.written.iter().sum::<u64>()
    );
    Ok(())
}
