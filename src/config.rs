use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::device::{FieldOrder, NegotiatedFormat, PixelFormat, VideoStandard};
use crate::pool::MIN_BUFFERS;
use crate::relay::RelayConfig;
use crate::scheduler::{SchedulerConfig, Source, SourceId};

const DEFAULT_INPUT: &str = "/dev/video0";
const DEFAULT_OUTPUTS: [&str; 2] = ["/dev/video1", "/dev/video2"];
const DEFAULT_BUFFERS: u32 = 4;
const DEFAULT_QUOTA: u32 = 2;
const DEFAULT_RELAY_CAPACITY: usize = 10;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_SETTLE_MARGIN_MS: u64 = 0;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct UnmixConfigFile {
    input: Option<String>,
    standard: Option<String>,
    buffers: Option<u32>,
    quota: Option<u32>,
    relay_capacity: Option<usize>,
    capture_timeout_ms: Option<u64>,
    settle_margin_ms: Option<u64>,
    stats_interval_secs: Option<u64>,
    format: Option<FormatConfigFile>,
    sources: Option<Vec<SourceConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct FormatConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fourcc: Option<String>,
    field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SourceConfigFile {
    input: u32,
    output: String,
    standard: Option<String>,
}

/// One source: a hardware input and the sink its frames go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub input: u32,
    pub output: String,
    pub standard: Option<VideoStandard>,
}

#[derive(Debug, Clone)]
pub struct UnmixConfig {
    /// Capture device path, or `stub://<name>`.
    pub input: String,
    pub sources: Vec<SourceSettings>,
    pub format: PixelFormat,
    /// Standard for sources without their own.
    pub standard: VideoStandard,
    pub buffers: u32,
    pub quota: u32,
    pub relay_capacity: usize,
    pub capture_timeout: Duration,
    pub settle_margin: Duration,
    pub stats_interval: Duration,
}

impl Default for UnmixConfig {
    fn default() -> Self {
        Self {
            input: DEFAULT_INPUT.to_string(),
            sources: default_sources(),
            format: PixelFormat::default(),
            standard: VideoStandard::default(),
            buffers: DEFAULT_BUFFERS,
            quota: DEFAULT_QUOTA,
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            capture_timeout: Duration::from_millis(DEFAULT_CAPTURE_TIMEOUT_MS),
            settle_margin: Duration::from_millis(DEFAULT_SETTLE_MARGIN_MS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
        }
    }
}

impl UnmixConfig {
    /// Read `path` (or `V4L2UNMIX_CONFIG` when `None`), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("V4L2UNMIX_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => match env_path.as_deref() {
                Some(path) => Some(read_config_file(Path::new(path))?),
                None => None,
            },
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: UnmixConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let standard = match file.standard.as_deref() {
            Some(name) => parse_standard(name)?,
            None => defaults.standard,
        };
        let format = match file.format {
            Some(format) => PixelFormat {
                width: format.width.unwrap_or(defaults.format.width),
                height: format.height.unwrap_or(defaults.format.height),
                fourcc: match format.fourcc.as_deref() {
                    Some(fourcc) => parse_fourcc(fourcc)?,
                    None => defaults.format.fourcc,
                },
                field: match format.field.as_deref() {
                    Some(field) => FieldOrder::parse(field)
                        .ok_or_else(|| anyhow!("unknown field order: {}", field))?,
                    None => defaults.format.field,
                },
            },
            None => defaults.format,
        };
        let sources = match file.sources {
            Some(sources) => sources
                .into_iter()
                .map(|source| {
                    Ok(SourceSettings {
                        input: source.input,
                        output: source.output,
                        standard: source.standard.as_deref().map(parse_standard).transpose()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => defaults.sources,
        };
        Ok(Self {
            input: file.input.unwrap_or(defaults.input),
            sources,
            format,
            standard,
            buffers: file.buffers.unwrap_or(defaults.buffers),
            quota: file.quota.unwrap_or(defaults.quota),
            relay_capacity: file.relay_capacity.unwrap_or(defaults.relay_capacity),
            capture_timeout: file
                .capture_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.capture_timeout),
            settle_margin: file
                .settle_margin_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle_margin),
            stats_interval: file
                .stats_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stats_interval),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(input) = std::env::var("V4L2UNMIX_INPUT") {
            if !input.trim().is_empty() {
                self.input = input;
            }
        }
        if let Ok(outputs) = std::env::var("V4L2UNMIX_OUTPUTS") {
            let parsed = split_csv(&outputs);
            if !parsed.is_empty() {
                self.set_outputs(parsed);
            }
        }
        if let Ok(quota) = std::env::var("V4L2UNMIX_QUOTA") {
            self.quota = quota
                .trim()
                .parse()
                .map_err(|_| anyhow!("V4L2UNMIX_QUOTA must be a positive integer"))?;
        }
        if let Ok(buffers) = std::env::var("V4L2UNMIX_BUFFERS") {
            self.buffers = buffers
                .trim()
                .parse()
                .map_err(|_| anyhow!("V4L2UNMIX_BUFFERS must be a positive integer"))?;
        }
        if let Ok(capacity) = std::env::var("V4L2UNMIX_RELAY_CAPACITY") {
            self.relay_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("V4L2UNMIX_RELAY_CAPACITY must be a positive integer"))?;
        }
        Ok(())
    }

    /// Check the invariants the pipeline relies on. Called by [`load`];
    /// call it again after changing fields by hand.
    ///
    /// [`load`]: UnmixConfig::load
    pub fn validate(&self) -> Result<()> {
        if self.input.trim().is_empty() {
            return Err(anyhow!("input device path must not be empty"));
        }
        if self.sources.is_empty() {
            return Err(anyhow!("should specify at least one input"));
        }
        for (i, source) in self.sources.iter().enumerate() {
            if source.output.trim().is_empty() {
                return Err(anyhow!("source {} has an empty output path", i));
            }
            if self.sources[..i].iter().any(|s| s.output == source.output) {
                return Err(anyhow!("output {} is used by more than one source", source.output));
            }
        }
        if self.buffers < MIN_BUFFERS {
            return Err(anyhow!("buffers must be at least {}", MIN_BUFFERS));
        }
        if self.quota == 0 {
            return Err(anyhow!("quota must be at least 1"));
        }
        if self.relay_capacity == 0 {
            return Err(anyhow!("relay capacity must be at least 1"));
        }
        if self.format.width == 0 || self.format.height == 0 {
            return Err(anyhow!("frame width and height must be greater than zero"));
        }
        if self.capture_timeout.is_zero() {
            return Err(anyhow!("capture timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Sources in scheduling order. A per-source standard is re-applied on
    /// every switch; once any source has one, the others get the default so
    /// switching back restores it.
    pub fn scheduler_sources(&self) -> Vec<Source> {
        let per_switch = self.sources.iter().any(|s| s.standard.is_some());
        self.sources
            .iter()
            .enumerate()
            .map(|(i, source)| Source {
                id: SourceId::new(i),
                input: source.input,
                standard: match source.standard {
                    Some(standard) => Some(standard),
                    None if per_switch => Some(self.standard),
                    None => None,
                },
            })
            .collect()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> + '_ {
        self.sources.iter().map(|s| s.output.as_str())
    }

    /// Scheduler settings for the negotiated format. The settle margin is
    /// never shorter than the device needs.
    pub fn scheduler_config(&self, negotiated: &NegotiatedFormat) -> SchedulerConfig {
        SchedulerConfig {
            quota: self.quota,
            frame_size: negotiated.frame_size,
            capture_timeout: self.capture_timeout,
            settle_margin: self.settle_margin.max(negotiated.min_settle),
            stats_interval: self.stats_interval,
        }
    }

    pub fn relay_config(&self, negotiated: &NegotiatedFormat) -> RelayConfig {
        RelayConfig {
            capacity: self.relay_capacity,
            slot_len: negotiated.frame_size,
        }
    }

    /// Replace the output paths in source order. Sources that already exist
    /// keep their input and standard; additional outputs get the input with
    /// their position as index and the default standard.
    pub fn set_outputs(&mut self, outputs: Vec<String>) {
        let mut previous = std::mem::take(&mut self.sources).into_iter();
        self.sources = outputs
            .into_iter()
            .enumerate()
            .map(|(position, output)| match previous.next() {
                Some(source) => SourceSettings { output, ..source },
                None => SourceSettings {
                    input: position as u32,
                    output,
                    standard: None,
                },
            })
            .collect();
    }
}

fn default_sources() -> Vec<SourceSettings> {
    DEFAULT_OUTPUTS
        .iter()
        .enumerate()
        .map(|(input, output)| SourceSettings {
            input: input as u32,
            output: output.to_string(),
            standard: None,
        })
        .collect()
}

fn parse_standard(name: &str) -> Result<VideoStandard> {
    VideoStandard::parse(name).ok_or_else(|| anyhow!("unknown video standard: {}", name))
}

fn parse_fourcc(value: &str) -> Result<[u8; 4]> {
    let bytes = value.as_bytes();
    if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err(anyhow!("fourcc must be four ASCII characters, got {:?}", value));
    }
    Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_config_file(path: &Path) -> Result<UnmixConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
