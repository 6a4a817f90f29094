//! Capture device ports.
//!
//! The core only talks to the capture hardware through [`CaptureDevice`]: the
//! buffer protocol (request, map, queue, dequeue), input switching and the
//! monotonic clock. Opening the device and negotiating the format are one-shot
//! setup calls on [`CapturePort`].
//!
//! Backends:
//! - `stub://<name>`: synthetic capture, always available (testing, dry runs)
//! - anything else: a V4L2 character device (feature: `v4l2`)

use std::fmt;
use std::time::Duration;

use crate::error::{Result, UnmixError};
use crate::scheduler::Source;
use crate::Timestamp;

pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticCapture, SyntheticRegion};
#[cfg(feature = "v4l2")]
pub use v4l2::{MmapRegion, V4l2Capture};

/// A buffer handed back by the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    /// Bytes the hardware actually wrote.
    pub bytes_used: usize,
    /// Capture time reported by the driver (monotonic clock).
    pub captured_at: Timestamp,
}

/// Memory of one device buffer mapped into the process.
///
/// Dropping the region unmaps it.
pub trait MappedRegion {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the first `len` bytes (clamped to the region size).
    fn with_bytes<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R;
}

/// Streaming capture device.
///
/// "Try later" is reported as `Ok(None)` from [`dequeue_buffer`]; interrupted
/// calls are retried by the implementation. Every `Err` is fatal.
///
/// [`dequeue_buffer`]: CaptureDevice::dequeue_buffer
pub trait CaptureDevice {
    type Region: MappedRegion;

    /// Ask for `count` buffers, returns how many the driver granted.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    fn map_buffer(&mut self, index: u32) -> Result<Self::Region>;

    /// Give the buffer set back to the driver. All regions must be unmapped.
    fn free_buffers(&mut self) -> Result<()>;

    fn queue_buffer(&mut self, index: u32) -> Result<()>;

    fn dequeue_buffer(&mut self) -> Result<Option<DequeuedBuffer>>;

    /// Block until a buffer may be ready. `false` on timeout.
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool>;

    fn select_input(&mut self, input: u32) -> Result<()>;

    fn set_standard(&mut self, standard: VideoStandard) -> Result<()>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    /// Current time on the clock the driver stamps buffers with.
    fn now(&mut self) -> Timestamp;
}

// -------------------- Formats --------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldOrder {
    Any,
    Progressive,
    #[default]
    Interlaced,
    InterlacedTb,
    InterlacedBt,
    Alternate,
}

impl FieldOrder {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "any" => Some(FieldOrder::Any),
            "none" | "progressive" => Some(FieldOrder::Progressive),
            "interlaced" => Some(FieldOrder::Interlaced),
            "interlaced_tb" => Some(FieldOrder::InterlacedTb),
            "interlaced_bt" => Some(FieldOrder::InterlacedBt),
            "alternate" => Some(FieldOrder::Alternate),
            _ => None,
        }
    }
}

/// Analog video standard applied after selecting an input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoStandard {
    #[default]
    Ntsc,
    Pal,
    Secam,
}

impl VideoStandard {
    /// `v4l2_std_id` bit set.
    pub fn id(self) -> u64 {
        match self {
            VideoStandard::Ntsc => 0x0000_b000,
            VideoStandard::Pal => 0x0000_00ff,
            VideoStandard::Secam => 0x00ff_0000,
        }
    }

    /// Duration of one frame.
    pub fn frame_interval(self) -> Duration {
        match self {
            VideoStandard::Ntsc => Duration::from_micros(33_367),
            VideoStandard::Pal | VideoStandard::Secam => Duration::from_millis(40),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ntsc" => Some(VideoStandard::Ntsc),
            "pal" => Some(VideoStandard::Pal),
            "secam" => Some(VideoStandard::Secam),
            _ => None,
        }
    }
}

/// Pixel format requested for the capture input and every output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
    pub field: FieldOrder,
}

impl PixelFormat {
    /// Size of one frame for the packed/planar formats we know about.
    pub fn estimated_frame_size(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        match &self.fourcc {
            b"YU12" | b"YV12" | b"NV12" | b"NV21" => pixels * 3 / 2,
            b"RGB3" | b"BGR3" => pixels * 3,
            b"GREY" => pixels,
            _ => pixels * 2,
        }
    }

    pub fn fourcc_str(&self) -> String {
        String::from_utf8_lossy(&self.fourcc).into_owned()
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fourcc: *b"YU12",
            field: FieldOrder::Interlaced,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}, {}, {:?}",
            self.width,
            self.height,
            self.fourcc_str(),
            self.field
        )
    }
}

/// Format the driver agreed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub format: PixelFormat,
    /// Bytes per frame (`sizeimage`). Captured frames of any other length are
    /// dropped.
    pub frame_size: usize,
    /// Shortest settle margin that keeps attribution correct on this device.
    pub min_settle: Duration,
}

// -------------------- Buffer timestamps --------------------

const BUF_FLAG_TIMESTAMP_MASK: u32 = 0x0000_e000;
const BUF_FLAG_TIMESTAMP_MONOTONIC: u32 = 0x0000_2000;
const BUF_FLAG_TSTAMP_SRC_MASK: u32 = 0x0007_0000;
const BUF_FLAG_TSTAMP_SRC_SOE: u32 = 0x0001_0000;

/// Moment of the frame a driver timestamp refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StampSource {
    EndOfFrame,
    StartOfExposure,
}

/// Decode the timestamp bits of `v4l2_buffer.flags`. Attribution compares
/// buffer timestamps with `CLOCK_MONOTONIC`, so any other clock is fatal.
pub fn check_buffer_timestamps(device: &str, flags: u32) -> Result<StampSource> {
    if flags & BUF_FLAG_TIMESTAMP_MASK != BUF_FLAG_TIMESTAMP_MONOTONIC {
        return Err(UnmixError::UnsupportedTimestamps {
            device: device.to_string(),
            flags,
        });
    }
    if flags & BUF_FLAG_TSTAMP_SRC_MASK == BUF_FLAG_TSTAMP_SRC_SOE {
        Ok(StampSource::StartOfExposure)
    } else {
        Ok(StampSource::EndOfFrame)
    }
}

// -------------------- Port selection --------------------

/// Capture device selected from a path.
pub enum CapturePort {
    Synthetic(SyntheticCapture),
    #[cfg(feature = "v4l2")]
    V4l2(V4l2Capture),
}

/// Region type of [`CapturePort`].
pub enum PortRegion {
    Synthetic(SyntheticRegion),
    #[cfg(feature = "v4l2")]
    V4l2(MmapRegion),
}

impl CapturePort {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(name) = path.strip_prefix("stub://") {
            return Ok(CapturePort::Synthetic(SyntheticCapture::new(name)));
        }
        Self::open_device(path)
    }

    #[cfg(feature = "v4l2")]
    fn open_device(path: &str) -> Result<Self> {
        Ok(CapturePort::V4l2(V4l2Capture::open(path)?))
    }

    #[cfg(not(feature = "v4l2"))]
    fn open_device(path: &str) -> Result<Self> {
        Err(UnmixError::Config(format!(
            "{path}: built without the v4l2 feature, only stub:// inputs are available"
        )))
    }

    /// Check capabilities, set up every source's input and negotiate the
    /// capture format.
    pub fn configure(
        &mut self,
        sources: &[Source],
        default_standard: VideoStandard,
        format: &PixelFormat,
    ) -> Result<NegotiatedFormat> {
        if sources.is_empty() {
            return Err(UnmixError::Config("should specify at least one input".into()));
        }
        match self {
            CapturePort::Synthetic(dev) => dev.configure(sources, default_standard, format),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.configure(sources, default_standard, format),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CapturePort::Synthetic(dev) => dev.name(),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.path(),
        }
    }
}

impl MappedRegion for PortRegion {
    fn len(&self) -> usize {
        match self {
            PortRegion::Synthetic(region) => region.len(),
            #[cfg(feature = "v4l2")]
            PortRegion::V4l2(region) => region.len(),
        }
    }

    fn with_bytes<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            PortRegion::Synthetic(region) => region.with_bytes(len, f),
            #[cfg(feature = "v4l2")]
            PortRegion::V4l2(region) => region.with_bytes(len, f),
        }
    }
}

impl CaptureDevice for CapturePort {
    type Region = PortRegion;

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        match self {
            CapturePort::Synthetic(dev) => dev.request_buffers(count),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.request_buffers(count),
        }
    }

    fn map_buffer(&mut self, index: u32) -> Result<PortRegion> {
        match self {
            CapturePort::Synthetic(dev) => dev.map_buffer(index).map(PortRegion::Synthetic),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.map_buffer(index).map(PortRegion::V4l2),
        }
    }

    fn free_buffers(&mut self) -> Result<()> {
        match self {
            CapturePort::Synthetic(dev) => dev.free_buffers(),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.free_buffers(),
        }
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        match self {
            CapturePort::Synthetic(dev) => dev.queue_buffer(index),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.queue_buffer(index),
        }
    }

    fn dequeue_buffer(&mut self) -> Result<Option<DequeuedBuffer>> {
        match self {
            CapturePort::Synthetic(dev) => dev.dequeue_buffer(),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.dequeue_buffer(),
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        match self {
            CapturePort::Synthetic(dev) => dev.wait_ready(timeout),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.wait_ready(timeout),
        }
    }

    fn select_input(&mut self, input: u32) -> Result<()> {
        match self {
            CapturePort::Synthetic(dev) => dev.select_input(input),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.select_input(input),
        }
    }

    fn set_standard(&mut self, standard: VideoStandard) -> Result<()> {
        match self {
            CapturePort::Synthetic(dev) => dev.set_standard(standard),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.set_standard(standard),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        match self {
            CapturePort::Synthetic(dev) => dev.stream_on(),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.stream_on(),
        }
    }

    fn stream_off(&mut self) -> Result<()> {
        match self {
            CapturePort::Synthetic(dev) => dev.stream_off(),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.stream_off(),
        }
    }

    fn now(&mut self) -> Timestamp {
        match self {
            CapturePort::Synthetic(dev) => dev.now(),
            #[cfg(feature = "v4l2")]
            CapturePort::V4l2(dev) => dev.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_estimates() {
        let mut format = PixelFormat::default();
        assert_eq!(format.estimated_frame_size(), 640 * 480 * 3 / 2);
        format.fourcc = *b"YUYV";
        assert_eq!(format.estimated_frame_size(), 640 * 480 * 2);
        format.fourcc = *b"RGB3";
        assert_eq!(format.estimated_frame_size(), 640 * 480 * 3);
    }

    #[test]
    fn standards_and_fields_parse() {
        assert_eq!(VideoStandard::parse("PAL"), Some(VideoStandard::Pal));
        assert_eq!(VideoStandard::parse("ntsc").map(|s| s.id()), Some(0xb000));
        assert_eq!(VideoStandard::parse("mpeg"), None);
        assert_eq!(FieldOrder::parse("none"), Some(FieldOrder::Progressive));
        assert_eq!(FieldOrder::parse("Interlaced"), Some(FieldOrder::Interlaced));
        assert_eq!(FieldOrder::parse("weird"), None);
    }

    #[test]
    fn monotonic_buffer_timestamps_are_accepted() -> Result<()> {
        assert_eq!(
            check_buffer_timestamps("cam", 0x2001)?,
            StampSource::EndOfFrame
        );
        assert_eq!(
            check_buffer_timestamps("cam", 0x1_2001)?,
            StampSource::StartOfExposure
        );
        assert_eq!(VideoStandard::Pal.frame_interval(), Duration::from_millis(40));
        Ok(())
    }

    #[test]
    fn other_buffer_clocks_are_fatal() {
        // unknown clock, then copied timestamps
        for flags in [0x0001, 0x4001] {
            let err = check_buffer_timestamps("/dev/video0", flags).unwrap_err();
            assert!(matches!(&err, UnmixError::UnsupportedTimestamps { flags: f, .. } if *f == flags));
            assert!(err.to_string().contains("/dev/video0"));
        }
    }

    #[test]
    fn stub_paths_open_synthetic_capture() {
        let port = CapturePort::open("stub://bench").expect("open stub");
        assert!(matches!(port, CapturePort::Synthetic(_)));
        assert_eq!(port.name(), "stub://bench");
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn device_paths_need_v4l2_feature() {
        let err = CapturePort::open("/dev/video0").err().expect("must fail");
        assert!(err.to_string().contains("v4l2 feature"));
    }

    #[test]
    fn configure_rejects_empty_source_list() {
        let mut port = CapturePort::open("stub://empty").expect("open stub");
        let err = port
            .configure(&[], VideoStandard::Ntsc, &PixelFormat::default())
            .unwrap_err();
        assert!(matches!(err, UnmixError::Config(_)));
    }
}
