//! Output sinks.
//!
//! One sink per source, written only by the relay consumer. A sink takes
//! exactly one frame per call and reports how many bytes it accepted; the
//! relay treats anything short of the full frame as fatal.
//!
//! Sinks by path:
//! - `stub://<name>`: discards frames, counts them
//! - character devices: V4L2 output (v4l2loopback), format negotiated
//!   (feature: `v4l2`)
//! - anything else: regular file, raw frames appended back to back

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use crate::device::PixelFormat;
use crate::error::{retry_interrupted, Result, UnmixError};

pub trait OutputSink: Send {
    fn name(&self) -> &str;

    /// Write one frame with a single write call.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
}

/// Counts frames, writes nothing.
#[derive(Debug, Default)]
pub struct NullSink {
    name: String,
    frames: u64,
    bytes: u64,
}

impl NullSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl OutputSink for NullSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.frames += 1;
        self.bytes += frame.len() as u64;
        Ok(frame.len())
    }
}

/// Raw frames appended to a regular file.
pub struct FileSink {
    path: String,
    file: File,
}

impl FileSink {
    pub fn create(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| UnmixError::Sink {
                sink: path.to_string(),
                source,
            })?;
        Ok(Self {
            path: path.to_string(),
            file,
        })
    }
}

impl OutputSink for FileSink {
    fn name(&self) -> &str {
        &self.path
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        retry_interrupted(|| self.file.write(frame))
    }
}

/// V4L2 output device such as v4l2loopback.
#[cfg(feature = "v4l2")]
pub struct V4l2Sink {
    path: String,
    file: File,
}

#[cfg(feature = "v4l2")]
impl V4l2Sink {
    /// Open the device and set its output format. The write handle is opened
    /// first and stays open, so the driver keeps the negotiated format after
    /// the negotiation handle is closed.
    pub fn open(path: &str, format: &PixelFormat) -> Result<Self> {
        use v4l::video::Output;

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| UnmixError::Sink {
                sink: path.to_string(),
                source,
            })?;

        let device = v4l::Device::with_path(path).map_err(|err| UnmixError::device("open", err))?;
        let mut fmt = Output::format(&device).map_err(|err| UnmixError::device("VIDIOC_G_FMT", err))?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = v4l::FourCC::new(&format.fourcc);
        fmt.field_order = crate::device::v4l2::field_order(format.field);
        let fmt = Output::set_format(&device, &fmt).map_err(|_| {
            UnmixError::FormatRejected {
                device: path.to_string(),
                requested: format.to_string(),
                negotiated: "none".to_string(),
            }
        })?;
        log::info!(
            "Format for output {} will be {}x{}, {}, frame with {} bytes.",
            path,
            fmt.width,
            fmt.height,
            format.fourcc_str(),
            fmt.size
        );
        Ok(Self {
            path: path.to_string(),
            file,
        })
    }
}

#[cfg(feature = "v4l2")]
impl OutputSink for V4l2Sink {
    fn name(&self) -> &str {
        &self.path
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        retry_interrupted(|| self.file.write(frame))
    }
}

/// Sink selected from a path.
pub enum SinkPort {
    Null(NullSink),
    File(FileSink),
    #[cfg(feature = "v4l2")]
    V4l2(V4l2Sink),
}

impl SinkPort {
    pub fn open(path: &str, format: &PixelFormat) -> Result<Self> {
        if path.starts_with("stub://") {
            return Ok(SinkPort::Null(NullSink::new(path)));
        }
        if is_char_device(path) {
            return Self::open_device(path, format);
        }
        Ok(SinkPort::File(FileSink::create(path)?))
    }

    #[cfg(feature = "v4l2")]
    fn open_device(path: &str, format: &PixelFormat) -> Result<Self> {
        Ok(SinkPort::V4l2(V4l2Sink::open(path, format)?))
    }

    #[cfg(not(feature = "v4l2"))]
    fn open_device(path: &str, format: &PixelFormat) -> Result<Self> {
        log::warn!(
            "{}: built without the v4l2 feature, output format {} is not negotiated",
            path,
            format
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| UnmixError::Sink {
                sink: path.to_string(),
                source,
            })?;
        Ok(SinkPort::File(FileSink {
            path: path.to_string(),
            file,
        }))
    }
}

fn is_char_device(path: &str) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_char_device())
        .unwrap_or(false)
}

impl OutputSink for SinkPort {
    fn name(&self) -> &str {
        match self {
            SinkPort::Null(sink) => sink.name(),
            SinkPort::File(sink) => sink.name(),
            #[cfg(feature = "v4l2")]
            SinkPort::V4l2(sink) => sink.name(),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        match self {
            SinkPort::Null(sink) => sink.write_frame(frame),
            SinkPort::File(sink) => sink.write_frame(frame),
            #[cfg(feature = "v4l2")]
            SinkPort::V4l2(sink) => sink.write_frame(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_sink_counts_frames() -> Result<()> {
        let mut sink = SinkPort::open("stub://out0", &PixelFormat::default())?;
        assert_eq!(sink.write_frame(&[1, 2, 3]).unwrap(), 3);
        assert_eq!(sink.name(), "stub://out0");
        match sink {
            SinkPort::Null(null) => {
                assert_eq!(null.frames(), 1);
                assert_eq!(null.bytes(), 3);
            }
            _ => panic!("stub path must open a null sink"),
        }
        Ok(())
    }

    #[test]
    fn file_sink_appends_raw_frames() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out1.yuv");
        let path = path.to_str().expect("utf8 path");
        let mut sink = SinkPort::open(path, &PixelFormat::default())?;
        assert!(matches!(sink, SinkPort::File(_)));
        sink.write_frame(b"abcd").unwrap();
        sink.write_frame(b"efgh").unwrap();
        drop(sink);
        assert_eq!(std::fs::read(path).unwrap(), b"abcdefgh");
        Ok(())
    }

    #[test]
    fn unwritable_file_is_a_sink_error() {
        let err = SinkPort::open("/nonexistent-dir/out.yuv", &PixelFormat::default())
            .err()
            .expect("must fail");
        assert!(matches!(err, UnmixError::Sink { .. }));
    }
}
