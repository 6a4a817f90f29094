//! Error taxonomy for the capture/relay core.
//!
//! Retryable conditions ("try later" on dequeue, interrupted calls) never
//! become errors: the device ports retry or report `Ok(None)`. Corrupt frames
//! are dropped by the scheduler. Everything in [`UnmixError`] is fatal and
//! ends the run after an orderly shutdown.

use std::io;

use thiserror::Error;

use crate::pool::BufferState;

#[derive(Error, Debug)]
pub enum UnmixError {
    /// A device call failed with an OS error.
    #[error("{op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0} is no V4L2 device")]
    NotAV4l2Device(String),

    #[error("{0} is no video capture device")]
    NotACaptureDevice(String),

    #[error("{0} does not support streaming i/o")]
    StreamingUnsupported(String),

    #[error("{device} rejected format {requested}, negotiated {negotiated}")]
    FormatRejected {
        device: String,
        requested: String,
        negotiated: String,
    },

    #[error("unable to query input {input}: {source}")]
    UnknownInput {
        input: u32,
        #[source]
        source: io::Error,
    },

    #[error("insufficient buffer memory: requested {requested} buffers, device granted {granted}")]
    InsufficientBuffers { requested: u32, granted: u32 },

    #[error("failed to map buffer {index}: {source}")]
    Map {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("buffer {index} is {state:?}, cannot {op}")]
    InvalidBufferState {
        index: u32,
        state: BufferState,
        op: &'static str,
    },

    #[error("device returned buffer {index}, pool holds {size}")]
    BufferOutOfRange { index: u32, size: usize },

    #[error("{device} does not stamp buffers with the monotonic clock (flags {flags:#x})")]
    UnsupportedTimestamps { device: String, flags: u32 },

    #[error("no frame captured within {0:?}")]
    CaptureTimeout(std::time::Duration),

    #[error("unable to write frame to output {sink}: {expected} bytes to write, {written} written")]
    ShortWrite {
        sink: String,
        expected: usize,
        written: usize,
    },

    #[error("write to output {sink} failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: io::Error,
    },

    #[error("relay: {0}")]
    Relay(String),

    #[error("relay consumer has stopped")]
    RelayClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UnmixError>;

impl UnmixError {
    pub(crate) fn device(op: &'static str, source: io::Error) -> Self {
        UnmixError::Device { op, source }
    }
}

/// Retry `f` while it fails with `EINTR`.
pub(crate) fn retry_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// `true` for the "try later" answer of a non-blocking device.
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_names_operation_and_os_error() {
        let err = UnmixError::device(
            "VIDIOC_DQBUF",
            io::Error::from_raw_os_error(libc::EIO),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("VIDIOC_DQBUF failed"));
        assert!(msg.contains("error 5") || msg.contains("Input/output error"));
    }

    #[test]
    fn short_write_display() {
        let err = UnmixError::ShortWrite {
            sink: "/dev/video1".into(),
            expected: 460800,
            written: 4096,
        };
        assert_eq!(
            err.to_string(),
            "unable to write frame to output /dev/video1: 460800 bytes to write, 4096 written"
        );
    }

    #[test]
    fn retry_interrupted_retries_only_eintr() {
        let mut calls = 0;
        let res = retry_interrupted(|| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res.unwrap(), 3);

        let mut calls = 0;
        let res: io::Result<()> = retry_interrupted(|| {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        });
        assert!(is_would_block(&res.unwrap_err()));
        assert_eq!(calls, 1);
    }
}
