//! Synthetic capture device for `stub://` inputs.
//!
//! Behaves like a multiplexing capture card without hardware:
//! - Buffers are filled in the order they were queued, one per frame interval
//! - Frames are stamped with the monotonic clock
//! - For `settle` after an input switch completes, frames still show the
//!   previous input; the switch completes at the first clock read after
//!   `select_input`, the way a driver call returns before the caller stamps it
//!
//! Every frame starts with the input it shows (1 byte) and a sequence number
//! (8 bytes, little endian); the rest is filled with the input number.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{CaptureDevice, DequeuedBuffer, MappedRegion, NegotiatedFormat, PixelFormat, VideoStandard};
use crate::error::{Result, UnmixError};
use crate::scheduler::Source;
use crate::Timestamp;

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_micros(33_367);
const MAX_BUFFERS: u32 = 32;

/// Buffer memory shared between the synthetic "hardware" and the pool.
#[derive(Clone, Debug, Default)]
pub struct SyntheticRegion {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SyntheticRegion {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    /// Write access for the device side.
    pub fn fill(&self, f: impl FnOnce(&mut [u8])) {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut bytes)
    }
}

impl MappedRegion for SyntheticRegion {
    fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn with_bytes<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let len = len.min(bytes.len());
        f(&bytes[..len])
    }
}

pub struct SyntheticCapture {
    name: String,
    format: PixelFormat,
    frame_size: usize,
    frame_interval: Duration,
    settle: Duration,
    regions: Vec<SyntheticRegion>,
    queued: VecDeque<u32>,
    streaming: bool,
    input: u32,
    previous_input: u32,
    switched_at: Timestamp,
    switch_pending: bool,
    next_capture: Timestamp,
    sequence: u64,
}

impl SyntheticCapture {
    pub fn new(name: &str) -> Self {
        let format = PixelFormat::default();
        Self {
            name: format!("stub://{name}"),
            frame_size: format.estimated_frame_size(),
            format,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            settle: DEFAULT_FRAME_INTERVAL,
            regions: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            input: 0,
            previous_input: 0,
            switched_at: Timestamp::default(),
            switch_pending: false,
            next_capture: Timestamp::default(),
            sequence: 0,
        }
    }

    /// Interval between captured frames and the settling delay after a switch.
    pub fn with_timing(mut self, frame_interval: Duration, settle: Duration) -> Self {
        self.frame_interval = frame_interval;
        self.settle = settle;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configure(
        &mut self,
        sources: &[Source],
        default_standard: VideoStandard,
        format: &PixelFormat,
    ) -> Result<NegotiatedFormat> {
        for source in sources {
            self.select_input(source.input)?;
            self.set_standard(source.standard.unwrap_or(default_standard))?;
            log::info!(
                "{}: input {} will be {}, frame with {} bytes (synthetic)",
                self.name,
                source.input,
                format,
                format.estimated_frame_size()
            );
        }
        self.format = *format;
        self.frame_size = format.estimated_frame_size();
        Ok(NegotiatedFormat {
            format: self.format,
            frame_size: self.frame_size,
            min_settle: self.settle,
        })
    }

    fn capture_into(&mut self, index: u32, captured_at: Timestamp) {
        let shown = if captured_at < self.switched_at.saturating_add(self.settle) {
            self.previous_input
        } else {
            self.input
        };
        self.sequence += 1;
        let sequence = self.sequence;
        self.regions[index as usize].fill(|bytes| {
            bytes.fill(shown as u8);
            if bytes.len() >= 9 {
                bytes[0] = shown as u8;
                bytes[1..9].copy_from_slice(&sequence.to_le_bytes());
            }
        });
    }
}

impl CaptureDevice for SyntheticCapture {
    type Region = SyntheticRegion;

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let granted = count.min(MAX_BUFFERS);
        self.regions = (0..granted)
            .map(|_| SyntheticRegion::new(self.frame_size))
            .collect();
        self.queued.clear();
        Ok(granted)
    }

    fn map_buffer(&mut self, index: u32) -> Result<SyntheticRegion> {
        self.regions
            .get(index as usize)
            .cloned()
            .ok_or_else(|| UnmixError::Map {
                index,
                source: std::io::Error::from_raw_os_error(libc::EINVAL),
            })
    }

    fn free_buffers(&mut self) -> Result<()> {
        self.regions.clear();
        self.queued.clear();
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        if index as usize >= self.regions.len() || self.queued.contains(&index) {
            return Err(UnmixError::device(
                "VIDIOC_QBUF",
                std::io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<Option<DequeuedBuffer>> {
        if !self.streaming {
            return Err(UnmixError::device(
                "VIDIOC_DQBUF",
                std::io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        let now = Timestamp::monotonic_now();
        if now < self.next_capture {
            return Ok(None);
        }
        let Some(index) = self.queued.pop_front() else {
            return Ok(None);
        };
        let captured_at = self.next_capture;
        self.capture_into(index, captured_at);
        // Fall back to real time if the consumer lagged by more than a frame.
        self.next_capture = captured_at.saturating_add(self.frame_interval).max(now);
        Ok(Some(DequeuedBuffer {
            index,
            bytes_used: self.frame_size,
            captured_at,
        }))
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        if !self.streaming || self.queued.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        let wait = self
            .next_capture
            .saturating_duration_since(Timestamp::monotonic_now());
        if wait > timeout {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        std::thread::sleep(wait);
        Ok(true)
    }

    fn select_input(&mut self, input: u32) -> Result<()> {
        self.previous_input = self.input;
        self.input = input;
        self.switched_at = Timestamp::monotonic_now();
        self.switch_pending = true;
        Ok(())
    }

    fn set_standard(&mut self, _standard: VideoStandard) -> Result<()> {
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        self.streaming = true;
        self.next_capture = Timestamp::monotonic_now().saturating_add(self.frame_interval);
        log::info!("{}: streaming started (synthetic)", self.name);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        Ok(())
    }

    fn now(&mut self) -> Timestamp {
        let now = Timestamp::monotonic_now();
        if self.switch_pending {
            self.switched_at = now;
            self.switch_pending = false;
        }
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> SyntheticCapture {
        SyntheticCapture::new("test")
            .with_timing(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn wait_frame(dev: &mut SyntheticCapture) -> DequeuedBuffer {
        loop {
            if let Some(buf) = dev.dequeue_buffer().expect("dequeue") {
                return buf;
            }
            dev.wait_ready(Duration::from_millis(50)).expect("wait");
        }
    }

    #[test]
    fn fills_buffers_in_queue_order() -> Result<()> {
        let mut dev = capture();
        assert_eq!(dev.request_buffers(3)?, 3);
        let regions: Vec<_> = (0..3).map(|i| dev.map_buffer(i)).collect::<Result<_>>()?;
        dev.queue_buffer(2)?;
        dev.queue_buffer(0)?;
        dev.stream_on()?;

        let first = wait_frame(&mut dev);
        let second = wait_frame(&mut dev);
        assert_eq!(first.index, 2);
        assert_eq!(second.index, 0);
        assert!(second.captured_at > first.captured_at);
        assert_eq!(first.bytes_used, regions[2].len());
        let seq = regions[0].with_bytes(9, |b| u64::from_le_bytes(b[1..9].try_into().unwrap()));
        assert_eq!(seq, 2);
        Ok(())
    }

    #[test]
    fn frames_inside_settle_show_previous_input() -> Result<()> {
        let mut dev = SyntheticCapture::new("settle")
            .with_timing(Duration::from_millis(1), Duration::from_secs(60));
        dev.request_buffers(2)?;
        let region = dev.map_buffer(0)?;
        dev.select_input(0)?;
        dev.select_input(1)?;
        dev.queue_buffer(0)?;
        dev.stream_on()?;
        let buf = wait_frame(&mut dev);
        assert_eq!(buf.index, 0);
        assert_eq!(region.with_bytes(1, |b| b[0]), 0);
        Ok(())
    }

    #[test]
    fn settle_delay_is_reported_as_minimum_margin() -> Result<()> {
        let mut dev = capture();
        let sources = [Source {
            id: crate::scheduler::SourceId::new(0),
            input: 0,
            standard: None,
        }];
        let negotiated = dev.configure(&sources, VideoStandard::Ntsc, &PixelFormat::default())?;
        assert_eq!(negotiated.min_settle, Duration::from_millis(5));
        assert_eq!(negotiated.frame_size, PixelFormat::default().estimated_frame_size());
        Ok(())
    }

    #[test]
    fn switch_completes_at_the_next_clock_read() -> Result<()> {
        let mut dev = capture();
        dev.select_input(1)?;
        std::thread::sleep(Duration::from_millis(2));
        let completed = dev.now();
        assert_eq!(dev.switched_at, completed);
        // Later reads leave the switch time alone.
        std::thread::sleep(Duration::from_millis(1));
        assert!(dev.now() > completed);
        assert_eq!(dev.switched_at, completed);
        Ok(())
    }

    #[test]
    fn rejects_double_queue() -> Result<()> {
        let mut dev = capture();
        dev.request_buffers(2)?;
        dev.queue_buffer(1)?;
        assert!(dev.queue_buffer(1).is_err());
        assert!(dev.queue_buffer(7).is_err());
        Ok(())
    }

    #[test]
    fn nothing_ready_without_queued_buffers() -> Result<()> {
        let mut dev = capture();
        dev.request_buffers(2)?;
        dev.stream_on()?;
        assert!(!dev.wait_ready(Duration::from_millis(1))?);
        std::thread::sleep(Duration::from_millis(3));
        assert_eq!(dev.dequeue_buffer()?, None);
        Ok(())
    }
}
