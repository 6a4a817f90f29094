#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use v4l2_unmix::device::SyntheticRegion;
use v4l2_unmix::{
    CaptureDevice, DequeuedBuffer, OutputSink, Result, Source, SourceId, Timestamp, VideoStandard,
};

pub const FRAME_SIZE: usize = 16;

/// One frame the scripted hardware will deliver.
#[derive(Clone, Copy, Debug)]
pub struct ScriptedFrame {
    pub captured_at: u64,
    pub bytes_used: usize,
    /// Fills the whole buffer.
    pub tag: u8,
}

impl ScriptedFrame {
    pub fn new(captured_at: u64, tag: u8) -> Self {
        Self {
            captured_at,
            bytes_used: FRAME_SIZE,
            tag,
        }
    }

    pub fn truncated(captured_at: u64, tag: u8) -> Self {
        Self {
            captured_at,
            bytes_used: FRAME_SIZE / 2,
            tag,
        }
    }
}

/// Capture device replaying a fixed script.
///
/// `now()` returns the scripted clock readings in order, then counts up from
/// the last one. Frames are delivered in buffer queue order. Once the script
/// is exhausted the device raises `shutdown` and reports nothing ready.
pub struct ScriptedDevice {
    clock: VecDeque<u64>,
    last_clock: u64,
    frames: VecDeque<ScriptedFrame>,
    regions: Vec<SyntheticRegion>,
    queued: VecDeque<u32>,
    streaming: bool,
    shutdown: Arc<AtomicBool>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedDevice {
    pub fn new(clock: &[u64], frames: &[ScriptedFrame], shutdown: &Arc<AtomicBool>) -> Self {
        Self {
            clock: clock.iter().copied().collect(),
            last_clock: 0,
            frames: frames.iter().copied().collect(),
            regions: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            shutdown: Arc::clone(shutdown),
            calls: Arc::default(),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CaptureDevice for ScriptedDevice {
    type Region = SyntheticRegion;

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.record(format!("request {count}"));
        self.regions = (0..count).map(|_| SyntheticRegion::new(FRAME_SIZE)).collect();
        Ok(count)
    }

    fn map_buffer(&mut self, index: u32) -> Result<SyntheticRegion> {
        Ok(self.regions[index as usize].clone())
    }

    fn free_buffers(&mut self) -> Result<()> {
        self.record("free".into());
        self.regions.clear();
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        assert!(!self.queued.contains(&index), "buffer {index} queued twice");
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<Option<DequeuedBuffer>> {
        assert!(self.streaming, "dequeue while not streaming");
        if self.queued.is_empty() {
            return Ok(None);
        }
        let Some(frame) = self.frames.pop_front() else {
            self.shutdown.store(true, Ordering::Relaxed);
            return Ok(None);
        };
        let index = self.queued.pop_front().unwrap();
        self.regions[index as usize].fill(|bytes| bytes.fill(frame.tag));
        Ok(Some(DequeuedBuffer {
            index,
            bytes_used: frame.bytes_used,
            captured_at: Timestamp::from_micros(frame.captured_at),
        }))
    }

    fn wait_ready(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(!self.frames.is_empty() && !self.queued.is_empty())
    }

    fn select_input(&mut self, input: u32) -> Result<()> {
        self.record(format!("input {input}"));
        Ok(())
    }

    fn set_standard(&mut self, standard: VideoStandard) -> Result<()> {
        self.record(format!("standard {standard:?}"));
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        self.record("stream on".into());
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.record("stream off".into());
        self.streaming = false;
        self.queued.clear();
        Ok(())
    }

    fn now(&mut self) -> Timestamp {
        let now = self.clock.pop_front().unwrap_or(self.last_clock + 1);
        self.last_clock = now;
        Timestamp::from_micros(now)
    }
}

pub type WriteLog = Arc<Mutex<Vec<(usize, u8)>>>;

/// Sink recording `(sink, first byte)` of every frame in write order.
pub struct RecordingSink {
    id: usize,
    name: String,
    log: WriteLog,
    /// Accept one byte less than offered.
    pub short: bool,
}

impl RecordingSink {
    pub fn new(id: usize, log: &WriteLog) -> Self {
        Self {
            id,
            name: format!("recording{id}"),
            log: Arc::clone(log),
            short: false,
        }
    }
}

impl OutputSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.log.lock().unwrap().push((self.id, frame[0]));
        if self.short {
            return Ok(frame.len() - 1);
        }
        Ok(frame.len())
    }
}

pub fn sources(count: usize) -> Vec<Source> {
    (0..count)
        .map(|i| Source {
            id: SourceId::new(i),
            input: i as u32,
            standard: None,
        })
        .collect()
}
