//! Mapped frame buffer pool.
//!
//! The pool is the only owner of the mapped buffers and tracks each buffer's
//! lifecycle:
//!
//! ```text
//! Free ──queue──▶ Queued ──dequeue──▶ Filled ──finish──▶ Staged ──queue──▶ Queued
//! ```
//!
//! Buffers in `Queued` or `Filled` belong to the hardware side of the
//! protocol. A filled buffer is represented by a [`FilledBuffer`] token: its
//! bytes can only be read through the token, and handing the buffer back
//! consumes it, so a buffer cannot be re-queued while it is being read.
//!
//! ```compile_fail
//! # use v4l2_unmix::{BufferPool, CaptureDevice, FilledBuffer};
//! fn twice<D: CaptureDevice>(pool: &mut BufferPool<D>, filled: FilledBuffer) {
//!     let copy = filled.clone();
//!     pool.recycle(filled).unwrap();
//!     pool.recycle(copy).unwrap();
//! }
//! ```
//!
//! ```compile_fail
//! # use v4l2_unmix::{BufferPool, CaptureDevice, FilledBuffer};
//! fn read_after_recycle<D: CaptureDevice>(pool: &mut BufferPool<D>, filled: FilledBuffer) {
//!     pool.recycle(filled).unwrap();
//!     pool.read(&filled, |bytes| bytes.len());
//! }
//! ```

use std::fmt;

use crate::device::{CaptureDevice, MappedRegion};
use crate::error::{Result, UnmixError};
use crate::Timestamp;

/// Minimum buffer count for double-buffered capture.
pub const MIN_BUFFERS: u32 = 2;

/// Typed index into the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferIndex(u32);

impl BufferIndex {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Mapped, not submitted.
    Free,
    /// Submitted, waiting for a capture. Must not be read.
    Queued,
    /// Holds a captured frame that has not been copied out yet.
    Filled,
    /// Copied out; may be queued again.
    Staged,
}

impl BufferState {
    /// The driver may only get a buffer back once userspace is done with it.
    pub fn queueable(self) -> bool {
        matches!(self, BufferState::Free | BufferState::Staged)
    }
}

/// Ownership token for a buffer in the `Filled` state.
///
/// Deliberately neither `Clone` nor `Copy`.
#[derive(Debug)]
pub struct FilledBuffer {
    index: BufferIndex,
    bytes_used: usize,
    captured_at: Timestamp,
}

impl FilledBuffer {
    pub fn index(&self) -> BufferIndex {
        self.index
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn captured_at(&self) -> Timestamp {
        self.captured_at
    }
}

struct Slot<R> {
    region: R,
    state: BufferState,
}

pub struct BufferPool<D: CaptureDevice> {
    device: D,
    slots: Vec<Slot<D::Region>>,
    streaming: bool,
}

impl<D: CaptureDevice> BufferPool<D> {
    /// Request `count` buffers from the device and map them all.
    pub fn allocate(mut device: D, count: u32) -> Result<Self> {
        let granted = device.request_buffers(count)?;
        if granted < MIN_BUFFERS {
            // Give back whatever the driver reserved; the error that matters
            // is the buffer shortage.
            let _ = device.free_buffers();
            return Err(UnmixError::InsufficientBuffers {
                requested: count,
                granted,
            });
        }
        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let region = device.map_buffer(index)?;
            slots.push(Slot {
                region,
                state: BufferState::Free,
            });
        }
        log::debug!("mapped {} capture buffers (requested {})", granted, count);
        Ok(Self {
            device,
            slots,
            streaming: false,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: BufferIndex) -> BufferState {
        self.slots[index.0 as usize].state
    }

    pub fn states(&self) -> impl Iterator<Item = (BufferIndex, BufferState)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (BufferIndex(i as u32), slot.state))
    }

    /// Look up an index handed in from outside the pool.
    pub fn index(&self, raw: u32) -> Option<BufferIndex> {
        ((raw as usize) < self.slots.len()).then_some(BufferIndex(raw))
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Submit a `Free` or `Staged` buffer to the hardware.
    pub fn queue(&mut self, index: BufferIndex) -> Result<()> {
        let slot = &mut self.slots[index.0 as usize];
        if !slot.state.queueable() {
            return Err(UnmixError::InvalidBufferState {
                index: index.0,
                state: slot.state,
                op: "queue",
            });
        }
        self.device.queue_buffer(index.0)?;
        slot.state = BufferState::Queued;
        Ok(())
    }

    /// Queue every `Free` buffer.
    pub fn queue_all(&mut self) -> Result<()> {
        for raw in 0..self.slots.len() as u32 {
            if self.slots[raw as usize].state == BufferState::Free {
                self.queue(BufferIndex(raw))?;
            }
        }
        Ok(())
    }

    /// Take a completed buffer from the hardware, `Ok(None)` if none is ready.
    pub fn dequeue(&mut self) -> Result<Option<FilledBuffer>> {
        let Some(done) = self.device.dequeue_buffer()? else {
            return Ok(None);
        };
        let size = self.slots.len();
        let slot = self
            .slots
            .get_mut(done.index as usize)
            .ok_or(UnmixError::BufferOutOfRange {
                index: done.index,
                size,
            })?;
        if slot.state != BufferState::Queued {
            return Err(UnmixError::InvalidBufferState {
                index: done.index,
                state: slot.state,
                op: "dequeue",
            });
        }
        slot.state = BufferState::Filled;
        Ok(Some(FilledBuffer {
            index: BufferIndex(done.index),
            bytes_used: done.bytes_used.min(slot.region.len()),
            captured_at: done.captured_at,
        }))
    }

    /// Read the captured bytes of a filled buffer.
    pub fn read<R>(&self, filled: &FilledBuffer, f: impl FnOnce(&[u8]) -> R) -> R {
        self.slots[filled.index.0 as usize]
            .region
            .with_bytes(filled.bytes_used, f)
    }

    /// Mark a filled buffer as copied out.
    pub fn finish(&mut self, filled: FilledBuffer) -> BufferIndex {
        self.slots[filled.index.0 as usize].state = BufferState::Staged;
        filled.index
    }

    /// Mark a filled buffer as copied out and hand it back to the hardware.
    pub fn recycle(&mut self, filled: FilledBuffer) -> Result<()> {
        let index = self.finish(filled);
        self.queue(index)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn start_streaming(&mut self) -> Result<()> {
        if !self.streaming {
            self.device.stream_on()?;
            self.streaming = true;
        }
        Ok(())
    }

    /// Stop capturing. The driver returns all queued buffers, so every buffer
    /// the hardware held becomes `Free` again.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.streaming {
            self.device.stream_off()?;
            self.streaming = false;
            for slot in &mut self.slots {
                if slot.state == BufferState::Queued {
                    slot.state = BufferState::Free;
                }
            }
        }
        Ok(())
    }

    /// Stop streaming, unmap every buffer and free the buffer set.
    pub fn release(mut self) -> Result<D> {
        self.stop_streaming()?;
        self.slots.clear();
        self.device.free_buffers()?;
        Ok(self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DequeuedBuffer, SyntheticRegion, VideoStandard};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Device model: completes queued buffers in FIFO order on demand.
    struct ModelDevice {
        granted: u32,
        regions: Vec<SyntheticRegion>,
        queued: VecDeque<u32>,
        completed: VecDeque<u32>,
        clock: u64,
        reject_queue: bool,
        freed: bool,
    }

    impl ModelDevice {
        fn new(granted: u32) -> Self {
            Self {
                granted,
                regions: Vec::new(),
                queued: VecDeque::new(),
                completed: VecDeque::new(),
                clock: 0,
                reject_queue: false,
                freed: false,
            }
        }

        /// Let the hardware finish the oldest queued buffer.
        fn capture_one(&mut self) -> bool {
            match self.queued.pop_front() {
                Some(index) => {
                    self.regions[index as usize].fill(|b| b.fill(index as u8));
                    self.completed.push_back(index);
                    true
                }
                None => false,
            }
        }
    }

    impl CaptureDevice for ModelDevice {
        type Region = SyntheticRegion;

        fn request_buffers(&mut self, count: u32) -> Result<u32> {
            let granted = count.min(self.granted);
            self.regions = (0..granted).map(|_| SyntheticRegion::new(8)).collect();
            Ok(granted)
        }

        fn map_buffer(&mut self, index: u32) -> Result<SyntheticRegion> {
            Ok(self.regions[index as usize].clone())
        }

        fn free_buffers(&mut self) -> Result<()> {
            self.freed = true;
            Ok(())
        }

        fn queue_buffer(&mut self, index: u32) -> Result<()> {
            if self.reject_queue {
                return Err(UnmixError::device(
                    "VIDIOC_QBUF",
                    std::io::Error::from_raw_os_error(libc::EINVAL),
                ));
            }
            assert!(!self.queued.contains(&index), "double queue of {index}");
            self.queued.push_back(index);
            Ok(())
        }

        fn dequeue_buffer(&mut self) -> Result<Option<DequeuedBuffer>> {
            self.clock += 1;
            Ok(self.completed.pop_front().map(|index| DequeuedBuffer {
                index,
                bytes_used: 8,
                captured_at: Timestamp::from_micros(self.clock),
            }))
        }

        fn wait_ready(&mut self, _timeout: Duration) -> Result<bool> {
            Ok(!self.completed.is_empty())
        }

        fn select_input(&mut self, _input: u32) -> Result<()> {
            Ok(())
        }

        fn set_standard(&mut self, _standard: VideoStandard) -> Result<()> {
            Ok(())
        }

        fn stream_on(&mut self) -> Result<()> {
            Ok(())
        }

        fn stream_off(&mut self) -> Result<()> {
            self.queued.clear();
            self.completed.clear();
            Ok(())
        }

        fn now(&mut self) -> Timestamp {
            Timestamp::from_micros(self.clock)
        }
    }

    #[test]
    fn allocate_requires_two_buffers() {
        let err = BufferPool::allocate(ModelDevice::new(1), 4)
            .err()
            .expect("one buffer is not enough");
        assert!(matches!(
            err,
            UnmixError::InsufficientBuffers {
                requested: 4,
                granted: 1
            }
        ));
    }

    #[test]
    fn allocate_maps_granted_buffers() -> Result<()> {
        let pool = BufferPool::allocate(ModelDevice::new(3), 8)?;
        assert_eq!(pool.len(), 3);
        assert!(pool.states().all(|(_, s)| s == BufferState::Free));
        Ok(())
    }

    #[test]
    fn lifecycle_round_trip() -> Result<()> {
        let mut pool = BufferPool::allocate(ModelDevice::new(2), 2)?;
        pool.queue_all()?;
        pool.start_streaming()?;
        assert!(pool.dequeue()?.is_none());

        pool.device_mut().capture_one();
        let filled = pool.dequeue()?.expect("filled buffer");
        let index = filled.index();
        assert_eq!(pool.state(index), BufferState::Filled);
        assert_eq!(pool.read(&filled, |b| b.to_vec()), vec![index.get() as u8; 8]);

        let index = pool.finish(filled);
        assert_eq!(pool.state(index), BufferState::Staged);
        pool.queue(index)?;
        assert_eq!(pool.state(index), BufferState::Queued);
        Ok(())
    }

    #[test]
    fn only_free_and_staged_buffers_are_queueable() {
        assert!(BufferState::Free.queueable());
        assert!(BufferState::Staged.queueable());
        assert!(!BufferState::Queued.queueable());
        assert!(!BufferState::Filled.queueable());
    }

    #[test]
    fn queue_rejects_hardware_owned_buffers() -> Result<()> {
        let mut pool = BufferPool::allocate(ModelDevice::new(2), 2)?;
        let index = pool.index(0).expect("index 0");
        pool.queue(index)?;
        let err = pool.queue(index).unwrap_err();
        assert!(matches!(
            err,
            UnmixError::InvalidBufferState {
                state: BufferState::Queued,
                ..
            }
        ));

        pool.device_mut().capture_one();
        let filled = pool.dequeue()?.expect("filled");
        let err = pool.queue(filled.index()).unwrap_err();
        assert!(matches!(
            err,
            UnmixError::InvalidBufferState {
                state: BufferState::Filled,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn hardware_rejection_leaves_state_unchanged() -> Result<()> {
        let mut pool = BufferPool::allocate(ModelDevice::new(2), 2)?;
        pool.device_mut().reject_queue = true;
        let index = pool.index(1).expect("index 1");
        assert!(matches!(pool.queue(index), Err(UnmixError::Device { .. })));
        assert_eq!(pool.state(index), BufferState::Free);
        Ok(())
    }

    #[test]
    fn dequeue_validates_index() -> Result<()> {
        let mut pool = BufferPool::allocate(ModelDevice::new(2), 2)?;
        pool.device_mut().completed.push_back(5);
        assert!(matches!(
            pool.dequeue(),
            Err(UnmixError::BufferOutOfRange { index: 5, size: 2 })
        ));
        // Buffer 1 was never queued, the hardware cannot have filled it.
        pool.device_mut().completed.push_back(1);
        assert!(matches!(
            pool.dequeue(),
            Err(UnmixError::InvalidBufferState {
                index: 1,
                state: BufferState::Free,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn release_stops_streaming_and_frees() -> Result<()> {
        let mut pool = BufferPool::allocate(ModelDevice::new(2), 2)?;
        pool.queue_all()?;
        pool.start_streaming()?;
        let device = pool.release()?;
        assert!(device.freed);
        assert!(device.queued.is_empty());
        Ok(())
    }

    /// Random interleavings of pool operations checked against the device's
    /// view: every buffer is in exactly one state, the hardware holds exactly
    /// the `Queued`/`Filled` buffers, and illegal transitions fail without
    /// changing anything.
    #[test]
    fn random_interleavings_keep_ownership_exclusive() -> Result<()> {
        for seed in 0..64u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let count = rng.gen_range(2..=6);
            let mut pool = BufferPool::allocate(ModelDevice::new(count), count)?;
            pool.start_streaming()?;
            let mut held: Vec<FilledBuffer> = Vec::new();

            for _ in 0..400 {
                match rng.gen_range(0..5) {
                    0 => {
                        let raw = rng.gen_range(0..count);
                        let index = pool.index(raw).expect("in range");
                        let before = pool.state(index);
                        let res = pool.queue(index);
                        match before {
                            BufferState::Free | BufferState::Staged => {
                                res?;
                                assert_eq!(pool.state(index), BufferState::Queued);
                            }
                            other => {
                                assert!(res.is_err());
                                assert_eq!(pool.state(index), other);
                            }
                        }
                    }
                    1 => {
                        pool.device_mut().capture_one();
                    }
                    2 => {
                        if let Some(filled) = pool.dequeue()? {
                            assert_eq!(pool.state(filled.index()), BufferState::Filled);
                            held.push(filled);
                        }
                    }
                    3 => {
                        if !held.is_empty() {
                            let filled = held.swap_remove(rng.gen_range(0..held.len()));
                            let expected = filled.index().get() as u8;
                            assert!(pool.read(&filled, |b| b.iter().all(|&x| x == expected)));
                            pool.recycle(filled)?;
                        }
                    }
                    _ => {
                        if !held.is_empty() {
                            let filled = held.swap_remove(rng.gen_range(0..held.len()));
                            pool.finish(filled);
                        }
                    }
                }

                let device = pool.device();
                for (index, state) in pool.states() {
                    let raw = index.get();
                    let in_hw = device.queued.contains(&raw) || device.completed.contains(&raw);
                    let is_held = held.iter().any(|f| f.index() == index);
                    match state {
                        BufferState::Queued => assert!(in_hw && !is_held),
                        BufferState::Filled => assert!(is_held && !in_hw),
                        BufferState::Free | BufferState::Staged => assert!(!in_hw && !is_held),
                    }
                }
            }
        }
        Ok(())
    }
}
