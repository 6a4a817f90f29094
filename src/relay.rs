//! Frame relay.
//!
//! A bounded staging queue between the capture thread and the output sinks.
//! The capture thread copies each attributed frame into a pre-allocated slot
//! and immediately hands the mapped buffer back to the hardware; a dedicated
//! consumer thread writes the slots to their sinks in FIFO order.
//!
//! - `capacity` slots of `slot_len` bytes, allocated once
//! - two counting semaphores: free slots (producer waits) and staged frames
//!   (consumer waits)
//! - global FIFO across all sinks, no reordering or coalescing
//! - a short or failed sink write stops the consumer; the producer sees
//!   [`UnmixError::RelayClosed`] on its next `stage`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{Result, UnmixError};
use crate::scheduler::SourceId;
use crate::sink::OutputSink;

/// Producer side of the relay, as seen by the scheduler.
pub trait Stage {
    /// Copy `data` into the relay. Returns once the copy is complete.
    fn stage(&mut self, source: SourceId, data: &[u8]) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Number of staging slots.
    pub capacity: usize,
    /// Bytes per slot, at least one frame.
    pub slot_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            slot_len: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Write every staged frame before stopping.
    Drain,
    /// Drop staged frames that have not been written yet.
    Discard,
}

/// Metadata of a frame sitting in a relay slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedFrame {
    pub source: SourceId,
    pub len: usize,
    /// Position in the global staging order.
    pub sequence: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Frames written, per sink.
    pub written: Vec<u64>,
    pub discarded: u64,
}

impl RelayStats {
    pub fn total_written(&self) -> u64 {
        self.written.iter().sum()
    }
}

// ----------------------------------------------------------------------------
// Counting semaphore
// ----------------------------------------------------------------------------

struct SemState {
    count: usize,
    closed: bool,
}

struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl Semaphore {
    fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                count,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one permit, blocking while none is available. Returns `false`
    /// once the semaphore is closed and empty.
    fn acquire(&self) -> bool {
        let mut state = self.lock();
        while state.count == 0 && !state.closed {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        self.lock().count += 1;
        self.cond.notify_one();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Relay
// ----------------------------------------------------------------------------

struct Slot {
    frame: Option<StagedFrame>,
    data: Box<[u8]>,
}

struct Shared {
    slots: Box<[Mutex<Slot>]>,
    free: Semaphore,
    ready: Semaphore,
    failed: AtomicBool,
    discard: AtomicBool,
}

impl Shared {
    fn new(capacity: usize, slot_len: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    frame: None,
                    data: vec![0u8; slot_len].into_boxed_slice(),
                })
            })
            .collect();
        Self {
            slots,
            free: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            failed: AtomicBool::new(false),
            discard: AtomicBool::new(false),
        }
    }

    fn slot(&self, position: usize) -> MutexGuard<'_, Slot> {
        self.slots[position]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct FrameRelay {
    shared: Arc<Shared>,
    head: usize,
    sequence: u64,
    sinks: usize,
    slot_len: usize,
    consumer: Option<JoinHandle<Result<RelayStats>>>,
}

impl FrameRelay {
    /// Allocate the slots and start the consumer writing to `sinks`; frames of
    /// source `k` go to `sinks[k]`.
    pub fn spawn<S>(config: RelayConfig, sinks: Vec<S>) -> Result<Self>
    where
        S: OutputSink + 'static,
    {
        if config.capacity == 0 {
            return Err(UnmixError::Config("relay capacity must be at least 1".into()));
        }
        if sinks.is_empty() {
            return Err(UnmixError::Config("relay needs at least one sink".into()));
        }
        let shared = Arc::new(Shared::new(config.capacity, config.slot_len));

        let sink_count = sinks.len();
        let consumer_shared = Arc::clone(&shared);
        let consumer = thread::Builder::new()
            .name("unmix-relay".into())
            .spawn(move || consume(&consumer_shared, sinks))
            .map_err(|err| UnmixError::device("spawn relay consumer", err))?;

        Ok(Self {
            shared,
            head: 0,
            sequence: 0,
            sinks: sink_count,
            slot_len: config.slot_len,
            consumer: Some(consumer),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// `true` once the consumer stopped because of a sink failure.
    pub fn is_closed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Stop accepting frames and wait for the consumer. Returns the
    /// consumer's fatal error if it had one.
    pub fn shutdown(mut self, mode: ShutdownMode) -> Result<RelayStats> {
        self.stop(mode)
    }

    fn stop(&mut self, mode: ShutdownMode) -> Result<RelayStats> {
        if mode == ShutdownMode::Discard {
            self.shared.discard.store(true, Ordering::Release);
        }
        self.shared.ready.close();
        match self.consumer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| UnmixError::Relay("consumer thread panicked".into()))?,
            None => Ok(RelayStats::default()),
        }
    }
}

impl Stage for FrameRelay {
    fn stage(&mut self, source: SourceId, data: &[u8]) -> Result<()> {
        if source.get() >= self.sinks {
            return Err(UnmixError::Relay(format!("no sink for source {source}")));
        }
        if data.len() > self.slot_len {
            return Err(UnmixError::Relay(format!(
                "frame of {} bytes exceeds slot size {}",
                data.len(),
                self.slot_len
            )));
        }
        if !self.shared.free.acquire() || self.shared.failed.load(Ordering::Acquire) {
            return Err(UnmixError::RelayClosed);
        }

        {
            let mut slot = self.shared.slot(self.head);
            slot.data[..data.len()].copy_from_slice(data);
            slot.frame = Some(StagedFrame {
                source,
                len: data.len(),
                sequence: self.sequence,
            });
        }
        self.head = (self.head + 1) % self.shared.slots.len();
        self.sequence += 1;
        self.shared.ready.release();
        Ok(())
    }
}

impl Drop for FrameRelay {
    fn drop(&mut self) {
        if self.consumer.is_some() {
            if let Err(err) = self.stop(ShutdownMode::Discard) {
                log::error!("relay consumer failed: {}", err);
            }
        }
    }
}

fn consume<S: OutputSink>(shared: &Shared, mut sinks: Vec<S>) -> Result<RelayStats> {
    let mut stats = RelayStats {
        written: vec![0; sinks.len()],
        discarded: 0,
    };
    let mut tail = 0;
    let mut next_sequence = 0;

    while shared.ready.acquire() {
        let result = {
            let mut slot = shared.slot(tail);
            match slot.frame.take() {
                Some(frame) if frame.sequence != next_sequence => Err(UnmixError::Relay(format!(
                    "slot {tail} holds frame {} but frame {next_sequence} is next",
                    frame.sequence
                ))),
                Some(_) if shared.discard.load(Ordering::Acquire) => {
                    stats.discarded += 1;
                    Ok(())
                }
                Some(frame) => {
                    let sink = &mut sinks[frame.source.get()];
                    let res = write_frame(sink, &slot.data[..frame.len]);
                    if res.is_ok() {
                        stats.written[frame.source.get()] += 1;
                    }
                    res
                }
                None => Err(UnmixError::Relay(format!("slot {tail} signalled but empty"))),
            }
        };

        if let Err(err) = result {
            shared.failed.store(true, Ordering::Release);
            shared.free.close();
            return Err(err);
        }
        tail = (tail + 1) % shared.slots.len();
        next_sequence += 1;
        shared.free.release();
    }
    Ok(stats)
}

fn write_frame<S: OutputSink>(sink: &mut S, data: &[u8]) -> Result<()> {
    let written = sink.write_frame(data).map_err(|source| UnmixError::Sink {
        sink: sink.name().to_string(),
        source,
    })?;
    if written != data.len() {
        return Err(UnmixError::ShortWrite {
            sink: sink.name().to_string(),
            expected: data.len(),
            written,
        });
    }
    Ok(())
}
