//! Cyclic DMA ring shared between the mixer worker and the completion path.
//!
//! The ring memory is a single contiguous area, either heap backed or an anonymous shared mapping
//! so that an out-of-process DMA model can see it. It is sliced into [`DMA_PERIOD_COUNT`] periods;
//! each period carries a `filled` flag. Only the worker sets a flag, only the completion notifier
//! clears one, and both do so under [`RingState::lock`].
use std::cell::UnsafeCell;
use std::ptr;
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{DMA_PERIOD_COUNT, DMA_START_THRESHOLD, EngineError};

enum AreaStorage {
    Local(UnsafeCell<Box<[u8]>>),
    Shared(UnsafeCell<MmapMut>),
}

/// Memory region the DMA engine reads from, addressed by bus address.
pub struct DmaArea {
    storage: AreaStorage,
    data_ptr: *mut u8,
    len: usize,
    bus_base: u64,
}

// Slot ownership is handed back and forth through the `filled` flags, never by aliasing.
unsafe impl Send for DmaArea {}
unsafe impl Sync for DmaArea {}

impl DmaArea {
    /// Heap-backed area.
    pub fn new_local(len: usize, bus_base: u64) -> Result<Self, EngineError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| EngineError::ResourceExhausted(format!("dma ring of {len} bytes")))?;
        buf.resize(len, 0u8);
        let cell = UnsafeCell::new(buf.into_boxed_slice());
        let data_ptr = unsafe { (*cell.get()).as_mut_ptr() };
        Ok(Self {
            storage: AreaStorage::Local(cell),
            data_ptr,
            len,
            bus_base,
        })
    }

    /// Area backed by an anonymous shared mapping.
    pub fn new_shared(len: usize, bus_base: u64) -> std::io::Result<Self> {
        let mmap = MmapOptions::new().len(len).map_anon()?;
        let cell = UnsafeCell::new(mmap);
        let data_ptr = unsafe { (*cell.get()).as_mut_ptr() };
        Ok(Self {
            storage: AreaStorage::Shared(cell),
            data_ptr,
            len,
            bus_base,
        })
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the area is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the area lives in a shared mapping.
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, AreaStorage::Shared(_))
    }

    /// Bus address of byte 0.
    pub fn bus_base(&self) -> u64 {
        self.bus_base
    }

    /// Bus address of byte `offset`.
    pub fn bus_addr(&self, offset: usize) -> u64 {
        self.bus_base + offset as u64
    }

    /// Copy `out.len()` bytes starting at `offset`. Out-of-range reads are truncated.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        let len = out.len().min(self.len.saturating_sub(offset));
        if len > 0 {
            unsafe { ptr::copy_nonoverlapping(self.data_ptr.add(offset), out.as_mut_ptr(), len) };
        }
        len
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> usize {
        let len = data.len().min(self.len.saturating_sub(offset));
        if len > 0 {
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr.add(offset), len) };
        }
        len
    }

    pub(crate) fn zero(&self, len: usize) {
        let len = len.min(self.len);
        unsafe { ptr::write_bytes(self.data_ptr, 0, len) };
    }
}

/// Ring bookkeeping. Guarded by the low-latency lock shared with the completion notifier.
#[derive(Clone, Debug)]
pub struct RingFlags {
    pub(crate) filled: [bool; DMA_PERIOD_COUNT],
    pub(crate) write_index: usize,
    pub(crate) read_index: usize,
    pub(crate) running: bool,
    pub(crate) stopping: bool,
    pub(crate) prepared: bool,
    pub(crate) params_committed: bool,
    pub(crate) period_bytes: usize,
    pub(crate) dma_pos: u64,
    pub(crate) buf_done: bool,
    pub(crate) completions: u64,
    pub(crate) timeouts: u64,
    pub(crate) last_trigger_fill: Option<usize>,
    pub(crate) last_completion_ns: u64,
}

impl RingFlags {
    fn new(bus_base: u64) -> Self {
        Self {
            filled: [false; DMA_PERIOD_COUNT],
            write_index: 0,
            read_index: DMA_PERIOD_COUNT,
            running: false,
            stopping: false,
            prepared: false,
            params_committed: false,
            period_bytes: 0,
            dma_pos: bus_base,
            buf_done: false,
            completions: 0,
            timeouts: 0,
            last_trigger_fill: None,
            last_completion_ns: 0,
        }
    }

    /// Slots currently holding data the hardware has not consumed.
    pub fn filled_count(&self) -> usize {
        self.filled.iter().filter(|&&f| f).count()
    }

    /// Slot most recently written by the worker.
    pub fn threshold_slot(&self) -> usize {
        (self.write_index + DMA_PERIOD_COUNT - 1) % DMA_PERIOD_COUNT
    }

    /// Hardware may start: the last written slot is filled and the prebuffer is full.
    pub fn prebuffer_ready(&self) -> bool {
        self.filled[self.threshold_slot()] && self.filled_count() == DMA_START_THRESHOLD
    }

    /// The worker may overwrite `write_index` without clobbering unconsumed data.
    pub fn slot_writable(&self) -> bool {
        !self.filled[self.write_index] && self.filled_count() < DMA_START_THRESHOLD
    }

    /// The ring is primed or transferring.
    pub fn is_active(&self) -> bool {
        self.prepared || self.running
    }

    pub(crate) fn reset_for_prepare(&mut self, bus_base: u64) {
        self.filled = [false; DMA_PERIOD_COUNT];
        self.write_index = 0;
        self.read_index = DMA_PERIOD_COUNT;
        self.dma_pos = bus_base;
        self.buf_done = false;
    }

    /// Hardware is now transferring `hw_index`: clear every slot behind it back to the writer.
    pub(crate) fn consume_before(&mut self, hw_index: usize) {
        self.read_index = hw_index;
        let mut index = hw_index;
        for _ in 0..DMA_PERIOD_COUNT {
            index = (index + DMA_PERIOD_COUNT - 1) % DMA_PERIOD_COUNT;
            self.filled[index] = false;
            if index == self.write_index {
                break;
            }
        }
        self.buf_done = true;
    }

    pub(crate) fn commit_write(&mut self, index: usize) {
        self.filled[index] = true;
        self.write_index = (index + 1) % DMA_PERIOD_COUNT;
    }
}

/// Point-in-time copy of the ring bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingSnapshot {
    /// Per-slot filled flags.
    pub filled: [bool; DMA_PERIOD_COUNT],
    /// Next slot the worker writes.
    pub write_index: usize,
    /// Slot the hardware reported at the last completion.
    pub read_index: usize,
    /// Hardware transferring.
    pub running: bool,
    /// Ring primed and cyclic transfer enqueued.
    pub prepared: bool,
    /// Period size and channel fixed for the current configuration.
    pub params_committed: bool,
    /// Bytes per slot.
    pub period_bytes: usize,
    /// Bus address of the period the hardware is on.
    pub dma_pos: u64,
    /// Completion callbacks handled.
    pub completions: u64,
    /// Publish cycles skipped because no slot freed in time.
    pub timeouts: u64,
    /// Filled slots observed when hardware was last started.
    pub last_trigger_fill: Option<usize>,
    /// Monotonic timestamp of the last completion.
    pub last_completion_ns: u64,
}

impl RingSnapshot {
    /// Filled slot count.
    pub fn filled_count(&self) -> usize {
        self.filled.iter().filter(|&&f| f).count()
    }
}

/// The cyclic ring: memory plus its lock-protected flags and the completion condition.
pub struct RingState {
    area: std::sync::Arc<DmaArea>,
    flags: Mutex<RingFlags>,
    completion: Condvar,
}

impl RingState {
    /// Wrap an allocated area.
    pub fn new(area: std::sync::Arc<DmaArea>) -> Self {
        let bus_base = area.bus_base();
        Self {
            area,
            flags: Mutex::new(RingFlags::new(bus_base)),
            completion: Condvar::new(),
        }
    }

    /// Backing memory.
    pub fn area(&self) -> &std::sync::Arc<DmaArea> {
        &self.area
    }

    /// Take the low-latency lock. Never held across a backend call or a blocking wait.
    pub fn lock(&self) -> MutexGuard<'_, RingFlags> {
        self.flags.lock()
    }

    /// Copy of the bookkeeping.
    pub fn snapshot(&self) -> RingSnapshot {
        let f = self.flags.lock();
        RingSnapshot {
            filled: f.filled,
            write_index: f.write_index,
            read_index: f.read_index,
            running: f.running,
            prepared: f.prepared,
            params_committed: f.params_committed,
            period_bytes: f.period_bytes,
            dma_pos: f.dma_pos,
            completions: f.completions,
            timeouts: f.timeouts,
            last_trigger_fill: f.last_trigger_fill,
            last_completion_ns: f.last_completion_ns,
        }
    }

    /// Byte offset of slot `index` for the committed period size.
    pub fn slot_offset(&self, index: usize) -> usize {
        index * self.flags.lock().period_bytes
    }

    /// Wait until the write slot is free. Returns the slot index to write.
    ///
    /// The predicate is re-checked after every wake-up. Gives up immediately if the hardware is
    /// not running (nobody would free a slot) and after `timeout` otherwise.
    pub(crate) fn wait_slot(&self, timeout: Duration) -> Result<usize, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.flags.lock();
        loop {
            if guard.slot_writable() {
                return Ok(guard.write_index);
            }
            if !guard.running {
                return Err(EngineError::Timeout {
                    slot: guard.write_index,
                    waited_ms: 0,
                });
            }
            guard.buf_done = false;
            if self.completion.wait_until(&mut guard, deadline).timed_out() && !guard.slot_writable() {
                guard.timeouts += 1;
                return Err(EngineError::Timeout {
                    slot: guard.write_index,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Park until the next completion or `timeout`.
    pub(crate) fn wait_completion(&self, timeout: Duration) {
        let mut guard = self.flags.lock();
        guard.buf_done = false;
        let deadline = Instant::now() + timeout;
        while !guard.buf_done {
            if self.completion.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
    }

    pub(crate) fn notify_completion(&self) {
        self.completion.notify_all();
    }

    pub(crate) fn write_slot(&self, index: usize, bytes: &[u8]) -> usize {
        let offset = self.slot_offset(index);
        self.area.write(offset, bytes)
    }
}

/// Monotonic timestamp in nanoseconds.
pub fn monotonic_timestamp_ns() -> u64 {
    static START: Lazy<Instant> = Lazy::new(Instant::now);
    let elapsed = START.elapsed();
    (elapsed.as_secs() * 1_000_000_000) + elapsed.subsec_nanos() as u64
}
