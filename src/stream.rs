//! Per-stream state: negotiated format, the stream's own buffer and its read cursor.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dasp_frame::{Frame, Stereo};
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::EngineError;
use crate::format::{HwParams, SampleFormat};

/// Handle referencing an open playback stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle {
    id: u32,
}

impl StreamHandle {
    pub(crate) fn new(id: u32) -> Self {
        Self { id }
    }

    /// Numeric identifier of the stream.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.id)
    }
}

/// Receiver of period-elapsed notifications, implemented by the audio framework.
pub trait PeriodListener: Send + Sync {
    /// One period of `stream`'s buffer has been consumed by the mixer.
    fn period_elapsed(&self, stream: StreamHandle);
}

impl<F> PeriodListener for F
where
    F: Fn(StreamHandle) + Send + Sync,
{
    fn period_elapsed(&self, stream: StreamHandle) {
        self(stream)
    }
}

/// Byte cursor into a stream's own buffer. `pos` stays in `[start, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamCursor {
    start: usize,
    pos: usize,
    end: usize,
}

impl StreamCursor {
    /// Cursor spanning `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            start: 0,
            pos: 0,
            end: len,
        }
    }

    /// Current read position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Offset of `pos` from `start`.
    pub fn offset(&self) -> usize {
        self.pos - self.start
    }

    /// Span of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the cursor spans nothing.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Move forward by `bytes`, wrapping to `start` exactly at `end`. Returns `true` on wrap.
    pub fn advance(&mut self, bytes: usize) -> bool {
        let next = self.pos + bytes;
        if next >= self.end {
            self.pos = self.start + (next - self.end);
            true
        } else {
            self.pos = next;
            false
        }
    }

    /// Rewind to `start`.
    pub fn reset(&mut self) {
        self.pos = self.start;
    }
}

pub(crate) struct StreamState {
    pub(crate) format: SampleFormat,
    pub(crate) rate: u32,
    pub(crate) period_bytes: usize,
    pub(crate) buffer: Vec<u8>,
    pub(crate) cursor: StreamCursor,
    pub(crate) dump: Option<Box<dyn Write + Send>>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            format: SampleFormat::Normal16,
            rate: 0,
            period_bytes: 0,
            buffer: Vec::new(),
            cursor: StreamCursor::default(),
            dump: None,
        }
    }

    pub(crate) fn is_negotiated(&self) -> bool {
        self.period_bytes != 0 && !self.buffer.is_empty()
    }

    /// Apply negotiated parameters, reallocating the buffer when its size changes.
    pub(crate) fn configure(&mut self, params: &HwParams) -> Result<(), EngineError> {
        if self.buffer.len() != params.buffer_bytes {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(params.buffer_bytes).map_err(|_| {
                EngineError::ResourceExhausted(format!(
                    "stream buffer of {} bytes",
                    params.buffer_bytes
                ))
            })?;
            buffer.resize(params.buffer_bytes, 0);
            self.buffer = buffer;
        }
        self.format = params.format;
        self.rate = params.rate;
        self.period_bytes = params.period_bytes;
        self.cursor = StreamCursor::new(params.buffer_bytes);
        Ok(())
    }

    /// Copy `data` into the buffer starting at `offset`, wrapping at the end.
    pub(crate) fn fill(&mut self, offset: usize, data: &[u8]) -> usize {
        let len = self.buffer.len();
        if len == 0 {
            return 0;
        }
        let data = &data[..data.len().min(len)];
        let start = offset % len;
        let first = (len - start).min(data.len());
        self.buffer[start..start + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buffer[..rest].copy_from_slice(&data[first..]);
        data.len()
    }

    /// Add `acc.len()` frames from the cursor into `acc`. Returns the period boundaries crossed.
    pub(crate) fn mix_into(
        &mut self,
        acc: &mut [Stereo<i64>],
        running: bool,
        dump_enabled: bool,
    ) -> usize {
        if !self.is_negotiated() {
            return 0;
        }
        let frame_bytes = self.format.frame_bytes();
        if self.cursor.len() < frame_bytes {
            return 0;
        }
        let mut elapsed = 0;
        for slot in acc.iter_mut() {
            let pos = self.cursor.pos();
            let bytes = &self.buffer[pos..pos + frame_bytes];
            *slot = (*slot).add_amp(self.format.read_frame(bytes));
            if dump_enabled {
                self.dump_bytes(pos, frame_bytes);
            }
            self.cursor.advance(frame_bytes);
            if running && self.cursor.offset() % self.period_bytes == 0 {
                elapsed += 1;
            }
        }
        elapsed
    }

    fn dump_bytes(&mut self, pos: usize, len: usize) {
        let Some(writer) = self.dump.as_mut() else {
            return;
        };
        if let Err(err) = writer.write_all(&self.buffer[pos..pos + len]) {
            warn!(error = %err, "stream dump write failed, closing dump");
            self.dump = None;
        }
    }

    /// Position reported to the framework, in frames.
    pub(crate) fn position_frames(&self) -> usize {
        let mut offset = self.cursor.offset();
        if offset >= self.buffer.len() {
            offset = 0;
        }
        offset / self.format.frame_bytes()
    }
}

/// An open playback stream. Owned by the engine's registry, shared with the worker.
pub struct Stream {
    handle: StreamHandle,
    device: u32,
    running: AtomicBool,
    state: Mutex<StreamState>,
    listener: Arc<dyn PeriodListener>,
}

impl Stream {
    pub(crate) fn new(handle: StreamHandle, device: u32, listener: Arc<dyn PeriodListener>) -> Self {
        Self {
            handle,
            device,
            running: AtomicBool::new(false),
            state: Mutex::new(StreamState::new()),
            listener,
        }
    }

    /// Handle of this stream.
    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    /// PCM device index the stream was opened on.
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Whether the stream is currently triggered.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::AcqRel)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock()
    }

    pub(crate) fn listener(&self) -> &Arc<dyn PeriodListener> {
        &self.listener
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("device", &self.device)
            .field("running", &self.is_running())
            .finish()
    }
}
