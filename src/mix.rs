//! The shared mix buffer: one hardware period summed from every running stream.
//!
//! Two format-specific buffers are allocated up front; exactly one is active, chosen by the most
//! recent hardware-parameter negotiation. Streams are accumulated as `i64` stereo frames and
//! saturated into the active buffer once all contributions are in.

use std::sync::Arc;

use dasp_frame::{Frame, Stereo};
use parking_lot::{Mutex, MutexGuard};

use crate::EngineError;
use crate::format::{MIX_CHANNELS, SampleFormat};
use crate::stream::{PeriodListener, Stream, StreamHandle};

/// Pending `period_elapsed` calls collected during a mix.
pub(crate) type ElapsedList = Vec<(StreamHandle, Arc<dyn PeriodListener>)>;

/// Mix buffer contents and the format currently selected for it.
pub struct MixBuffer {
    format: SampleFormat,
    rate: u32,
    frames: usize,
    normal: Vec<i16>,
    uhqa: Vec<i32>,
    acc: Vec<Stereo<i64>>,
    filled: bool,
    elapsed: ElapsedList,
}

impl MixBuffer {
    fn allocate() -> Result<Self, EngineError> {
        let normal_len = SampleFormat::Normal16.max_mix_frames() * MIX_CHANNELS;
        let uhqa_len = SampleFormat::Uhqa24in32.max_mix_frames() * MIX_CHANNELS;
        let acc_len = SampleFormat::Normal16
            .max_mix_frames()
            .max(SampleFormat::Uhqa24in32.max_mix_frames());

        Ok(Self {
            format: SampleFormat::Normal16,
            rate: 0,
            frames: crate::format::NMIXBUF_FRAMES,
            normal: zeroed(normal_len, "normal mix buffer")?,
            uhqa: zeroed(uhqa_len, "uhqa mix buffer")?,
            acc: zeroed(acc_len, "mix accumulator")?,
            filled: false,
            elapsed: Vec::with_capacity(8),
        })
    }

    /// Format of the active buffer.
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Rate of the stream that selected the current format.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Frames per mix period.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Bytes per mix period, i.e. one ring slot.
    pub fn period_bytes(&self) -> usize {
        self.frames * self.format.frame_bytes()
    }

    /// Whether a mixed period is waiting to be published.
    pub fn is_filled(&self) -> bool {
        self.filled
    }

    /// Drop any unpublished period.
    pub fn mark_consumed(&mut self) {
        self.filled = false;
    }

    /// Select the active buffer from the most recently negotiated stream.
    pub(crate) fn configure(&mut self, format: SampleFormat, rate: u32, stream_period_bytes: usize) {
        self.format = format;
        self.rate = rate;
        self.frames = format.mix_frames(rate, stream_period_bytes);
    }

    /// Sum one period from every running stream, then saturate into the active buffer.
    pub(crate) fn mix_streams(&mut self, streams: &[Arc<Stream>], dump_enabled: bool) {
        let frames = self.frames;
        let acc = &mut self.acc[..frames];
        acc.fill(<Stereo<i64> as Frame>::EQUILIBRIUM);

        for stream in streams.iter().filter(|s| s.is_running()) {
            let periods = stream.state().mix_into(acc, stream.is_running(), dump_enabled);
            for _ in 0..periods {
                self.elapsed.push((stream.handle(), stream.listener().clone()));
            }
        }

        let format = self.format;
        match format {
            SampleFormat::Normal16 => {
                for (out, frame) in self.normal.chunks_exact_mut(MIX_CHANNELS).zip(acc.iter()) {
                    let clipped: Stereo<i32> = frame.map(|s| format.saturate(s));
                    out[0] = clipped[0] as i16;
                    out[1] = clipped[1] as i16;
                }
            }
            SampleFormat::Uhqa24in32 => {
                for (out, frame) in self.uhqa.chunks_exact_mut(MIX_CHANNELS).zip(acc.iter()) {
                    let clipped: Stereo<i32> = frame.map(|s| format.saturate(s));
                    out[0] = clipped[0];
                    out[1] = clipped[1];
                }
            }
        }
        self.filled = true;
    }

    /// Serialise the active period as little endian bytes into `out`.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.clear();
        let samples = self.frames * MIX_CHANNELS;
        match self.format {
            SampleFormat::Normal16 => {
                for sample in &self.normal[..samples] {
                    out.extend_from_slice(&sample.to_le_bytes());
                }
            }
            SampleFormat::Uhqa24in32 => {
                for sample in &self.uhqa[..samples] {
                    out.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }
    }

    /// Mixed frames of the active period, widened to `i32`.
    pub fn frames_snapshot(&self) -> Vec<Stereo<i32>> {
        let samples = self.frames * MIX_CHANNELS;
        match self.format {
            SampleFormat::Normal16 => self.normal[..samples]
                .chunks_exact(MIX_CHANNELS)
                .map(|c| [c[0] as i32, c[1] as i32])
                .collect(),
            SampleFormat::Uhqa24in32 => self.uhqa[..samples]
                .chunks_exact(MIX_CHANNELS)
                .map(|c| [c[0], c[1]])
                .collect(),
        }
    }

    pub(crate) fn take_elapsed(&mut self) -> ElapsedList {
        std::mem::take(&mut self.elapsed)
    }

    pub(crate) fn restore_elapsed(&mut self, mut list: ElapsedList) {
        list.clear();
        if self.elapsed.is_empty() {
            self.elapsed = list;
        }
    }
}

fn zeroed<T: Clone + Default>(len: usize, what: &str) -> Result<Vec<T>, EngineError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| EngineError::ResourceExhausted(what.to_string()))?;
    buf.resize(len, T::default());
    Ok(buf)
}

/// Lock-protected mix buffer shared by the worker and the control path.
pub struct MixState {
    inner: Mutex<MixBuffer>,
    scratch: Mutex<Vec<u8>>,
}

impl MixState {
    /// Allocate both format buffers.
    pub fn new() -> Result<Self, EngineError> {
        let scratch_len = SampleFormat::Uhqa24in32.max_mix_frames() * SampleFormat::Uhqa24in32.frame_bytes();
        Ok(Self {
            inner: Mutex::new(MixBuffer::allocate()?),
            scratch: Mutex::new(zeroed::<u8>(scratch_len, "publish scratch")?),
        })
    }

    /// Lock the buffer.
    pub fn lock(&self) -> MutexGuard<'_, MixBuffer> {
        self.inner.lock()
    }

    pub(crate) fn scratch(&self) -> MutexGuard<'_, Vec<u8>> {
        self.scratch.lock()
    }
}
