//! Sample formats, mix period sizing and the hardware constraint table.

use dasp_frame::Stereo;

use crate::EngineError;

/// Interleaved channel count for every stream and the mix buffer.
pub const MIX_CHANNELS: usize = 2;

/// Default 16-bit mix period in frames.
pub const NMIXBUF_FRAMES: usize = 120;
/// 16-bit mix period at 44.1 kHz when the negotiated period is short.
pub const NMIXBUF_441_SHORT_FRAMES: usize = 110;
/// 16-bit mix period at 44.1 kHz when the negotiated period is long.
pub const NMIXBUF_441_LONG_FRAMES: usize = 441;
/// UHQA mix period in frames.
pub const UMIXBUF_FRAMES: usize = 480;

/// Smallest period the hardware accepts.
pub const PERIOD_BYTES_MIN: usize = 128;
/// Largest period the hardware accepts.
pub const PERIOD_BYTES_MAX: usize = 64 * 1024;
/// Largest per-stream buffer.
pub const BUFFER_BYTES_MAX: usize = 128 * 1024;
/// Minimum periods per stream buffer.
pub const PERIODS_MIN: usize = 2;
/// Maximum periods per stream buffer.
pub const PERIODS_MAX: usize = 128;

const RATE_44K1: u32 = 44_100;

/// Sample layout of a stream and of the shared mix buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 16-bit little endian, two channels.
    #[default]
    Normal16,
    /// Signed 24-bit value in a 32-bit little endian container, two channels.
    Uhqa24in32,
}

impl SampleFormat {
    /// Bytes per single-channel sample.
    pub const fn sample_bytes(self) -> usize {
        match self {
            SampleFormat::Normal16 => 2,
            SampleFormat::Uhqa24in32 => 4,
        }
    }

    /// Bytes per interleaved stereo frame.
    pub const fn frame_bytes(self) -> usize {
        self.sample_bytes() * MIX_CHANNELS
    }

    /// Largest magnitude a mixed sample may reach.
    pub const fn clip_limit(self) -> i64 {
        match self {
            SampleFormat::Normal16 => 0x7fff,
            SampleFormat::Uhqa24in32 => 0x7f_ffff,
        }
    }

    /// Symmetric saturation to `[-clip_limit, clip_limit]`.
    pub fn saturate(self, value: i64) -> i32 {
        let limit = self.clip_limit();
        value.clamp(-limit, limit) as i32
    }

    /// Whether this is the high-resolution format.
    pub const fn is_uhqa(self) -> bool {
        matches!(self, SampleFormat::Uhqa24in32)
    }

    /// Single-letter tag used in dump file names.
    pub const fn tag(self) -> char {
        match self {
            SampleFormat::Normal16 => 'N',
            SampleFormat::Uhqa24in32 => 'U',
        }
    }

    /// Frames mixed per hardware period for a stream negotiated at `rate` / `period_bytes`.
    pub fn mix_frames(self, rate: u32, period_bytes: usize) -> usize {
        match self {
            SampleFormat::Uhqa24in32 => UMIXBUF_FRAMES,
            SampleFormat::Normal16 if rate == RATE_44K1 => {
                if period_bytes > NMIXBUF_441_SHORT_FRAMES * self.frame_bytes() {
                    NMIXBUF_441_LONG_FRAMES
                } else {
                    NMIXBUF_441_SHORT_FRAMES
                }
            }
            SampleFormat::Normal16 => NMIXBUF_FRAMES,
        }
    }

    /// Bytes per hardware period (one ring slot).
    pub fn mix_period_bytes(self, rate: u32, period_bytes: usize) -> usize {
        self.mix_frames(rate, period_bytes) * self.frame_bytes()
    }

    /// Capacity the mix buffer of this format must be allocated with.
    pub const fn max_mix_frames(self) -> usize {
        match self {
            SampleFormat::Normal16 => NMIXBUF_441_LONG_FRAMES,
            SampleFormat::Uhqa24in32 => UMIXBUF_FRAMES,
        }
    }

    /// Decode one stereo frame. `bytes` must hold at least `frame_bytes()`.
    pub(crate) fn read_frame(self, bytes: &[u8]) -> Stereo<i64> {
        match self {
            SampleFormat::Normal16 => [
                i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
                i16::from_le_bytes([bytes[2], bytes[3]]) as i64,
            ],
            SampleFormat::Uhqa24in32 => [
                sign_extend_24(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                sign_extend_24(i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])),
            ],
        }
    }

    /// Encode interleaved frames into little endian bytes.
    pub fn encode_frames(self, frames: &[Stereo<i32>]) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames.len() * self.frame_bytes());
        for frame in frames {
            for &sample in frame.iter() {
                match self {
                    SampleFormat::Normal16 => out.extend_from_slice(&(sample as i16).to_le_bytes()),
                    SampleFormat::Uhqa24in32 => out.extend_from_slice(&sample.to_le_bytes()),
                }
            }
        }
        out
    }

    /// Decode little endian bytes into frames; a trailing partial frame is ignored.
    pub fn decode_frames(self, bytes: &[u8]) -> Vec<Stereo<i32>> {
        bytes
            .chunks_exact(self.frame_bytes())
            .map(|chunk| {
                let [l, r] = self.read_frame(chunk);
                [l as i32, r as i32]
            })
            .collect()
    }
}

fn sign_extend_24(raw: i32) -> i64 {
    ((raw << 8) >> 8) as i64
}

/// Parameters negotiated by the audio framework for one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwParams {
    /// Sample layout.
    pub format: SampleFormat,
    /// Sample rate in Hertz.
    pub rate: u32,
    /// Bytes between two period-elapsed notifications.
    pub period_bytes: usize,
    /// Total bytes of the stream's own buffer.
    pub buffer_bytes: usize,
}

impl HwParams {
    /// Parameters with a buffer of `periods` periods.
    pub fn new(format: SampleFormat, rate: u32, period_bytes: usize, periods: usize) -> Self {
        Self {
            format,
            rate,
            period_bytes,
            buffer_bytes: period_bytes * periods,
        }
    }

    /// Check against the hardware constraint table.
    pub fn validate(&self) -> Result<(), EngineError> {
        let frame = self.format.frame_bytes();
        if self.rate == 0 {
            return Err(EngineError::ConfigMismatch("sample rate must be non-zero".into()));
        }
        if !(PERIOD_BYTES_MIN..=PERIOD_BYTES_MAX).contains(&self.period_bytes) {
            return Err(EngineError::ConfigMismatch(format!(
                "period of {} bytes outside [{PERIOD_BYTES_MIN}, {PERIOD_BYTES_MAX}]",
                self.period_bytes
            )));
        }
        if self.period_bytes % frame != 0 {
            return Err(EngineError::ConfigMismatch(format!(
                "period of {} bytes is not a whole number of {frame}-byte frames",
                self.period_bytes
            )));
        }
        if self.buffer_bytes > BUFFER_BYTES_MAX || self.buffer_bytes % self.period_bytes != 0 {
            return Err(EngineError::ConfigMismatch(format!(
                "buffer of {} bytes is not a whole number of periods within {BUFFER_BYTES_MAX}",
                self.buffer_bytes
            )));
        }
        let periods = self.buffer_bytes / self.period_bytes;
        if !(PERIODS_MIN..=PERIODS_MAX).contains(&periods) {
            return Err(EngineError::ConfigMismatch(format!(
                "{periods} periods outside [{PERIODS_MIN}, {PERIODS_MAX}]"
            )));
        }
        Ok(())
    }
}
