//! Raw PCM dump diagnostic.
//!
//! When a [`DumpTarget`] is installed, every stream gets an append-mode writer at negotiation and
//! each mix format gets one writer for published periods. Writes only happen while the runtime
//! toggle is on. A failing writer is dropped and logged; nothing else is affected.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::format::SampleFormat;

/// Boxed append-mode sink.
pub type DumpWriter = Box<dyn Write + Send>;

/// Opens dump sinks.
pub trait DumpTarget: Send + Sync {
    /// Sink for the bytes a stream contributes to the mix.
    fn open_stream(&self, device: u32, index: u32, format: SampleFormat) -> io::Result<DumpWriter>;
    /// Sink for published mix periods of `format`.
    fn open_mix(&self, format: SampleFormat) -> io::Result<DumpWriter>;
}

/// Name of the per-stream dump file.
pub fn stream_dump_name(device: u32, index: u32, format: SampleFormat) -> String {
    format!("P_{device}_{index}_{}.raw", format.tag())
}

/// Name of the mix dump file for `format`.
pub fn mix_dump_name(format: SampleFormat) -> &'static str {
    if format.is_uhqa() {
        "mix_buf_uhqa.raw"
    } else {
        "mix_buf_normal.raw"
    }
}

/// Writes dumps as files under a directory, created on first use.
#[derive(Clone, Debug)]
pub struct FileDumpTarget {
    dir: PathBuf,
}

impl FileDumpTarget {
    /// Target writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory the files land in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open(&self, name: &str) -> io::Result<DumpWriter> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "pcm dump opened");
        Ok(Box::new(BufWriter::new(file)))
    }
}

impl DumpTarget for FileDumpTarget {
    fn open_stream(&self, device: u32, index: u32, format: SampleFormat) -> io::Result<DumpWriter> {
        self.open(&stream_dump_name(device, index, format))
    }

    fn open_mix(&self, format: SampleFormat) -> io::Result<DumpWriter> {
        self.open(mix_dump_name(format))
    }
}

#[derive(Default)]
struct MixWriters {
    normal: Option<DumpWriter>,
    uhqa: Option<DumpWriter>,
}

impl MixWriters {
    fn slot(&mut self, format: SampleFormat) -> &mut Option<DumpWriter> {
        if format.is_uhqa() {
            &mut self.uhqa
        } else {
            &mut self.normal
        }
    }
}

/// Runtime dump state owned by the engine.
#[derive(Default)]
pub struct PcmDump {
    enabled: AtomicBool,
    target: Mutex<Option<Arc<dyn DumpTarget>>>,
    mix: Mutex<MixWriters>,
    count: AtomicU32,
}

impl PcmDump {
    /// Dump with no target, disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the runtime toggle.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "pcm dump toggled");
        }
        if !enabled {
            self.flush();
        }
    }

    /// Whether dump writes happen.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Install or remove the sink factory. Open mix writers are closed.
    pub fn set_target(&self, target: Option<Arc<dyn DumpTarget>>) {
        *self.mix.lock() = MixWriters::default();
        *self.target.lock() = target;
    }

    /// Writer for a stream negotiated on `device`, if a target is installed.
    pub fn open_stream(&self, device: u32, format: SampleFormat) -> Option<DumpWriter> {
        let target = self.target.lock().clone()?;
        let index = self.count.fetch_add(1, Ordering::Relaxed);
        match target.open_stream(device, index, format) {
            Ok(writer) => Some(writer),
            Err(err) => {
                warn!(device, index, error = %err, "failed to open stream dump");
                None
            }
        }
    }

    /// Append one published period.
    pub fn write_mixed(&self, format: SampleFormat, bytes: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        let Some(target) = self.target.lock().clone() else {
            return;
        };
        let mut mix = self.mix.lock();
        let slot = mix.slot(format);
        if slot.is_none() {
            match target.open_mix(format) {
                Ok(writer) => *slot = Some(writer),
                Err(err) => {
                    warn!(error = %err, "failed to open mix dump");
                    return;
                }
            }
        }
        if let Some(writer) = slot.as_mut() {
            if let Err(err) = writer.write_all(bytes) {
                warn!(error = %err, "mix dump write failed, closing dump");
                *slot = None;
            }
        }
    }

    /// Flush open mix writers.
    pub fn flush(&self) {
        let mut guard = self.mix.lock();
        let mix = &mut *guard;
        for writer in [mix.normal.as_mut(), mix.uhqa.as_mut()].into_iter().flatten() {
            if let Err(err) = writer.flush() {
                warn!(error = %err, "mix dump flush failed");
            }
        }
    }
}
