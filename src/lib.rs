#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! Real-time multi-stream PCM mixer feeding one shared cyclic DMA ring.
//!
//! Every open playback stream owns an interleaved stereo buffer that the audio framework fills.
//! A dedicated real-time worker sums one hardware period from all running streams into a shared
//! mix buffer, saturating to 16-bit or 24-bit range, and copies the result into the next free slot
//! of a four-period DMA ring. Hardware is only started once three periods are queued. The DMA
//! backend's completion callback marks slots consumed and wakes the worker.
//!
//! The hardware side is abstracted behind [`DmaBackend`](dma::DmaBackend) and
//! [`PowerServices`](power::PowerServices); [`sim`] provides in-process implementations of both.

use std::collections::VecDeque;
use std::sync::Once;

use parking_lot::Mutex;

/// Developer-facing control and TUI support.
pub mod control;
pub mod config;
pub mod dma;
pub mod dump;
pub mod engine;
pub mod format;
pub mod mix;
pub mod notifier;
pub mod power;
pub mod registry;
pub mod ring;
pub mod sim;
pub mod stream;
pub mod trigger;

mod rt;
mod worker;

#[cfg(test)]
mod tests;

pub use config::EngineConfig;
pub use dma::{DmaBackend, DmaChannel, DmaError};
pub use engine::{Engine, EngineStatus, StreamStatus};
pub use format::{HwParams, SampleFormat};
pub use power::PowerServices;
pub use stream::{PeriodListener, StreamHandle};
pub use trigger::{HwState, TriggerCommand};
pub use worker::{CycleReport, PublishOutcome};

/// Number of periods the cyclic DMA ring is sliced into.
pub const DMA_PERIOD_COUNT: usize = 4;

/// Filled periods required before the hardware consumer may be started.
pub const DMA_START_THRESHOLD: usize = DMA_PERIOD_COUNT - 1;

const EVENT_LOG_CAPACITY: usize = 256;

static TRACING_INIT: Once = Once::new();

/// Install the default `tracing` fmt subscriber once per process.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Error enumeration surfaced across the public API.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Requested parameters conflict with the committed hardware configuration.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),
    /// Allocation of a stream, mix buffer or ring failed.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    /// The DMA backend refused a channel request or transfer operation.
    #[error("hardware rejected request: {0}")]
    HardwareRejected(#[from] DmaError),
    /// No ring slot became free within the publish budget.
    #[error("ring slot {slot} still busy after {waited_ms} ms")]
    Timeout {
        /// Slot the worker wanted to write.
        slot: usize,
        /// Time spent waiting before giving up.
        waited_ms: u64,
    },
    /// The caller referenced a stream the registry does not hold.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Bounded in-memory log of engine transitions, surfaced through the console.
pub(crate) struct EventLog {
    lines: Mutex<VecDeque<String>>,
}

impl EventLog {
    pub(crate) fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    pub(crate) fn push(&self, line: impl Into<String>) {
        let mut guard = self.lines.lock();
        guard.push_back(line.into());
        while guard.len() > EVENT_LOG_CAPACITY {
            guard.pop_front();
        }
    }

    pub(crate) fn recent(&self, count: usize) -> Vec<String> {
        let guard = self.lines.lock();
        let skip = guard.len().saturating_sub(count);
        guard.iter().skip(skip).cloned().collect()
    }
}
