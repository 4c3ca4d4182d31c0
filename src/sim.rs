//! In-process stand-ins for the DMA controller, power services and dump sinks.
//!
//! [`SimDma`] keeps an event log of every backend call and "plays" the ring by copying one period
//! out per completion. Completions happen on [`SimDma::advance`], or on a ticker thread when the
//! backend was built with [`SimDma::clocked`].

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use dasp_signal::Signal;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dma::{
    BusPosition, ChannelRequest, CyclicTransfer, DmaBackend, DmaChannel, DmaError, SlaveConfig,
};
use crate::dump::{DumpTarget, DumpWriter, mix_dump_name, stream_dump_name};
use crate::format::SampleFormat;
use crate::power::PowerServices;

/// Backend call recorded by [`SimDma`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DmaEvent {
    /// `request_channel` succeeded.
    Request(DmaChannel),
    /// `configure`.
    Configure(SlaveConfig),
    /// `prepare_cyclic`.
    Prepare {
        /// Bytes per period.
        period_bytes: usize,
        /// Periods in the loop.
        period_count: usize,
    },
    /// `trigger`.
    Trigger,
    /// `stop`.
    Stop,
    /// `flush`.
    Flush,
    /// `release`.
    Release(DmaChannel),
    /// A period finished transferring.
    Complete {
        /// Period index within the ring.
        index: usize,
    },
}

#[derive(Default)]
struct SimState {
    next_channel: u32,
    channel: Option<DmaChannel>,
    transfer: Option<CyclicTransfer>,
    running: bool,
    index: usize,
    events: Vec<DmaEvent>,
    played: Vec<u8>,
    fail_request: bool,
    fail_trigger: bool,
    ticker: Option<Sender<()>>,
}

/// Simulated DMA controller.
#[derive(Clone, Default)]
pub struct SimDma {
    state: Arc<Mutex<SimState>>,
    period: Option<Duration>,
}

impl SimDma {
    /// Backend whose periods complete only on [`advance`](Self::advance).
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that completes one period every `period` while triggered.
    pub fn clocked(period: Duration) -> Self {
        Self {
            state: Arc::default(),
            period: Some(period),
        }
    }

    /// Make the next channel requests fail.
    pub fn set_fail_request(&self, fail: bool) {
        self.state.lock().fail_request = fail;
    }

    /// Make the next triggers fail.
    pub fn set_fail_trigger(&self, fail: bool) {
        self.state.lock().fail_trigger = fail;
    }

    /// Whether a transfer is running.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Calls recorded so far.
    pub fn events(&self) -> Vec<DmaEvent> {
        self.state.lock().events.clone()
    }

    /// Number of successful triggers.
    pub fn trigger_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, DmaEvent::Trigger))
            .count()
    }

    /// Number of completed periods.
    pub fn completion_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, DmaEvent::Complete { .. }))
            .count()
    }

    /// Drain the bytes played so far.
    pub fn take_played(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().played)
    }

    /// Complete the current period: capture its bytes and fire the completion callback.
    ///
    /// Returns `false` when no transfer is running.
    pub fn advance(&self) -> bool {
        let callback = {
            let mut state = self.state.lock();
            if !state.running {
                return false;
            }
            let Some(transfer) = state.transfer.clone() else {
                return false;
            };
            let base = (transfer.buf_addr - transfer.area.bus_base()) as usize;
            let offset = base + state.index * transfer.period_bytes;
            let mut period = vec![0u8; transfer.period_bytes];
            transfer.area.read(offset, &mut period);
            state.played.extend_from_slice(&period);

            let index = state.index;
            state.events.push(DmaEvent::Complete { index });
            state.index = (index + 1) % transfer.period_count;
            trace!(index, "sim period complete");
            transfer.on_complete
        };
        callback();
        true
    }

    fn start_ticker(&self, state: &mut SimState) {
        let Some(period) = self.period else {
            return;
        };
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        state.ticker = Some(tx);
        let dma = self.clone();
        let spawned = thread::Builder::new()
            .name("sim-dma-clock".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            dma.advance();
                        }
                        _ => break,
                    }
                }
            });
        if let Err(err) = spawned {
            debug!(error = %err, "sim clock thread failed to start");
            state.ticker = None;
        }
    }
}

impl DmaBackend for SimDma {
    fn request_channel(&self, request: &ChannelRequest) -> Result<DmaChannel, DmaError> {
        let mut state = self.state.lock();
        if state.fail_request {
            return Err(DmaError::ChannelUnavailable(request.name.clone()));
        }
        let channel = DmaChannel(state.next_channel);
        state.next_channel += 1;
        state.channel = Some(channel);
        state.events.push(DmaEvent::Request(channel));
        Ok(channel)
    }

    fn configure(&self, _channel: DmaChannel, config: &SlaveConfig) -> Result<(), DmaError> {
        self.state.lock().events.push(DmaEvent::Configure(*config));
        Ok(())
    }

    fn prepare_cyclic(&self, _channel: DmaChannel, transfer: CyclicTransfer) -> Result<(), DmaError> {
        if transfer.period_bytes == 0 || transfer.period_count == 0 {
            return Err(DmaError::Rejected("empty cyclic transfer".into()));
        }
        let mut state = self.state.lock();
        state.events.push(DmaEvent::Prepare {
            period_bytes: transfer.period_bytes,
            period_count: transfer.period_count,
        });
        state.index = 0;
        state.transfer = Some(transfer);
        Ok(())
    }

    fn trigger(&self, _channel: DmaChannel) -> Result<(), DmaError> {
        let mut state = self.state.lock();
        if state.fail_trigger {
            return Err(DmaError::Rejected("trigger refused".into()));
        }
        if state.transfer.is_none() {
            return Err(DmaError::Rejected("no transfer prepared".into()));
        }
        state.running = true;
        state.events.push(DmaEvent::Trigger);
        self.start_ticker(&mut state);
        Ok(())
    }

    fn stop(&self, _channel: DmaChannel) {
        let mut state = self.state.lock();
        state.running = false;
        state.ticker = None;
        state.events.push(DmaEvent::Stop);
    }

    fn flush(&self, _channel: DmaChannel) {
        let mut state = self.state.lock();
        state.transfer = None;
        state.events.push(DmaEvent::Flush);
    }

    fn release(&self, channel: DmaChannel, _client: u32) {
        let mut state = self.state.lock();
        state.running = false;
        state.ticker = None;
        state.transfer = None;
        state.channel = None;
        state.events.push(DmaEvent::Release(channel));
    }

    fn position(&self, _channel: DmaChannel) -> BusPosition {
        let state = self.state.lock();
        match &state.transfer {
            Some(transfer) => BusPosition {
                src: transfer.buf_addr + (state.index * transfer.period_bytes) as u64,
                dst: 0,
            },
            None => BusPosition::default(),
        }
    }
}

#[derive(Debug, Default)]
struct PowerLedger {
    active: i32,
    inhibited: HashMap<u32, bool>,
    domain_on: bool,
    transitions: usize,
}

/// Power services that keep count of what was asked of them.
#[derive(Debug, Default)]
pub struct CountingPower {
    ledger: Mutex<PowerLedger>,
}

impl CountingPower {
    /// Fresh counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding active-count references.
    pub fn active_count(&self) -> i32 {
        self.ledger.lock().active
    }

    /// Whether the low-power clock is inhibited for `id`.
    pub fn clock_inhibited(&self, id: u32) -> bool {
        self.ledger.lock().inhibited.get(&id).copied().unwrap_or(false)
    }

    /// Whether the DMA power domain is on.
    pub fn domain_on(&self) -> bool {
        self.ledger.lock().domain_on
    }

    /// Domain on/off transitions observed.
    pub fn domain_transitions(&self) -> usize {
        self.ledger.lock().transitions
    }
}

impl PowerServices for CountingPower {
    fn inc_active_count(&self) {
        self.ledger.lock().active += 1;
    }

    fn dec_active_count(&self) {
        self.ledger.lock().active -= 1;
    }

    fn request_low_power_clock_inhibit(&self, id: u32, enable: bool) {
        self.ledger.lock().inhibited.insert(id, enable);
    }

    fn enable_dma_domain(&self, on: bool) {
        let mut ledger = self.ledger.lock();
        if ledger.domain_on != on {
            ledger.transitions += 1;
        }
        ledger.domain_on = on;
    }
}

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Dump target that keeps every file in memory, keyed by file name.
#[derive(Clone, Debug, Default)]
pub struct MemoryDump {
    files: Files,
}

impl MemoryDump {
    /// Empty target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents written to `name` so far.
    pub fn contents(&self, name: &str) -> Vec<u8> {
        self.files.lock().get(name).cloned().unwrap_or_default()
    }

    /// Names of every file opened, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn open(&self, name: String) -> DumpWriter {
        self.files.lock().entry(name.clone()).or_default();
        Box::new(MemoryWriter {
            name,
            files: self.files.clone(),
        })
    }
}

impl DumpTarget for MemoryDump {
    fn open_stream(&self, device: u32, index: u32, format: SampleFormat) -> io::Result<DumpWriter> {
        Ok(self.open(stream_dump_name(device, index, format)))
    }

    fn open_mix(&self, format: SampleFormat) -> io::Result<DumpWriter> {
        Ok(self.open(mix_dump_name(format).to_string()))
    }
}

struct MemoryWriter {
    name: String,
    files: Files,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `frames` stereo frames of a sine at `hz`, scaled to `amplitude` of full scale.
pub fn tone_bytes(format: SampleFormat, rate: u32, hz: f64, amplitude: f64, frames: usize) -> Vec<u8> {
    let limit = format.clip_limit() as f64;
    let samples: Vec<[i32; 2]> = dasp_signal::rate(rate as f64)
        .const_hz(hz)
        .sine()
        .take(frames)
        .map(|s| {
            let value = (s * amplitude * limit).round() as i32;
            [value, value]
        })
        .collect();
    format.encode_frames(&samples)
}

/// `frames` copies of the stereo frame `(left, right)`.
pub fn constant_bytes(format: SampleFormat, left: i32, right: i32, frames: usize) -> Vec<u8> {
    format.encode_frames(&vec![[left, right]; frames])
}
