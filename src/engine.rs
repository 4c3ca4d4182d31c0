//! Device-level facade: the calls the audio framework makes into the mixer.
//!
//! Framework calls are serialised by a sleep-capable control lock. The worker thread and the
//! DMA completion path never take it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dma::{DmaBackend, DmaChannel};
use crate::dump::{DumpTarget, PcmDump};
use crate::format::{HwParams, SampleFormat};
use crate::mix::MixState;
use crate::power::PowerServices;
use crate::registry::StreamRegistry;
use crate::ring::{DmaArea, RingSnapshot, RingState};
use crate::stream::{PeriodListener, Stream, StreamHandle};
use crate::trigger::{HardwareTrigger, HwState, MAX_DEVICES, TriggerCommand};
use crate::worker::{CycleReport, MixerWorker, Pipeline, RunGate};
use crate::{EngineError, EventLog};

const STATUS_EVENT_LINES: usize = 32;

/// Point-in-time view of one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamStatus {
    /// Stream handle.
    pub handle: StreamHandle,
    /// Device index the stream was opened on.
    pub device: u32,
    /// Negotiated sample format.
    pub format: SampleFormat,
    /// Negotiated rate, 0 before negotiation.
    pub rate: u32,
    /// Negotiated period in bytes, 0 before negotiation.
    pub period_bytes: usize,
    /// Whether the stream is triggered.
    pub running: bool,
    /// Playback position in frames.
    pub position_frames: usize,
    /// Stream buffer length in frames.
    pub buffer_frames: usize,
}

/// Point-in-time view of the whole engine.
#[derive(Clone, Debug)]
pub struct EngineStatus {
    /// Hardware state machine position.
    pub state: HwState,
    /// The worker is allowed to mix.
    pub mixing_enabled: bool,
    /// Format of the active mix buffer.
    pub mix_format: SampleFormat,
    /// Frames per mix period.
    pub mix_frames: usize,
    /// Ring bookkeeping.
    pub ring: RingSnapshot,
    /// Allocated DMA channel.
    pub channel: Option<DmaChannel>,
    /// Devices holding the shared channel.
    pub params_bitmap: u64,
    /// PCM dump toggle.
    pub dump_enabled: bool,
    /// Pipeline fault waiting for the next prepare or start.
    pub fault: Option<String>,
    /// Per-stream status.
    pub streams: Vec<StreamStatus>,
    /// Most recent engine events.
    pub events: Vec<String>,
}

/// A registered mixer device.
pub struct Engine {
    pipeline: Arc<Pipeline>,
    control: Mutex<()>,
    worker: Mutex<Option<MixerWorker>>,
    unregistered: AtomicBool,
}

impl Engine {
    /// Allocate the ring and mix buffers and start the worker.
    pub fn register(
        config: EngineConfig,
        dma: Arc<dyn DmaBackend>,
        power: Arc<dyn PowerServices>,
    ) -> Result<Self, EngineError> {
        let area = if config.shared_ring {
            DmaArea::new_shared(config.ring_bytes, config.bus_base).map_err(|err| {
                EngineError::ResourceExhausted(format!("shared dma ring of {} bytes: {err}", config.ring_bytes))
            })?
        } else {
            DmaArea::new_local(config.ring_bytes, config.bus_base)?
        };
        let config = Arc::new(config);
        let ring = Arc::new(RingState::new(Arc::new(area)));
        let mix = Arc::new(MixState::new()?);
        let trigger = Arc::new(HardwareTrigger::new(config.clone(), ring.clone(), dma, power));
        let events = Arc::new(EventLog::new());

        let pipeline = Arc::new(Pipeline {
            config: config.clone(),
            registry: Arc::new(StreamRegistry::new()),
            mix,
            ring,
            trigger,
            dump: Arc::new(PcmDump::new()),
            events,
            gate: RunGate::default(),
            fault: Mutex::new(None),
        });

        let worker = if config.spawn_worker {
            Some(MixerWorker::spawn(pipeline.clone())?)
        } else {
            None
        };

        info!(
            ring_bytes = config.ring_bytes,
            bus_base = format_args!("{:#x}", config.bus_base),
            shared = config.shared_ring,
            worker = config.spawn_worker,
            "mixer engine registered"
        );
        pipeline
            .events
            .push(format!("registered, {} byte ring", config.ring_bytes));

        Ok(Self {
            pipeline,
            control: Mutex::new(()),
            worker: Mutex::new(worker),
            unregistered: AtomicBool::new(false),
        })
    }

    /// Configuration the engine was registered with.
    pub fn config(&self) -> &EngineConfig {
        &self.pipeline.config
    }

    /// Open a playback stream on `device`.
    pub fn stream_open(
        &self,
        device: u32,
        listener: Arc<dyn PeriodListener>,
    ) -> Result<StreamHandle, EngineError> {
        if device >= MAX_DEVICES {
            return Err(EngineError::ConfigMismatch(format!(
                "device {device} beyond the {MAX_DEVICES} device channel bitmap"
            )));
        }
        let _control = self.control.lock();
        let stream = self.pipeline.registry.register_stream(device, listener)?;
        self.pipeline
            .events
            .push(format!("{} opened on device {device}", stream.handle()));
        Ok(stream.handle())
    }

    /// Close a stream. Closing a handle twice is a [`EngineError::ProtocolError`].
    pub fn stream_close(&self, handle: StreamHandle) -> Result<(), EngineError> {
        let _control = self.control.lock();
        let stream = self.pipeline.registry.unregister_stream(handle)?;
        if stream.set_running(false) {
            self.stop_if_idle();
        }
        self.close_stream_dump(&stream);
        self.pipeline.events.push(format!("{handle} closed"));
        Ok(())
    }

    /// Fix format, rate and period for `handle` and commit the ring period size.
    ///
    /// The shared mix buffer takes the format of the most recently negotiated stream.
    pub fn negotiate_hw_params(&self, handle: StreamHandle, params: HwParams) -> Result<(), EngineError> {
        params.validate()?;
        let _control = self.control.lock();
        let stream = self.pipeline.registry.get(handle)?;
        let ring_period = params.format.mix_period_bytes(params.rate, params.period_bytes);

        self.pipeline.trigger.hw_params(ring_period)?;
        self.pipeline.trigger.mark_device(stream.device());

        {
            let mut mix = self.pipeline.mix.lock();
            if mix.rate() != 0 && mix.format() != params.format {
                warn!(
                    previous = ?mix.format(),
                    next = ?params.format,
                    "mix buffer format switched, last negotiated stream wins"
                );
            }
            mix.configure(params.format, params.rate, params.period_bytes);
        }

        let dump = self.pipeline.dump.open_stream(stream.device(), params.format);
        {
            let mut state = stream.state();
            state.configure(&params)?;
            state.dump = dump;
        }
        self.warn_mixed_formats(params.format);

        info!(
            %handle,
            format = ?params.format,
            rate = params.rate,
            period_bytes = params.period_bytes,
            periods = params.buffer_bytes / params.period_bytes,
            ring_period,
            "hw params negotiated"
        );
        self.pipeline.events.push(format!(
            "{handle} {:?} {} Hz, {} byte periods",
            params.format, params.rate, params.period_bytes
        ));
        Ok(())
    }

    /// Release the stream's hold on the DMA channel. Returns `true` if the channel was released.
    pub fn hw_free(&self, handle: StreamHandle) -> Result<bool, EngineError> {
        let _control = self.control.lock();
        let stream = self.pipeline.registry.get(handle)?;
        self.close_stream_dump(&stream);
        let released = self
            .pipeline
            .trigger
            .hw_free(stream.device(), self.pipeline.registry.any_running());
        if released {
            self.pipeline.events.push("dma channel released");
        }
        Ok(released)
    }

    /// Reset the stream cursor and prime the ring if it is not primed yet.
    pub fn prepare(&self, handle: StreamHandle) -> Result<(), EngineError> {
        let _control = self.control.lock();
        let stream = self.pipeline.registry.get(handle)?;
        {
            let mut state = stream.state();
            if !state.is_negotiated() {
                return Err(EngineError::ConfigMismatch(format!("{handle} has no negotiated params")));
            }
            state.cursor.reset();
        }
        self.pipeline.clear_fault();
        self.pipeline.trigger.prepare(&self.pipeline.mix)?;
        debug!(%handle, "stream prepared");
        Ok(())
    }

    /// Start or stop `handle`.
    pub fn trigger(&self, handle: StreamHandle, command: TriggerCommand) -> Result<(), EngineError> {
        let _control = self.control.lock();
        let stream = self.pipeline.registry.get(handle)?;
        match command {
            TriggerCommand::Start => {
                if !stream.state().is_negotiated() {
                    return Err(EngineError::ConfigMismatch(format!("{handle} has no negotiated params")));
                }
                self.pipeline.clear_fault();
                stream.set_running(true);
                self.pipeline.gate.enable();
                self.pipeline.ring.notify_completion();
                info!(%handle, "stream started");
                self.pipeline.events.push(format!("{handle} start"));
            }
            TriggerCommand::Stop => {
                if stream.set_running(false) {
                    self.stop_if_idle();
                }
                info!(%handle, "stream stopped");
                self.pipeline.events.push(format!("{handle} stop"));
            }
        }
        Ok(())
    }

    /// Frame offset of the stream's read cursor.
    pub fn query_position(&self, handle: StreamHandle) -> Result<usize, EngineError> {
        let stream = self.pipeline.registry.get(handle)?;
        let state = stream.state();
        Ok(state.position_frames())
    }

    /// Write `data` into the stream's own buffer at `offset`, wrapping at its end.
    pub fn fill_stream(&self, handle: StreamHandle, offset: usize, data: &[u8]) -> Result<usize, EngineError> {
        let stream = self.pipeline.registry.get(handle)?;
        let mut state = stream.state();
        if !state.is_negotiated() {
            return Err(EngineError::ConfigMismatch(format!("{handle} has no negotiated params")));
        }
        Ok(state.fill(offset, data))
    }

    /// Toggle the PCM dump.
    pub fn set_pcm_dump_enabled(&self, enabled: bool) {
        self.pipeline.dump.set_enabled(enabled);
        self.pipeline
            .events
            .push(format!("pcm dump {}", if enabled { "on" } else { "off" }));
    }

    /// Install the dump sink factory. Streams negotiated afterwards get a dump writer.
    pub fn set_dump_target(&self, target: Option<Arc<dyn DumpTarget>>) {
        self.pipeline.dump.set_target(target);
    }

    /// Whether the DMA hardware is transferring.
    pub fn is_dma_running(&self) -> bool {
        self.pipeline.trigger.is_running()
    }

    /// Hardware state machine position.
    pub fn hw_state(&self) -> HwState {
        self.pipeline.trigger.state(self.pipeline.gate.is_enabled())
    }

    /// Run one worker cycle on the calling thread.
    pub fn step(&self) -> CycleReport {
        self.pipeline.cycle()
    }

    /// Open stream handles.
    pub fn streams(&self) -> Vec<StreamHandle> {
        self.pipeline.registry.handles()
    }

    /// The last `count` engine events, oldest first.
    pub fn recent_events(&self, count: usize) -> Vec<String> {
        self.pipeline.events.recent(count)
    }

    /// Snapshot for tooling.
    pub fn status(&self) -> EngineStatus {
        let (mix_format, mix_frames) = {
            let mix = self.pipeline.mix.lock();
            (mix.format(), mix.frames())
        };
        let streams = self
            .pipeline
            .registry
            .snapshot()
            .iter()
            .map(|stream| stream_status(stream))
            .collect();

        EngineStatus {
            state: self.hw_state(),
            mixing_enabled: self.pipeline.gate.is_enabled(),
            mix_format,
            mix_frames,
            ring: self.pipeline.ring.snapshot(),
            channel: self.pipeline.trigger.channel(),
            params_bitmap: self.pipeline.trigger.params_bitmap(),
            dump_enabled: self.pipeline.dump.is_enabled(),
            fault: self.pipeline.fault.lock().clone(),
            streams,
            events: self.pipeline.events.recent(STATUS_EVENT_LINES),
        }
    }

    /// Read back the bytes of ring slot `index`.
    pub fn read_ring_slot(&self, index: usize) -> Vec<u8> {
        let period_bytes = self.pipeline.ring.lock().period_bytes;
        let mut out = vec![0u8; period_bytes];
        let offset = self.pipeline.ring.slot_offset(index % crate::DMA_PERIOD_COUNT);
        let len = self.pipeline.ring.area().read(offset, &mut out);
        out.truncate(len);
        out
    }

    /// Stop the worker, stop the hardware and give back the channel.
    pub fn unregister(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let _control = self.control.lock();
        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown(&self.pipeline);
        } else {
            self.pipeline.gate.request_stop();
        }
        self.pipeline.trigger.release();
        self.pipeline.dump.flush();
        info!("mixer engine unregistered");
    }

    fn stop_if_idle(&self) {
        if self.pipeline.registry.any_running() {
            return;
        }
        self.pipeline.gate.disable();
        self.pipeline.trigger.stop();
        self.pipeline.mix.lock().mark_consumed();
    }

    fn close_stream_dump(&self, stream: &Stream) {
        if let Some(mut writer) = stream.state().dump.take() {
            if let Err(err) = writer.flush() {
                warn!(handle = %stream.handle(), error = %err, "stream dump flush failed");
            }
        }
    }

    fn warn_mixed_formats(&self, format: SampleFormat) {
        let mismatched = self
            .pipeline
            .registry
            .snapshot()
            .iter()
            .filter(|s| {
                let state = s.state();
                state.is_negotiated() && state.format != format
            })
            .count();
        if mismatched > 0 {
            warn!(
                ?format,
                mismatched, "streams with a different format share the mix buffer"
            );
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stream_status(stream: &Stream) -> StreamStatus {
    let state = stream.state();
    let frame_bytes = state.format.frame_bytes();
    StreamStatus {
        handle: stream.handle(),
        device: stream.device(),
        format: state.format,
        rate: state.rate,
        period_bytes: state.period_bytes,
        running: stream.is_running(),
        position_frames: if state.is_negotiated() {
            state.position_frames()
        } else {
            0
        },
        buffer_frames: state.buffer.len() / frame_bytes,
    }
}
