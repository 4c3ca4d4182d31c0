//! The mixer worker: one real-time thread alternating a mix phase and a publish phase.
//!
//! The worker parks on the "mixing enabled" gate. Each cycle sums one period from the running
//! streams into the mix buffer (when it is empty and the ring is primed), then hands the period to
//! the next free ring slot, starting the hardware once the prebuffer threshold is reached. A cycle
//! that makes no progress parks on the completion condition for at most one publish timeout.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::dump::PcmDump;
use crate::mix::MixState;
use crate::registry::StreamRegistry;
use crate::ring::RingState;
use crate::trigger::HardwareTrigger;
use crate::{EngineError, EventLog, rt};

const WORKER_THREAD_NAME: &str = "eax-mixer";

/// What the publish phase of a cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing to publish, or no stream running.
    #[default]
    Idle,
    /// A mixed period was copied into a ring slot.
    Published,
    /// A period was ready but no slot freed in time; the cycle was skipped.
    Skipped,
}

/// Result of one worker cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The mix phase produced a period.
    pub mixed: bool,
    /// Outcome of the publish phase.
    pub publish: PublishOutcome,
}

impl CycleReport {
    /// Whether the cycle moved any data.
    pub fn progressed(&self) -> bool {
        self.mixed || self.publish == PublishOutcome::Published
    }
}

#[derive(Default)]
struct MixerControl {
    enabled: bool,
    should_stop: bool,
}

/// The global "mixing enabled" flag and the worker's shutdown request.
#[derive(Default)]
pub(crate) struct RunGate {
    state: Mutex<MixerControl>,
    cond: Condvar,
}

impl RunGate {
    pub(crate) fn enable(&self) {
        let mut state = self.state.lock();
        if !state.enabled {
            state.enabled = true;
            self.cond.notify_all();
        }
    }

    pub(crate) fn disable(&self) {
        self.state.lock().enabled = false;
    }

    pub(crate) fn request_stop(&self) {
        let mut state = self.state.lock();
        state.should_stop = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Park until mixing is enabled. Returns `false` once shutdown was requested.
    pub(crate) fn wait_enabled(&self) -> bool {
        let mut state = self.state.lock();
        while !state.enabled && !state.should_stop {
            self.cond.wait(&mut state);
        }
        !state.should_stop
    }
}

/// Everything a worker cycle touches, shared with the control path.
pub(crate) struct Pipeline {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) registry: Arc<StreamRegistry>,
    pub(crate) mix: Arc<MixState>,
    pub(crate) ring: Arc<RingState>,
    pub(crate) trigger: Arc<HardwareTrigger>,
    pub(crate) dump: Arc<PcmDump>,
    pub(crate) events: Arc<EventLog>,
    pub(crate) gate: RunGate,
    pub(crate) fault: Mutex<Option<String>>,
}

impl Pipeline {
    /// Run one mix phase followed by one publish phase.
    pub(crate) fn cycle(&self) -> CycleReport {
        let mixed = self.mix_phase();
        let publish = self.publish_phase();
        CycleReport { mixed, publish }
    }

    /// Sum one period into the mix buffer. Listener callbacks run after every lock is released.
    pub(crate) fn mix_phase(&self) -> bool {
        let dump_enabled = self.dump.is_enabled();
        let mut mix = self.mix.lock();
        if mix.is_filled() || !self.ring.lock().is_active() {
            return false;
        }
        let streams = self.registry.lock();
        if !streams.iter().any(|s| s.is_running()) {
            return false;
        }
        mix.mix_streams(&streams, dump_enabled);
        drop(streams);
        let elapsed = mix.take_elapsed();
        drop(mix);

        for (handle, listener) in &elapsed {
            listener.period_elapsed(*handle);
        }
        self.mix.lock().restore_elapsed(elapsed);
        true
    }

    /// Copy the mixed period into the next free slot, starting hardware at the threshold.
    pub(crate) fn publish_phase(&self) -> PublishOutcome {
        if !self.registry.any_running() || self.fault.lock().is_some() {
            return PublishOutcome::Idle;
        }

        let (active, start) = {
            let flags = self.ring.lock();
            (flags.is_active(), !flags.running && flags.prepared && flags.prebuffer_ready())
        };
        if !active {
            self.reprime();
            return PublishOutcome::Idle;
        }
        if start {
            match self.trigger.start() {
                Ok(true) => self.events.push("hardware started with 3 periods queued"),
                Ok(false) => return PublishOutcome::Idle,
                Err(err) => {
                    self.record_fault(format!("hardware start failed: {err}"));
                    return PublishOutcome::Skipped;
                }
            }
        }

        if !self.mix.lock().is_filled() {
            return PublishOutcome::Idle;
        }

        let slot = match self.ring.wait_slot(self.config.publish_timeout) {
            Ok(slot) => slot,
            Err(EngineError::Timeout { slot, waited_ms }) if waited_ms > 0 => {
                warn!(slot, waited_ms, "no ring slot freed in time, skipping cycle");
                self.events.push(format!("publish timeout on slot {slot}"));
                return PublishOutcome::Skipped;
            }
            Err(err) => {
                trace!(error = %err, "ring not draining, period held");
                return PublishOutcome::Skipped;
            }
        };

        let mut mix = self.mix.lock();
        if !mix.is_filled() {
            return PublishOutcome::Idle;
        }
        let format = mix.format();
        let mut scratch = self.mix.scratch();
        mix.encode_into(&mut scratch);

        let period_bytes = self.ring.lock().period_bytes;
        if scratch.len() != period_bytes {
            warn!(
                mixed = scratch.len(),
                period_bytes, "mix period does not match ring period, dropping it"
            );
            mix.mark_consumed();
            return PublishOutcome::Skipped;
        }

        self.ring.write_slot(slot, &scratch);
        mix.mark_consumed();
        drop(mix);
        self.dump.write_mixed(format, &scratch);
        drop(scratch);

        let mut flags = self.ring.lock();
        if !flags.prepared || flags.write_index != slot {
            debug!(slot, "ring re-primed during publish, period dropped");
            return PublishOutcome::Skipped;
        }
        flags.commit_write(slot);
        trace!(slot, filled = flags.filled_count(), "period published");
        PublishOutcome::Published
    }

    /// Streams are running but the ring was torn down behind them: prime it again.
    fn reprime(&self) {
        let period_bytes = self.mix.lock().period_bytes();
        let result = self
            .trigger
            .hw_params(period_bytes)
            .and_then(|()| self.trigger.prepare(&self.mix));
        match result {
            Ok(()) => {
                debug!(period_bytes, "ring re-primed by worker");
                self.events.push("ring re-primed");
            }
            Err(err) => self.record_fault(format!("re-prime failed: {err}")),
        }
    }

    fn record_fault(&self, message: String) {
        error!(%message, "mixer pipeline halted until next prepare");
        self.events.push(message.clone());
        *self.fault.lock() = Some(message);
    }

    pub(crate) fn clear_fault(&self) {
        self.fault.lock().take();
    }
}

/// Handle on the spawned worker thread.
pub(crate) struct MixerWorker {
    handle: Option<JoinHandle<()>>,
}

impl MixerWorker {
    pub(crate) fn spawn(pipeline: Arc<Pipeline>) -> Result<Self, EngineError> {
        let priority = pipeline.config.worker_priority;
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                rt::set_realtime_priority(priority);
                debug!("mixer worker started");
                while pipeline.gate.wait_enabled() {
                    let report = pipeline.cycle();
                    if !report.progressed() {
                        pipeline.ring.wait_completion(pipeline.config.publish_timeout);
                    }
                }
                debug!("mixer worker exiting");
            })
            .map_err(|err| EngineError::ResourceExhausted(format!("mixer worker thread: {err}")))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Request a cooperative stop and wait for the thread.
    pub(crate) fn shutdown(&mut self, pipeline: &Pipeline) {
        pipeline.gate.request_stop();
        pipeline.ring.notify_completion();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("mixer worker panicked");
            }
        }
    }
}
