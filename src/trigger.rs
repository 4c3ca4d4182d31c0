//! Hardware trigger state machine: channel setup, ring priming, start/stop and power side effects.
//!
//! `Idle -> Prebuffering -> Running -> Stopping -> Idle`. The slow operations (channel request,
//! priming, release) are serialised by a sleep-capable lock; the `running`/`prepared` flags live
//! under the ring's low-latency lock so the completion path can read them.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dma::{ChannelRequest, CyclicTransfer, DmaBackend, DmaChannel, SlaveConfig, TransferDirection};
use crate::mix::MixState;
use crate::notifier::CompletionNotifier;
use crate::power::PowerServices;
use crate::ring::RingState;
use crate::{DMA_PERIOD_COUNT, EngineError};

/// Devices tracked in the shared channel bitmap.
pub const MAX_DEVICES: u32 = u64::BITS;

/// Start/stop request from the audio framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerCommand {
    /// Begin playback.
    Start,
    /// Stop playback.
    Stop,
}

/// Observable state of the hardware path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HwState {
    /// No transfer and nothing being prebuffered.
    #[default]
    Idle,
    /// Ring primed and the worker filling it; hardware not started yet.
    Prebuffering,
    /// Hardware transferring.
    Running,
    /// Hardware being stopped.
    Stopping,
}

#[derive(Default)]
struct HwControl {
    channel: Option<DmaChannel>,
    params_init: bool,
    set_params_bitmap: u64,
}

/// Owner of the DMA channel and of every hardware transition.
pub struct HardwareTrigger {
    config: Arc<EngineConfig>,
    ring: Arc<RingState>,
    dma: Arc<dyn DmaBackend>,
    power: Arc<dyn PowerServices>,
    control: Mutex<HwControl>,
}

impl HardwareTrigger {
    /// Controller for `ring` driven through `dma`.
    pub fn new(
        config: Arc<EngineConfig>,
        ring: Arc<RingState>,
        dma: Arc<dyn DmaBackend>,
        power: Arc<dyn PowerServices>,
    ) -> Self {
        Self {
            config,
            ring,
            dma,
            power,
            control: Mutex::new(HwControl::default()),
        }
    }

    /// Current state; `mixing` is the worker's enable flag.
    pub fn state(&self, mixing: bool) -> HwState {
        let flags = self.ring.lock();
        if flags.stopping {
            HwState::Stopping
        } else if flags.running {
            HwState::Running
        } else if flags.prepared && mixing {
            HwState::Prebuffering
        } else {
            HwState::Idle
        }
    }

    /// Whether the hardware is transferring.
    pub fn is_running(&self) -> bool {
        self.ring.lock().running
    }

    /// Allocated channel, if any.
    pub fn channel(&self) -> Option<DmaChannel> {
        self.control.lock().channel
    }

    /// Devices that have prepared on the shared channel.
    pub fn params_bitmap(&self) -> u64 {
        self.control.lock().set_params_bitmap
    }

    pub(crate) fn mark_device(&self, device: u32) {
        self.control.lock().set_params_bitmap |= 1u64 << device;
    }

    /// Commit the ring period size, requesting and configuring the channel on first use.
    pub fn hw_params(&self, period_bytes: usize) -> Result<(), EngineError> {
        let mut control = self.control.lock();

        {
            let flags = self.ring.lock();
            if flags.params_committed {
                if flags.period_bytes == period_bytes {
                    return Ok(());
                }
                if flags.is_active() {
                    return Err(EngineError::ConfigMismatch(format!(
                        "ring committed to {} byte periods, requested {period_bytes}",
                        flags.period_bytes
                    )));
                }
            }
        }

        if period_bytes == 0 || period_bytes * DMA_PERIOD_COUNT > self.ring.area().len() {
            return Err(EngineError::ConfigMismatch(format!(
                "{period_bytes} byte periods do not fit a {} byte ring",
                self.ring.area().len()
            )));
        }

        if !control.params_init {
            let request = ChannelRequest {
                name: self.config.channel_name.clone(),
                client: self.config.client_id,
                cyclic: true,
            };
            let channel = self.dma.request_channel(&request).map_err(|err| {
                error!(channel = %request.name, error = %err, "failed to request dma channel");
                err
            })?;
            let slave = SlaveConfig {
                direction: TransferDirection::MemToDev,
                width: self.config.bus_width,
                fifo_addr: self.config.fifo_addr,
            };
            if let Err(err) = self.dma.configure(channel, &slave) {
                self.dma.release(channel, self.config.client_id);
                return Err(err.into());
            }
            control.channel = Some(channel);
            control.params_init = true;
        }

        let base = self.ring.area().bus_base();
        {
            let mut flags = self.ring.lock();
            flags.params_committed = true;
            flags.period_bytes = period_bytes;
            flags.dma_pos = base;
        }
        info!(
            dma_addr = format_args!("{base:#x}"),
            total = period_bytes * DMA_PERIOD_COUNT,
            period_bytes,
            periods = DMA_PERIOD_COUNT,
            "ring parameters committed"
        );
        Ok(())
    }

    /// Zero the ring, reset slot bookkeeping and enqueue the cyclic transfer.
    pub fn prepare(&self, mix: &MixState) -> Result<(), EngineError> {
        let control = self.control.lock();

        let period_bytes = {
            let flags = self.ring.lock();
            if flags.prepared {
                return Ok(());
            }
            if !control.params_init || !flags.params_committed {
                return Err(EngineError::ConfigMismatch(format!(
                    "ring parameters not committed (init = {}, committed = {})",
                    control.params_init, flags.params_committed
                )));
            }
            flags.period_bytes
        };
        let Some(channel) = control.channel else {
            return Err(EngineError::ConfigMismatch("no dma channel".into()));
        };

        mix.lock().mark_consumed();
        let base = self.ring.area().bus_base();
        self.ring.area().zero(period_bytes * DMA_PERIOD_COUNT);
        self.ring.lock().reset_for_prepare(base);

        self.dma.flush(channel);
        let notifier = CompletionNotifier::new(self.ring.clone(), self.dma.clone(), channel);
        let transfer = CyclicTransfer {
            area: self.ring.area().clone(),
            buf_addr: base,
            period_bytes,
            period_count: DMA_PERIOD_COUNT,
            on_complete: Arc::new(move || notifier.on_period_complete()),
        };
        self.dma.prepare_cyclic(channel, transfer)?;

        self.ring.lock().prepared = true;
        debug!(%channel, period_bytes, "ring primed");
        Ok(())
    }

    /// Start the hardware. Returns `false` when already running or no longer primed.
    ///
    /// Power side effects are rolled back if the backend refuses the trigger.
    pub fn start(&self) -> Result<bool, EngineError> {
        let control = self.control.lock();
        {
            let mut flags = self.ring.lock();
            if flags.running || !flags.prepared {
                return Ok(false);
            }
            flags.running = true;
            flags.last_trigger_fill = Some(flags.filled_count());
        }

        self.power.enable_dma_domain(true);
        self.power.inc_active_count();
        self.power
            .request_low_power_clock_inhibit(self.config.lp_clock_id, true);

        let result = match control.channel {
            Some(channel) => self.dma.trigger(channel).map_err(EngineError::from),
            None => Err(EngineError::ConfigMismatch("no dma channel".into())),
        };
        if let Err(err) = result {
            error!(error = %err, "hardware trigger failed");
            self.ring.lock().running = false;
            self.power.enable_dma_domain(false);
            self.power.dec_active_count();
            self.power
                .request_low_power_clock_inhibit(self.config.lp_clock_id, false);
            return Err(err);
        }
        info!(fill = DMA_PERIOD_COUNT - 1, "hardware started");
        Ok(true)
    }

    /// Stop the hardware and drop the primed state so the next start re-primes from zero.
    pub fn stop(&self) {
        let control = self.control.lock();
        {
            let mut flags = self.ring.lock();
            if !flags.running {
                flags.prepared = false;
                return;
            }
            flags.stopping = true;
        }

        if let Some(channel) = control.channel {
            self.dma.stop(channel);
        }
        self.power.enable_dma_domain(false);
        self.power.dec_active_count();
        {
            let mut flags = self.ring.lock();
            flags.prepared = false;
            flags.running = false;
            flags.stopping = false;
        }
        self.power
            .request_low_power_clock_inhibit(self.config.lp_clock_id, false);
        drop(control);
        self.ring.notify_completion();
        info!("hardware stopped");
    }

    /// Detach `device`. The channel is released only when idle and `device` is its last user.
    pub fn hw_free(&self, device: u32, any_running: bool) -> bool {
        let mut control = self.control.lock();
        let bit = 1u64 << device;
        let mut released = false;

        let running = self.ring.lock().running;
        if running || any_running {
            info!(running, any_running, "mixer channel still in use, keeping hardware");
        } else {
            if control.params_init
                && control.set_params_bitmap & bit != 0
                && control.set_params_bitmap.count_ones() == 1
            {
                if let Some(channel) = control.channel.take() {
                    info!(%channel, "releasing dma channel");
                    self.dma.flush(channel);
                    self.dma.release(channel, self.config.client_id);
                }
                control.params_init = false;
                released = true;
            }
            let mut flags = self.ring.lock();
            flags.params_committed = false;
            flags.prepared = false;
        }

        control.set_params_bitmap &= !bit;
        released
    }

    /// Stop and give the channel back regardless of users. Used at unregistration.
    pub fn release(&self) {
        self.stop();
        let mut control = self.control.lock();
        if let Some(channel) = control.channel.take() {
            self.dma.flush(channel);
            self.dma.release(channel, self.config.client_id);
        }
        control.params_init = false;
        control.set_params_bitmap = 0;
        let mut flags = self.ring.lock();
        flags.params_committed = false;
        flags.prepared = false;
        if flags.running {
            warn!("ring still marked running at release");
            flags.running = false;
        }
    }
}
