//! Power-management side effects of starting and stopping the hardware.

/// Services consulted on every hardware trigger transition.
pub trait PowerServices: Send + Sync {
    /// The engine starts using DRAM-backed DMA.
    fn inc_active_count(&self);
    /// The engine stopped using DRAM-backed DMA.
    fn dec_active_count(&self);
    /// Inhibit (or allow) the low-power clock for requester `id`.
    fn request_low_power_clock_inhibit(&self, id: u32, enable: bool);
    /// Power the audio DMA domain up or down.
    fn enable_dma_domain(&self, _on: bool) {}
}

/// Power services that do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPower;

impl PowerServices for NoopPower {
    fn inc_active_count(&self) {}

    fn dec_active_count(&self) {}

    fn request_low_power_clock_inhibit(&self, _id: u32, _enable: bool) {}
}
