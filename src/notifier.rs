//! Completion path, invoked by the DMA backend once per finished period.

use std::sync::Arc;

use tracing::trace;

use crate::DMA_PERIOD_COUNT;
use crate::dma::{DmaBackend, DmaChannel};
use crate::ring::{RingState, monotonic_timestamp_ns};

/// Reclaims consumed ring slots and wakes the worker. Never blocks or allocates.
pub struct CompletionNotifier {
    ring: Arc<RingState>,
    dma: Arc<dyn DmaBackend>,
    channel: DmaChannel,
}

impl CompletionNotifier {
    /// Notifier for transfers on `channel`.
    pub fn new(ring: Arc<RingState>, dma: Arc<dyn DmaBackend>, channel: DmaChannel) -> Self {
        Self { ring, dma, channel }
    }

    /// Handle one period boundary.
    pub fn on_period_complete(&self) {
        let src = self.dma.position(self.channel).src;
        let now = monotonic_timestamp_ns();
        {
            let mut flags = self.ring.lock();
            if !flags.running || flags.period_bytes == 0 {
                return;
            }
            let base = self.ring.area().bus_base();
            let period = flags.period_bytes as u64;
            let ring_end = base + period * DMA_PERIOD_COUNT as u64;

            let hw_index = (src.saturating_sub(base) / period) as usize;
            let mut pos = base + hw_index as u64 * period;
            if pos >= ring_end {
                pos = base;
            }
            flags.dma_pos = pos;
            flags.consume_before(hw_index % DMA_PERIOD_COUNT);
            flags.completions += 1;
            flags.last_completion_ns = now;
            trace!(hw_index, write_index = flags.write_index, "period complete");
        }
        self.ring.notify_completion();
    }
}
