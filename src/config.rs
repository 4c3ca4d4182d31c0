//! Engine configuration.

use std::time::Duration;

/// Bytes reserved for the DMA ring at registration.
pub const DEFAULT_RING_BYTES: usize = 128 * 1024;
/// Bus address the ring is mapped at behind the audio IOMMU.
pub const DEFAULT_BUS_BASE: u64 = 0x4800_0000;
/// Low-power clock request id used by the mixer path.
pub const LPCLK_CTRLID_LEGACY: u32 = 1;
/// Real-time priority of the worker, half of the FIFO range.
pub const DEFAULT_WORKER_PRIORITY: i32 = 50;

/// Static configuration handed to [`Engine::register`](crate::Engine::register).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Size of the DMA ring allocation.
    pub ring_bytes: usize,
    /// Bus address of the first ring byte as seen by the DMA engine.
    pub bus_base: u64,
    /// Peripheral FIFO the cyclic transfer targets.
    pub fifo_addr: u64,
    /// Transfer width in bytes.
    pub bus_width: u32,
    /// Channel name passed to the backend's channel request.
    pub channel_name: String,
    /// Client id passed to the backend's channel request and release.
    pub client_id: u32,
    /// Id used for low-power clock inhibit requests.
    pub lp_clock_id: u32,
    /// Longest the publish phase waits for a ring slot before skipping the cycle.
    pub publish_timeout: Duration,
    /// SCHED_FIFO priority requested for the worker thread.
    pub worker_priority: i32,
    /// Spawn the worker thread at registration. When `false`, cycles run via `Engine::step`.
    pub spawn_worker: bool,
    /// Back the ring with an anonymous shared mapping instead of heap memory.
    pub shared_ring: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_bytes: DEFAULT_RING_BYTES,
            bus_base: DEFAULT_BUS_BASE,
            fifo_addr: 0,
            bus_width: 4,
            channel_name: "tx".to_string(),
            client_id: 0,
            lp_clock_id: LPCLK_CTRLID_LEGACY,
            publish_timeout: Duration::from_millis(20),
            worker_priority: DEFAULT_WORKER_PRIORITY,
            spawn_worker: true,
            shared_ring: true,
        }
    }
}

impl EngineConfig {
    /// Configuration for driving cycles by hand with a short publish timeout.
    pub fn manual() -> Self {
        Self {
            publish_timeout: Duration::from_millis(2),
            spawn_worker: false,
            shared_ring: false,
            ..Self::default()
        }
    }
}
