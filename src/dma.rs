//! Interface to the physical DMA transfer backend.

use std::fmt;
use std::sync::Arc;

use crate::ring::DmaArea;

/// Opaque channel id handed out by [`DmaBackend::request_channel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DmaChannel(pub u32);

impl fmt::Display for DmaChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dma-ch{}", self.0)
    }
}

/// Parameters of a channel request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Channel name as known to the backend.
    pub name: String,
    /// Client id, passed back on release.
    pub client: u32,
    /// The channel will run cyclic transfers.
    pub cyclic: bool,
}

/// Transfer direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    /// Memory to peripheral FIFO (playback).
    MemToDev,
}

/// Slave-side configuration of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlaveConfig {
    /// Transfer direction.
    pub direction: TransferDirection,
    /// Bus width in bytes.
    pub width: u32,
    /// Peripheral FIFO address.
    pub fifo_addr: u64,
}

/// Callback fired by the backend once per completed period. Must not block.
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// A cyclic transfer over `period_count` periods of `period_bytes` starting at `buf_addr`.
#[derive(Clone)]
pub struct CyclicTransfer {
    /// Memory being transferred.
    pub area: Arc<DmaArea>,
    /// Bus address of the first period.
    pub buf_addr: u64,
    /// Bytes per period.
    pub period_bytes: usize,
    /// Periods in the loop.
    pub period_count: usize,
    /// Fired after every period.
    pub on_complete: CompletionCallback,
}

impl fmt::Debug for CyclicTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclicTransfer")
            .field("buf_addr", &format_args!("{:#x}", self.buf_addr))
            .field("period_bytes", &self.period_bytes)
            .field("period_count", &self.period_count)
            .finish()
    }
}

/// Current source/destination bus addresses of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusPosition {
    /// Source (memory) address.
    pub src: u64,
    /// Destination (FIFO) address.
    pub dst: u64,
}

/// Backend failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DmaError {
    /// No channel could be allocated.
    #[error("dma channel {0} unavailable")]
    ChannelUnavailable(String),
    /// The backend refused the operation.
    #[error("dma operation rejected: {0}")]
    Rejected(String),
}

/// Operations the engine needs from the DMA controller driver.
pub trait DmaBackend: Send + Sync {
    /// Allocate a channel.
    fn request_channel(&self, request: &ChannelRequest) -> Result<DmaChannel, DmaError>;
    /// Configure direction, width and FIFO.
    fn configure(&self, channel: DmaChannel, config: &SlaveConfig) -> Result<(), DmaError>;
    /// Enqueue a cyclic transfer; replaces any previous one.
    fn prepare_cyclic(&self, channel: DmaChannel, transfer: CyclicTransfer) -> Result<(), DmaError>;
    /// Start transferring.
    fn trigger(&self, channel: DmaChannel) -> Result<(), DmaError>;
    /// Stop transferring.
    fn stop(&self, channel: DmaChannel);
    /// Drop queued descriptors.
    fn flush(&self, channel: DmaChannel);
    /// Return the channel.
    fn release(&self, channel: DmaChannel, client: u32);
    /// Addresses the channel is currently at.
    fn position(&self, channel: DmaChannel) -> BusPosition;
}
