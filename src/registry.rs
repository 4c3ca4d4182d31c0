//! Registry of open streams, scanned by the worker on every mix cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error};

use crate::EngineError;
use crate::stream::{PeriodListener, Stream, StreamHandle};

/// Set of open streams. A stream is mix-eligible iff it is registered and running.
pub struct StreamRegistry {
    streams: Mutex<Vec<Arc<Stream>>>,
    next_id: AtomicU32,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Create and insert a stream for `device`.
    pub fn register_stream(
        &self,
        device: u32,
        listener: Arc<dyn PeriodListener>,
    ) -> Result<Arc<Stream>, EngineError> {
        let handle = StreamHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let stream = Arc::new(Stream::new(handle, device, listener));

        let mut guard = self.streams.lock();
        guard
            .try_reserve(1)
            .map_err(|_| EngineError::ResourceExhausted(format!("registry slot for {handle}")))?;
        debug_assert!(guard.iter().all(|s| s.handle() != handle));
        guard.push(stream.clone());
        drop(guard);

        debug!(%handle, device, "stream registered");
        Ok(stream)
    }

    /// Remove `handle`. An absent handle is a caller defect.
    pub fn unregister_stream(&self, handle: StreamHandle) -> Result<Arc<Stream>, EngineError> {
        let mut guard = self.streams.lock();
        let Some(index) = guard.iter().position(|s| s.handle() == handle) else {
            drop(guard);
            error!(%handle, "unregister of unknown stream");
            return Err(EngineError::ProtocolError(format!("{handle} is not registered")));
        };
        let stream = guard.swap_remove(index);
        drop(guard);
        debug!(%handle, "stream removed");
        Ok(stream)
    }

    /// Look up an open stream.
    pub fn get(&self, handle: StreamHandle) -> Result<Arc<Stream>, EngineError> {
        self.streams
            .lock()
            .iter()
            .find(|s| s.handle() == handle)
            .cloned()
            .ok_or_else(|| EngineError::ProtocolError(format!("{handle} is not registered")))
    }

    /// True iff at least one registered stream is running.
    pub fn any_running(&self) -> bool {
        self.streams.lock().iter().any(|s| s.is_running())
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether no stream is open.
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Handles of all open streams.
    pub fn handles(&self) -> Vec<StreamHandle> {
        self.streams.lock().iter().map(|s| s.handle()).collect()
    }

    /// Clone of the current membership.
    pub fn snapshot(&self) -> Vec<Arc<Stream>> {
        self.streams.lock().clone()
    }

    /// Hold the registry for a whole mix cycle.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<Arc<Stream>>> {
        self.streams.lock()
    }
}
