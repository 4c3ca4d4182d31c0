//! Real-time scheduling for the mixer worker thread.
//!
//! On Linux the calling thread is moved to `SCHED_FIFO` (falling back to `SCHED_RR`). This needs
//! `CAP_SYS_NICE`; without it the worker keeps the default policy and a warning is logged.

use tracing::{debug, info, warn};

/// Outcome of a priority elevation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PriorityResult {
    Success,
    Failed,
    Unsupported,
}

/// Elevate the calling thread to real-time `priority`.
pub(crate) fn set_realtime_priority(priority: i32) -> PriorityResult {
    let result = platform_set_priority(priority);
    match result {
        PriorityResult::Success => info!(priority, "mixer worker running with real-time priority"),
        PriorityResult::Failed => warn!(priority, "failed to set real-time priority (non-fatal)"),
        PriorityResult::Unsupported => debug!("real-time priority not supported on this platform"),
    }
    result
}

#[cfg(target_os = "linux")]
fn platform_set_priority(priority: i32) -> PriorityResult {
    use libc::{SCHED_FIFO, SCHED_RR, sched_param, sched_setscheduler};

    let param = sched_param {
        sched_priority: priority,
    };
    if unsafe { sched_setscheduler(0, SCHED_FIFO, &param) } == 0 {
        return PriorityResult::Success;
    }
    debug!("SCHED_FIFO refused, trying SCHED_RR");
    if unsafe { sched_setscheduler(0, SCHED_RR, &param) } == 0 {
        return PriorityResult::Success;
    }
    PriorityResult::Failed
}

#[cfg(not(target_os = "linux"))]
fn platform_set_priority(_priority: i32) -> PriorityResult {
    PriorityResult::Unsupported
}
