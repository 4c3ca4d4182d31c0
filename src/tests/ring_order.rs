use std::sync::Arc;
use std::time::Duration;

use crate::ring::{DmaArea, RingState};
use crate::{DMA_PERIOD_COUNT, DMA_START_THRESHOLD, EngineError};

const BASE: u64 = 0x4800_0000;
const PERIOD: usize = 480;

fn primed_ring() -> RingState {
    let area = DmaArea::new_local(PERIOD * DMA_PERIOD_COUNT, BASE).expect("ring area");
    let ring = RingState::new(Arc::new(area));
    {
        let mut flags = ring.lock();
        flags.reset_for_prepare(BASE);
        flags.period_bytes = PERIOD;
        flags.params_committed = true;
        flags.prepared = true;
    }
    ring
}

#[test]
fn writer_stops_at_threshold_before_start() {
    let ring = primed_ring();
    for expected in 0..DMA_START_THRESHOLD {
        let mut flags = ring.lock();
        assert!(flags.slot_writable());
        assert!(!flags.prebuffer_ready());
        assert_eq!(flags.write_index, expected);
        flags.commit_write(expected);
    }
    let flags = ring.lock();
    assert_eq!(flags.filled_count(), DMA_START_THRESHOLD);
    assert!(flags.prebuffer_ready());
    assert!(!flags.slot_writable());
}

#[test]
fn completion_frees_only_consumed_slots() {
    let ring = primed_ring();
    let mut flags = ring.lock();
    for slot in 0..DMA_START_THRESHOLD {
        flags.commit_write(slot);
    }
    flags.running = true;

    // Hardware finished slot 0 and moved on to slot 1.
    flags.consume_before(1);
    assert_eq!(flags.filled, [false, true, true, false]);
    assert_eq!(flags.read_index, 1);
    assert!(flags.slot_writable());
    assert_eq!(flags.write_index, 3);
}

#[test]
fn wait_slot_gives_up_when_hardware_is_idle() {
    let ring = primed_ring();
    {
        let mut flags = ring.lock();
        for slot in 0..DMA_START_THRESHOLD {
            flags.commit_write(slot);
        }
    }
    let err = ring.wait_slot(Duration::from_millis(5)).unwrap_err();
    assert!(matches!(err, EngineError::Timeout { slot: 3, waited_ms: 0 }));
    assert_eq!(ring.snapshot().timeouts, 0);

    ring.lock().running = true;
    let err = ring.wait_slot(Duration::from_millis(5)).unwrap_err();
    assert!(matches!(err, EngineError::Timeout { slot: 3, waited_ms: 5 }));
    assert_eq!(ring.snapshot().timeouts, 1);
}

#[test]
fn wait_slot_wakes_on_completion() {
    let ring = Arc::new(primed_ring());
    {
        let mut flags = ring.lock();
        for slot in 0..DMA_START_THRESHOLD {
            flags.commit_write(slot);
        }
        flags.running = true;
    }

    let notifier = ring.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        notifier.lock().consume_before(1);
        notifier.notify_completion();
    });

    let slot = ring.wait_slot(Duration::from_secs(2)).expect("slot freed");
    assert_eq!(slot, 3);
    handle.join().expect("notifier thread");
}

/// Interleave worker writes and hardware completions and check that no slot is overwritten
/// before the hardware played it.
#[test]
fn interleaved_writer_and_notifier_never_overwrite_pending_data() {
    let ring = primed_ring();
    let mut pending = [false; DMA_PERIOD_COUNT];
    let mut hw_index = 0usize;
    let mut seed = 0x2545_f491_u32;
    let mut writes = 0;
    let mut plays = 0;

    for _ in 0..2000 {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let worker_turn = (seed >> 16) % 3 != 0;
        let mut flags = ring.lock();

        if !flags.running && flags.prebuffer_ready() {
            assert_eq!(flags.filled_count(), DMA_START_THRESHOLD);
            flags.running = true;
        }

        if worker_turn {
            if flags.slot_writable() {
                let slot = flags.write_index;
                assert!(!pending[slot], "slot {slot} overwritten before it was played");
                pending[slot] = true;
                flags.commit_write(slot);
                writes += 1;
            }
        } else if flags.running && pending[hw_index] {
            pending[hw_index] = false;
            hw_index = (hw_index + 1) % DMA_PERIOD_COUNT;
            flags.consume_before(hw_index);
            plays += 1;
        }
        assert!(flags.filled_count() <= DMA_START_THRESHOLD);
    }

    assert!(writes > 100, "writer starved: {writes}");
    assert!(plays > 100, "hardware starved: {plays}");
}
