use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use eax_mixer::sim::{CountingPower, DmaEvent, SimDma};
use eax_mixer::{
    Engine, EngineConfig, EngineError, HwParams, HwState, PeriodListener, PublishOutcome,
    SampleFormat, StreamHandle, TriggerCommand,
};

struct Rig {
    sim: SimDma,
    power: Arc<CountingPower>,
    engine: Engine,
}

fn rig() -> Rig {
    let sim = SimDma::new();
    let power = Arc::new(CountingPower::new());
    let engine = Engine::register(EngineConfig::manual(), Arc::new(sim.clone()), power.clone())
        .expect("register");
    Rig { sim, power, engine }
}

fn quiet() -> Arc<dyn PeriodListener> {
    Arc::new(|_: StreamHandle| {})
}

fn normal_params() -> HwParams {
    HwParams::new(SampleFormat::Normal16, 48_000, 480, 4)
}

fn ready_stream(engine: &Engine, device: u32) -> StreamHandle {
    let handle = engine.stream_open(device, quiet()).expect("open");
    engine.negotiate_hw_params(handle, normal_params()).expect("hw params");
    engine.prepare(handle).expect("prepare");
    handle
}

fn run_to_hardware(engine: &Engine) {
    for _ in 0..4 {
        engine.step();
    }
    assert!(engine.is_dma_running());
}

fn events(sim: &SimDma, wanted: fn(&DmaEvent) -> bool) -> usize {
    sim.events().iter().filter(|e| wanted(e)).count()
}

#[test]
fn closing_twice_is_a_protocol_error_without_side_effects() {
    let rig = rig();
    let a = ready_stream(&rig.engine, 0);
    let b = ready_stream(&rig.engine, 0);
    rig.engine.trigger(b, TriggerCommand::Start).expect("start b");
    run_to_hardware(&rig.engine);

    rig.engine.stream_close(a).expect("first close");
    let before = rig.engine.status();
    let err = rig.engine.stream_close(a).unwrap_err();
    assert!(matches!(err, EngineError::ProtocolError(_)));

    let after = rig.engine.status();
    assert_eq!(before.ring, after.ring);
    assert_eq!(after.streams.len(), 1);
    assert_eq!(after.streams[0].handle, b);
    assert!(after.streams[0].running);
    assert!(rig.engine.is_dma_running());
    assert!(matches!(
        rig.engine.query_position(a),
        Err(EngineError::ProtocolError(_))
    ));
}

#[test]
fn closing_the_last_running_stream_stops_hardware() {
    let rig = rig();
    let handle = ready_stream(&rig.engine, 0);
    rig.engine.trigger(handle, TriggerCommand::Start).expect("start");
    run_to_hardware(&rig.engine);
    assert_eq!(rig.power.active_count(), 1);

    rig.engine.stream_close(handle).expect("close");
    assert!(!rig.engine.is_dma_running());
    assert_eq!(rig.engine.hw_state(), HwState::Idle);
    assert_eq!(rig.power.active_count(), 0);
    assert_eq!(events(&rig.sim, |e| matches!(e, DmaEvent::Stop)), 1);
}

#[test]
fn stop_keeps_hardware_while_another_stream_runs() {
    let rig = rig();
    let a = ready_stream(&rig.engine, 0);
    let b = ready_stream(&rig.engine, 1);
    rig.engine.trigger(a, TriggerCommand::Start).expect("start a");
    rig.engine.trigger(b, TriggerCommand::Start).expect("start b");
    run_to_hardware(&rig.engine);

    rig.engine.trigger(a, TriggerCommand::Stop).expect("stop a");
    assert!(rig.engine.is_dma_running());
    rig.engine.trigger(b, TriggerCommand::Stop).expect("stop b");
    assert!(!rig.engine.is_dma_running());
    assert!(!rig.engine.status().ring.prepared);

    // The next start re-primes from zero.
    rig.engine.prepare(a).expect("re-prepare");
    assert_eq!(events(&rig.sim, |e| matches!(e, DmaEvent::Prepare { .. })), 2);
    let ring = rig.engine.status().ring;
    assert_eq!(ring.write_index, 0);
    assert_eq!(ring.filled_count(), 0);
}

#[test]
fn hw_free_releases_channel_for_last_device() {
    let rig = rig();
    let a = ready_stream(&rig.engine, 0);
    let b = ready_stream(&rig.engine, 1);
    assert_eq!(rig.engine.status().params_bitmap, 0b11);

    assert!(!rig.engine.hw_free(a).expect("free a"));
    assert!(rig.engine.status().channel.is_some());
    assert!(rig.engine.hw_free(b).expect("free b"));
    assert!(rig.engine.status().channel.is_none());
    assert_eq!(events(&rig.sim, |e| matches!(e, DmaEvent::Release(_))), 1);

    // Renegotiating requests a fresh channel.
    rig.engine.negotiate_hw_params(a, normal_params()).expect("renegotiate");
    assert_eq!(events(&rig.sim, |e| matches!(e, DmaEvent::Request(_))), 2);
}

#[test]
fn hw_free_keeps_channel_while_running() {
    let rig = rig();
    let a = ready_stream(&rig.engine, 0);
    rig.engine.trigger(a, TriggerCommand::Start).expect("start");
    run_to_hardware(&rig.engine);

    assert!(!rig.engine.hw_free(a).expect("free"));
    assert!(rig.engine.status().channel.is_some());
    assert_eq!(events(&rig.sim, |e| matches!(e, DmaEvent::Release(_))), 0);
}

#[test]
fn format_change_while_active_is_a_config_mismatch() {
    let rig = rig();
    let a = ready_stream(&rig.engine, 0);
    rig.engine.trigger(a, TriggerCommand::Start).expect("start");

    let b = rig.engine.stream_open(1, quiet()).expect("open b");
    let uhqa = HwParams::new(SampleFormat::Uhqa24in32, 192_000, 3840, 4);
    assert!(matches!(
        rig.engine.negotiate_hw_params(b, uhqa),
        Err(EngineError::ConfigMismatch(_))
    ));
    let status = rig.engine.status();
    assert_eq!(status.mix_format, SampleFormat::Normal16);
    assert_eq!(status.ring.period_bytes, 480);
}

#[test]
fn invalid_requests_fail_cleanly() {
    let rig = rig();
    let handle = rig.engine.stream_open(0, quiet()).expect("open");

    assert!(matches!(
        rig.engine.prepare(handle),
        Err(EngineError::ConfigMismatch(_))
    ));
    assert!(matches!(
        rig.engine.trigger(handle, TriggerCommand::Start),
        Err(EngineError::ConfigMismatch(_))
    ));
    assert!(matches!(
        rig.engine.negotiate_hw_params(handle, HwParams::new(SampleFormat::Normal16, 48_000, 100, 4)),
        Err(EngineError::ConfigMismatch(_))
    ));
    assert!(matches!(
        rig.engine.stream_open(64, quiet()),
        Err(EngineError::ConfigMismatch(_))
    ));
    assert_eq!(rig.engine.streams(), vec![handle]);

    rig.sim.set_fail_request(true);
    assert!(matches!(
        rig.engine.negotiate_hw_params(handle, normal_params()),
        Err(EngineError::HardwareRejected(_))
    ));
    rig.sim.set_fail_request(false);
    rig.engine
        .negotiate_hw_params(handle, normal_params())
        .expect("retry");
}

#[test]
fn failed_start_is_reported_and_retried_on_next_trigger() {
    let rig = rig();
    let handle = ready_stream(&rig.engine, 0);
    rig.engine.trigger(handle, TriggerCommand::Start).expect("start");

    rig.sim.set_fail_trigger(true);
    for _ in 0..4 {
        rig.engine.step();
    }
    let status = rig.engine.status();
    assert!(status.fault.is_some());
    assert_eq!(status.state, HwState::Prebuffering);
    assert_eq!(rig.power.active_count(), 0);
    assert_eq!(rig.engine.step().publish, PublishOutcome::Idle);

    rig.sim.set_fail_trigger(false);
    rig.engine.trigger(handle, TriggerCommand::Start).expect("restart");
    rig.engine.step();
    assert!(rig.engine.is_dma_running());
    assert!(rig.engine.status().fault.is_none());
}

#[test]
fn period_elapsed_and_position_follow_the_mix() {
    let rig = rig();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let listener: Arc<dyn PeriodListener> = Arc::new(move |_: StreamHandle| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let handle = rig.engine.stream_open(0, listener).expect("open");
    // 240-byte periods, 8 of them: 480 frames of buffer, two periods per mix cycle.
    let params = HwParams::new(SampleFormat::Normal16, 48_000, 240, 8);
    rig.engine.negotiate_hw_params(handle, params).expect("hw params");
    rig.engine.prepare(handle).expect("prepare");
    assert_eq!(rig.engine.query_position(handle).expect("position"), 0);

    rig.engine.trigger(handle, TriggerCommand::Start).expect("start");
    rig.engine.step();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(rig.engine.query_position(handle).expect("position"), 120);

    rig.engine.step();
    rig.engine.step();
    assert_eq!(count.load(Ordering::SeqCst), 6);
    assert_eq!(rig.engine.query_position(handle).expect("position"), 360);

    rig.engine.step();
    assert_eq!(rig.engine.query_position(handle).expect("position"), 0);
}

#[test]
fn unregister_releases_everything() {
    let rig = rig();
    let handle = ready_stream(&rig.engine, 0);
    rig.engine.trigger(handle, TriggerCommand::Start).expect("start");
    run_to_hardware(&rig.engine);

    let Rig { sim, power, engine } = rig;
    engine.unregister();
    assert!(!sim.is_running());
    assert_eq!(power.active_count(), 0);
    let events = sim.events();
    assert!(matches!(events.last(), Some(DmaEvent::Release(_))));
}
