use std::sync::Arc;

use eax_mixer::sim::{CountingPower, SimDma, constant_bytes};
use eax_mixer::{
    Engine, EngineConfig, HwParams, PeriodListener, PublishOutcome, SampleFormat, StreamHandle,
    TriggerCommand,
};

fn quiet() -> Arc<dyn PeriodListener> {
    Arc::new(|_: StreamHandle| {})
}

fn manual_engine() -> Engine {
    Engine::register(
        EngineConfig::manual(),
        Arc::new(SimDma::new()),
        Arc::new(CountingPower::new()),
    )
    .expect("register")
}

fn open_constant(engine: &Engine, params: HwParams, frame: [i32; 2]) -> StreamHandle {
    let handle = engine.stream_open(0, quiet()).expect("open");
    engine.negotiate_hw_params(handle, params).expect("hw params");
    let frames = params.buffer_bytes / params.format.frame_bytes();
    engine
        .fill_stream(handle, 0, &constant_bytes(params.format, frame[0], frame[1], frames))
        .expect("fill");
    engine.prepare(handle).expect("prepare");
    handle
}

fn first_period(engine: &Engine, format: SampleFormat) -> Vec<[i32; 2]> {
    let report = engine.step();
    assert!(report.mixed);
    assert_eq!(report.publish, PublishOutcome::Published);
    format.decode_frames(&engine.read_ring_slot(0))
}

#[test]
fn two_loud_normal_streams_clip_to_full_scale() {
    let engine = manual_engine();
    let params = HwParams::new(SampleFormat::Normal16, 48_000, 480, 4);
    let a = open_constant(&engine, params, [20_000, 20_000]);
    let b = open_constant(&engine, params, [20_000, 20_000]);
    engine.trigger(a, TriggerCommand::Start).expect("start a");
    engine.trigger(b, TriggerCommand::Start).expect("start b");

    let frames = first_period(&engine, SampleFormat::Normal16);
    assert_eq!(frames.len(), 120);
    assert!(frames.iter().all(|f| *f == [32_767, 32_767]), "{:?}", &frames[..4]);
}

#[test]
fn negative_sums_clip_symmetrically() {
    let engine = manual_engine();
    let params = HwParams::new(SampleFormat::Normal16, 48_000, 480, 4);
    let a = open_constant(&engine, params, [-30_000, 10_000]);
    let b = open_constant(&engine, params, [-30_000, -10_000]);
    engine.trigger(a, TriggerCommand::Start).expect("start a");
    engine.trigger(b, TriggerCommand::Start).expect("start b");

    let frames = first_period(&engine, SampleFormat::Normal16);
    assert!(frames.iter().all(|f| *f == [-32_767, 0]));
}

#[test]
fn uhqa_streams_clip_to_24_bits() {
    let engine = manual_engine();
    let params = HwParams::new(SampleFormat::Uhqa24in32, 192_000, 3840, 4);
    let a = open_constant(&engine, params, [0x60_0000, -0x60_0000]);
    let b = open_constant(&engine, params, [0x60_0000, -0x60_0000]);
    engine.trigger(a, TriggerCommand::Start).expect("start a");
    engine.trigger(b, TriggerCommand::Start).expect("start b");

    let status = engine.status();
    assert_eq!(status.mix_format, SampleFormat::Uhqa24in32);
    assert_eq!(status.mix_frames, 480);

    let frames = first_period(&engine, SampleFormat::Uhqa24in32);
    assert_eq!(frames.len(), 480);
    assert!(frames.iter().all(|f| *f == [0x7f_ffff, -0x7f_ffff]));
}

#[test]
fn single_silent_stream_publishes_silence() {
    let engine = manual_engine();
    let params = HwParams::new(SampleFormat::Normal16, 48_000, 480, 4);
    let handle = open_constant(&engine, params, [0, 0]);
    engine.trigger(handle, TriggerCommand::Start).expect("start");

    let frames = first_period(&engine, SampleFormat::Normal16);
    assert_eq!(frames.len(), 120);
    assert!(frames.iter().all(|f| *f == [0, 0]));
    assert!(engine.status().ring.filled[0]);
}

#[test]
fn quiet_streams_sum_exactly() {
    let engine = manual_engine();
    let params = HwParams::new(SampleFormat::Normal16, 44_100, 1764, 4);
    let a = open_constant(&engine, params, [1_200, -7]);
    let b = open_constant(&engine, params, [-200, 7]);
    let c = open_constant(&engine, params, [5, 5]);
    for handle in [a, b, c] {
        engine.trigger(handle, TriggerCommand::Start).expect("start");
    }

    let frames = first_period(&engine, SampleFormat::Normal16);
    assert_eq!(frames.len(), 441);
    assert!(frames.iter().all(|f| *f == [1_005, 5]));
}
