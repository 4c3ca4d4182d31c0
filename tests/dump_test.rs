use std::fs;
use std::sync::Arc;

use eax_mixer::dump::{FileDumpTarget, mix_dump_name, stream_dump_name};
use eax_mixer::sim::{CountingPower, MemoryDump, SimDma, constant_bytes};
use eax_mixer::{
    Engine, EngineConfig, HwParams, PeriodListener, SampleFormat, StreamHandle, TriggerCommand,
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

fn start_constant(engine: &Engine, device: u32, frame: [i32; 2]) -> StreamHandle {
    let params = HwParams::new(SampleFormat::Normal16, 48_000, 480, 4);
    let handle = engine.stream_open(device, quiet()).expect("open");
    engine.negotiate_hw_params(handle, params).expect("hw params");
    engine
        .fill_stream(handle, 0, &constant_bytes(SampleFormat::Normal16, frame[0], frame[1], 480))
        .expect("fill");
    engine.prepare(handle).expect("prepare");
    engine.trigger(handle, TriggerCommand::Start).expect("start");
    handle
}

#[test]
fn enabled_dump_captures_streams_and_published_periods() {
    let engine = manual_engine();
    let dump = MemoryDump::new();
    engine.set_dump_target(Some(Arc::new(dump.clone())));
    engine.set_pcm_dump_enabled(true);

    start_constant(&engine, 2, [10, 20]);
    start_constant(&engine, 5, [1, 2]);
    engine.step();
    engine.step();

    let normal = SampleFormat::Normal16;
    let stream_a = dump.contents(&stream_dump_name(2, 0, normal));
    let stream_b = dump.contents(&stream_dump_name(5, 1, normal));
    assert_eq!(stream_a.len(), 2 * 480);
    assert_eq!(stream_a, constant_bytes(normal, 10, 20, 240));
    assert_eq!(stream_b, constant_bytes(normal, 1, 2, 240));

    let mixed = dump.contents(mix_dump_name(normal));
    assert_eq!(mixed.len(), 2 * 480);
    assert_eq!(&mixed[..480], engine.read_ring_slot(0).as_slice());
    assert_eq!(&mixed[480..], engine.read_ring_slot(1).as_slice());
    assert_eq!(normal.decode_frames(&mixed)[0], [11, 22]);
    assert!(dump.contents(mix_dump_name(SampleFormat::Uhqa24in32)).is_empty());
}

#[test]
fn disabled_dump_writes_nothing() {
    let engine = manual_engine();
    let dump = MemoryDump::new();
    engine.set_dump_target(Some(Arc::new(dump.clone())));

    start_constant(&engine, 0, [10, 20]);
    engine.step();

    assert_eq!(dump.names(), vec![stream_dump_name(0, 0, SampleFormat::Normal16)]);
    assert!(dump.contents(&stream_dump_name(0, 0, SampleFormat::Normal16)).is_empty());

    engine.set_pcm_dump_enabled(true);
    engine.step();
    assert_eq!(
        dump.contents(mix_dump_name(SampleFormat::Normal16)).len(),
        480
    );
    assert!(!engine.status().events.is_empty());
}

#[test]
fn file_target_appends_raw_bytes() {
    let dir = std::env::temp_dir().join(format!("eax-dump-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);

    {
        let engine = manual_engine();
        engine.set_dump_target(Some(Arc::new(FileDumpTarget::new(&dir))));
        engine.set_pcm_dump_enabled(true);
        let handle = start_constant(&engine, 1, [3, 4]);
        engine.step();
        engine.hw_free(handle).expect("hw free");
        engine.set_pcm_dump_enabled(false);
    }

    let stream = fs::read(dir.join("P_1_0_N.raw")).expect("stream dump");
    assert_eq!(stream, constant_bytes(SampleFormat::Normal16, 3, 4, 120));
    let mixed = fs::read(dir.join("mix_buf_normal.raw")).expect("mix dump");
    assert_eq!(mixed, constant_bytes(SampleFormat::Normal16, 3, 4, 120));

    let _ = fs::remove_dir_all(&dir);
}
