use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::constant_stream;
use crate::format::{HwParams, SampleFormat};
use crate::mix::MixState;
use crate::stream::{Stream, StreamHandle};

#[test]
fn normal_mix_saturates_instead_of_wrapping() {
    let mix = MixState::new().expect("mix state");
    let a = constant_stream(1, SampleFormat::Normal16, [20_000, -20_000], 480);
    let b = constant_stream(2, SampleFormat::Normal16, [20_000, -20_000], 480);

    let mut buffer = mix.lock();
    buffer.configure(SampleFormat::Normal16, 48_000, 480);
    buffer.mix_streams(&[a, b], false);

    assert!(buffer.is_filled());
    let frames = buffer.frames_snapshot();
    assert_eq!(frames.len(), 120);
    assert!(frames.iter().all(|f| *f == [32_767, -32_767]), "{:?}", &frames[..4]);
}

#[test]
fn uhqa_mix_clips_at_24_bits() {
    let mix = MixState::new().expect("mix state");
    let a = constant_stream(1, SampleFormat::Uhqa24in32, [0x60_0000, -0x60_0000], 3840);
    let b = constant_stream(2, SampleFormat::Uhqa24in32, [0x60_0000, -0x60_0000], 3840);
    let c = constant_stream(3, SampleFormat::Uhqa24in32, [0x10, 0x10], 3840);

    let mut buffer = mix.lock();
    buffer.configure(SampleFormat::Uhqa24in32, 48_000, 3840);
    buffer.mix_streams(&[a, b, c], false);

    let frames = buffer.frames_snapshot();
    assert_eq!(frames.len(), 480);
    assert!(frames.iter().all(|f| *f == [0x7f_ffff, -0x7f_ffff]));
}

#[test]
fn stopped_streams_do_not_contribute() {
    let mix = MixState::new().expect("mix state");
    let a = constant_stream(1, SampleFormat::Normal16, [1_000, 2_000], 480);
    let b = constant_stream(2, SampleFormat::Normal16, [5_000, 5_000], 480);
    b.set_running(false);

    let mut buffer = mix.lock();
    buffer.configure(SampleFormat::Normal16, 48_000, 480);
    buffer.mix_streams(&[a, b.clone()], false);

    assert!(buffer.frames_snapshot().iter().all(|f| *f == [1_000, 2_000]));
    assert_eq!(b.state().cursor.offset(), 0);
}

#[test]
fn silent_stream_mixes_to_silence() {
    let mix = MixState::new().expect("mix state");
    let a = constant_stream(1, SampleFormat::Normal16, [0, 0], 480);

    let mut buffer = mix.lock();
    buffer.configure(SampleFormat::Normal16, 48_000, 480);
    buffer.mix_streams(&[a], false);

    let mut bytes = Vec::new();
    buffer.encode_into(&mut bytes);
    assert_eq!(bytes.len(), 480);
    assert!(bytes.iter().all(|b| *b == 0));
}

#[test]
fn period_boundaries_collect_one_notification_each() {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let stream = Arc::new(Stream::new(
        StreamHandle::new(7),
        0,
        Arc::new(move |_: StreamHandle| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    ));
    // 240-byte periods: two boundaries per 120-frame mix.
    stream
        .state()
        .configure(&HwParams::new(SampleFormat::Normal16, 48_000, 240, 4))
        .expect("configure");
    stream.set_running(true);

    let mix = MixState::new().expect("mix state");
    let mut buffer = mix.lock();
    buffer.configure(SampleFormat::Normal16, 48_000, 240);
    buffer.mix_streams(&[stream.clone()], false);

    let elapsed = buffer.take_elapsed();
    assert_eq!(elapsed.len(), 2);
    for (handle, listener) in &elapsed {
        assert_eq!(*handle, stream.handle());
        listener.period_elapsed(*handle);
    }
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(stream.state().position_frames(), 120);
}

#[test]
fn mix_period_follows_negotiated_rate() {
    assert_eq!(SampleFormat::Normal16.mix_frames(48_000, 480), 120);
    assert_eq!(SampleFormat::Normal16.mix_frames(44_100, 440), 110);
    assert_eq!(SampleFormat::Normal16.mix_frames(44_100, 1764), 441);
    assert_eq!(SampleFormat::Uhqa24in32.mix_frames(192_000, 3840), 480);
    assert_eq!(SampleFormat::Uhqa24in32.mix_period_bytes(48_000, 3840), 3840);
}
