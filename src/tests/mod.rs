mod mix_saturation;
mod ring_order;

use std::sync::Arc;

use crate::format::{HwParams, SampleFormat};
use crate::stream::{PeriodListener, Stream, StreamHandle};

fn silent_listener() -> Arc<dyn PeriodListener> {
    Arc::new(|_: StreamHandle| {})
}

/// A running stream whose whole buffer repeats `frame`.
fn constant_stream(id: u32, format: SampleFormat, frame: [i32; 2], period_bytes: usize) -> Arc<Stream> {
    let stream = Arc::new(Stream::new(StreamHandle::new(id), 0, silent_listener()));
    let params = HwParams::new(format, 48_000, period_bytes, 4);
    {
        let mut state = stream.state();
        state.configure(&params).expect("configure stream");
        let frames = params.buffer_bytes / format.frame_bytes();
        let bytes = format.encode_frames(&vec![frame; frames]);
        state.fill(0, &bytes);
    }
    stream.set_running(true);
    stream
}
