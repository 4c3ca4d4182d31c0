use std::env;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use eax_mixer::sim::{CountingPower, SimDma, tone_bytes};
use eax_mixer::{
    Engine, EngineConfig, EngineError, HwParams, PeriodListener, SampleFormat, StreamHandle,
    TriggerCommand,
};

const RATE: u32 = 48_000;
const PERIOD_BYTES: usize = 480;
const PERIODS: usize = 4;
const TONES_HZ: [f64; 2] = [400.0, 1000.0];

fn start_demo() -> Result<Arc<Engine>, EngineError> {
    let format = SampleFormat::Normal16;
    let period = Duration::from_micros(
        (format.mix_frames(RATE, PERIOD_BYTES) as u64 * 1_000_000) / RATE as u64,
    );
    let engine = Arc::new(Engine::register(
        EngineConfig::default(),
        Arc::new(SimDma::clocked(period)),
        Arc::new(CountingPower::new()),
    )?);

    let params = HwParams::new(format, RATE, PERIOD_BYTES, PERIODS);
    let buffer_frames = params.buffer_bytes / format.frame_bytes();
    let mut handles = Vec::new();
    for (device, hz) in TONES_HZ.iter().enumerate() {
        let listener: Arc<dyn PeriodListener> = Arc::new(|_: StreamHandle| {});
        let handle = engine.stream_open(device as u32, listener)?;
        engine.negotiate_hw_params(handle, params)?;
        engine.fill_stream(handle, 0, &tone_bytes(format, RATE, *hz, 0.4, buffer_frames))?;
        engine.prepare(handle)?;
        handles.push(handle);
    }
    for handle in handles {
        engine.trigger(handle, TriggerCommand::Start)?;
    }
    Ok(engine)
}

fn print_status(engine: &Engine) {
    let status = eax_mixer::control::api::get_status(engine);
    let ring = &status.ring;
    println!("State        : {:?}", status.state);
    println!("Mix          : {:?} x {} frames", status.mix_format, status.mix_frames);
    println!("Period       : {} bytes", ring.period_bytes);
    println!("Ring         : {:?} (write {}, read {})", ring.filled, ring.write_index, ring.read_index);
    println!("DMA position : {:#x}", ring.dma_pos);
    println!("Completions  : {}", ring.completions);
    println!("Timeouts     : {}", ring.timeouts);
    println!(
        "Trigger fill : {}",
        ring.last_trigger_fill
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Streams:");
    for stream in status.streams {
        println!(
            "  [{}] device={} | {:?} {} Hz | running={} | pos={}/{} frames",
            stream.handle,
            stream.device,
            stream.format,
            stream.rate,
            if stream.running { "yes" } else { "no" },
            stream.position_frames,
            stream.buffer_frames,
        );
    }
    println!("Events:");
    for event in status.events {
        println!("  {event}");
    }
}

fn main() {
    let mut status_only = false;
    if let Some(arg) = env::args().nth(1) {
        match arg.as_str() {
            "--status" | "-s" => status_only = true,
            "--help" | "-h" => {
                println!(
                    "Usage: eaxctl [--status]\n\nRuns the mixer against a simulated DMA controller with two test tones.\nWithout arguments the interactive console launches."
                );
                return;
            }
            other => {
                eprintln!("eaxctl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    if status_only {
        eax_mixer::init_tracing();
    }
    let engine = match start_demo() {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("eaxctl: {err}");
            process::exit(1);
        }
    };

    if status_only {
        thread::sleep(Duration::from_millis(200));
        print_status(&engine);
        return;
    }

    if let Err(err) = eax_mixer::control::ui::run(engine) {
        eprintln!("eaxctl: {err}");
        process::exit(1);
    }
}
