//! Local-device capture worker.
//!
//! Opens the host audio subsystem via cpal, matching the configured device by
//! name fragment and falling back to the system default when the match
//! disappears. The stream callback is real-time: it only converts samples and
//! pushes into a lock-free ring, never allocating or blocking. A worker
//! thread drains that ring, converts to canonical format, timestamps frames,
//! and feeds the clip ring plus the dispatcher channel.

use crate::audio::resampler::CanonicalResampler;
use crate::audio::ring::{ClipRing, RingRegistry};
use crate::audio::{AudioFrame, FrameClock, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Raw ring between the cpal callback and the worker thread: one second.
const RAW_RING_SECS: usize = 1;
/// No samples for this long means the device went away.
const DEVICE_STALL: Duration = Duration::from_secs(10);

/// Pick an input device by case-insensitive name fragment.
///
/// An empty fragment selects the system default. A fragment with no match
/// also falls back to the default (logged), so a renamed or unplugged device
/// degrades instead of failing hard.
pub fn select_device(host: &cpal::Host, fragment: &str) -> Option<Device> {
    if !fragment.is_empty() {
        let needle = fragment.to_lowercase();
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name() {
                    if name.to_lowercase().contains(&needle) {
                        return Some(device);
                    }
                }
            }
        }
        warn!(device = fragment, "no input device matches, falling back to default");
    }
    host.default_input_device()
}

/// Negotiate the closest supported stream configuration.
///
/// Prefers the canonical rate and mono; otherwise takes the device default
/// and lets the resampler bridge the difference.
fn negotiate_config(device: &Device) -> anyhow::Result<(StreamConfig, SampleFormat)> {
    use anyhow::Context;
    if let Ok(ranges) = device.supported_input_configs() {
        let mut candidates: Vec<_> = ranges.collect();
        // Fewest channels first; downmix costs more than it helps.
        candidates.sort_by_key(|r| r.channels());
        for range in candidates {
            if range.min_sample_rate().0 <= SAMPLE_RATE && SAMPLE_RATE <= range.max_sample_rate().0
            {
                let config = range.with_sample_rate(cpal::SampleRate(SAMPLE_RATE));
                return Ok((config.config(), config.sample_format()));
            }
        }
    }
    let default = device.default_input_config().context("querying default input config")?;
    Ok((default.config(), default.sample_format()))
}

/// Run capture until shutdown or a fatal device fault.
///
/// Returns Ok on cancellation; CaptureFatal when the device cannot be opened
/// or stops delivering samples. Transient underruns are ridden out in place.
pub fn run_device_capture(
    source: &str,
    name_fragment: &str,
    ring_secs: u64,
    registry: &RingRegistry,
    frame_tx: &SyncSender<AudioFrame>,
    shutdown: &Shutdown,
    metrics: &Metrics,
    on_healthy: &dyn Fn(),
) -> Result<()> {
    let fatal = |message: String| Error::CaptureFatal { source: source.to_string(), message };

    let host = cpal::default_host();
    let device = select_device(&host, name_fragment)
        .ok_or_else(|| fatal("no input device available".into()))?;
    let device_name = device.name().unwrap_or_else(|_| "<unnamed>".into());
    let (config, sample_format) =
        negotiate_config(&device).map_err(|e| fatal(format!("{e:#}")))?;

    info!(
        source,
        device = %device_name,
        rate = config.sample_rate.0,
        channels = config.channels,
        format = ?sample_format,
        "opening input device"
    );

    let mut resampler = CanonicalResampler::new(config.sample_rate.0, config.channels as usize)
        .map_err(|e| fatal(format!("{e:#}")))?;

    let raw_capacity = config.sample_rate.0 as usize * config.channels as usize * RAW_RING_SECS;
    let (producer, mut consumer) = HeapRb::<f32>::new(raw_capacity).split();

    let overrun = metrics.counter("capture", "callback-overrun");
    let stream_error = Arc::new(AtomicBool::new(false));
    let stream = build_input_stream(
        &device,
        &config,
        sample_format,
        producer,
        Arc::clone(&overrun),
        Arc::clone(&stream_error),
    )
    .map_err(|e| fatal(format!("{e:#}")))?;
    stream.play().map_err(|e| fatal(format!("starting stream: {e}")))?;

    let mut clock = FrameClock::start();
    let ring = Arc::new(ClipRing::new(source, ring_secs, clock.start_wall()));
    registry.register(Arc::clone(&ring));

    let frames_dropped = metrics.counter("capture", "frame-dropped");
    let transient = metrics.counter("capture", "capture-transient");
    let mut scratch = vec![0.0f32; FRAME_SAMPLES * 4];
    let mut last_data = Instant::now();
    let mut stall_warned = false;
    let mut healthy_reported = false;

    let result = loop {
        if shutdown.is_triggered() {
            break Ok(());
        }
        if stream_error.load(Ordering::Relaxed) {
            break Err(fatal("device stream reported an error".into()));
        }

        let n = consumer.pop_slice(&mut scratch);
        if n == 0 {
            if last_data.elapsed() > DEVICE_STALL {
                break Err(fatal(format!("no samples from {device_name:?} for {DEVICE_STALL:?}")));
            }
            if last_data.elapsed() > Duration::from_secs(1) && !stall_warned {
                stall_warned = true;
                transient.fetch_add(1, Ordering::Relaxed);
                warn!(source, "device delivering no samples, waiting");
            }
            shutdown.wait_timeout(Duration::from_millis(5));
            continue;
        }
        last_data = Instant::now();
        stall_warned = false;
        if !healthy_reported {
            healthy_reported = true;
            on_healthy();
        }

        let frames = match resampler.push_interleaved(&scratch[..n]) {
            Ok(frames) => frames,
            Err(e) => break Err(fatal(format!("resampler: {e:#}"))),
        };
        for samples in frames {
            let frame = clock.stamp(source, samples);
            ring.push(&frame.samples);
            // Dispatch must never block capture; a stalled dispatcher loses
            // the frame and the metric records it.
            if frame_tx.try_send(frame).is_err() {
                frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    registry.unregister(source);
    drop(stream);
    result
}

/// Build the cpal input stream for the negotiated sample format. The
/// callback converts to f32 and pushes; overruns are counted, never waited.
fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    producer: ringbuf::HeapProd<f32>,
    overrun: Arc<AtomicU64>,
    stream_error: Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream> {
    match sample_format {
        SampleFormat::F32 => typed_stream::<f32>(device, config, producer, overrun, stream_error),
        SampleFormat::I16 => typed_stream::<i16>(device, config, producer, overrun, stream_error),
        SampleFormat::U16 => typed_stream::<u16>(device, config, producer, overrun, stream_error),
        other => anyhow::bail!("unsupported sample format {other:?}"),
    }
}

fn typed_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: ringbuf::HeapProd<f32>,
    overrun: Arc<AtomicU64>,
    stream_error: Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    use anyhow::Context;
    let err_flag = Arc::clone(&stream_error);
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut lost = 0u64;
                for &s in data {
                    let v = <f32 as cpal::FromSample<T>>::from_sample_(s);
                    if producer.try_push(v).is_err() {
                        lost += 1;
                    }
                }
                if lost > 0 {
                    overrun.fetch_add(lost, Ordering::Relaxed);
                }
            },
            move |err| {
                tracing::error!(error = %err, "input stream error");
                err_flag.store(true, Ordering::Relaxed);
            },
            None,
        )
        .context("building input stream")?;
    Ok(stream)
}
