//! Network-stream capture worker.
//!
//! The stream is pulled by a supervised ffmpeg child that decodes to raw
//! s16le mono PCM at the canonical rate on its stdout. A reader thread moves
//! pipe bytes into a bounded channel; the worker converts them to frames. A
//! pipe silent for longer than the configured stall budget, or a child exit,
//! is a fatal fault; the source manager owns reconnect backoff.

use crate::audio::ring::{ClipRing, RingRegistry};
use crate::audio::{AudioFrame, FrameClock, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Grace between asking the decoder to stop and killing it.
const CHILD_GRACE: Duration = Duration::from_millis(500);
/// Pipe read size; small enough to keep stall detection responsive.
const READ_CHUNK: usize = 8192;

/// A decoder child plus the pipe-reader thread feeding us its PCM.
struct Decoder {
    child: Child,
    bytes_rx: mpsc::Receiver<Vec<u8>>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl Decoder {
    fn spawn(source: &str, url: &str) -> Result<Decoder> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-nostdin");
        if url.starts_with("rtsp://") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-i")
            .arg(url)
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg("1")
            .arg("pipe:1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| Error::CaptureFatal {
            source: source.to_string(),
            message: format!("spawning ffmpeg: {e}"),
        })?;
        let mut stdout = child.stdout.take().expect("stdout was piped");

        // The reader thread exits when the pipe closes or the receiver is
        // dropped; either way the channel disconnect tells the worker.
        let (bytes_tx, bytes_rx) = mpsc::sync_channel::<Vec<u8>>(64);
        let reader = std::thread::Builder::new()
            .name(format!("decoder-read-{source}"))
            .spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if bytes_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .expect("spawning decoder reader thread");

        Ok(Decoder { child, bytes_rx, reader: Some(reader) })
    }

    /// Structured stop: close our end of the pipe, give the child a grace
    /// period to exit on the broken pipe, then kill. Always reaps.
    fn stop(mut self) {
        drop(self.bytes_rx); // reader exits, pipe closes
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let deadline = Instant::now() + CHILD_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                _ => break,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Run network-stream capture until shutdown or a fault.
pub fn run_stream_capture(
    source: &str,
    url: &str,
    stall_secs: u64,
    ring_secs: u64,
    registry: &RingRegistry,
    frame_tx: &SyncSender<AudioFrame>,
    shutdown: &Shutdown,
    metrics: &Metrics,
    on_healthy: &dyn Fn(),
) -> Result<()> {
    let stall_budget = Duration::from_secs(stall_secs.max(1));
    let decoder = Decoder::spawn(source, url)?;
    info!(source, url, "decoder started");

    let mut clock = FrameClock::start();
    let ring = Arc::new(ClipRing::new(source, ring_secs, clock.start_wall()));
    registry.register(Arc::clone(&ring));

    let frames_dropped = metrics.counter("capture", "frame-dropped");
    let transient = metrics.counter("capture", "capture-transient");

    let mut pending = Vec::<u8>::with_capacity(READ_CHUNK * 2);
    let mut last_data = Instant::now();
    let mut stall_warned = false;
    let mut healthy_reported = false;

    let result = loop {
        if shutdown.is_triggered() {
            break Ok(());
        }
        match decoder.bytes_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(bytes) => {
                last_data = Instant::now();
                stall_warned = false;
                if !healthy_reported {
                    healthy_reported = true;
                    on_healthy();
                }
                pending.extend_from_slice(&bytes);
                emit_frames(source, &mut pending, &mut clock, &ring, frame_tx, &frames_dropped);
            }
            Err(RecvTimeoutError::Timeout) => {
                let silent = last_data.elapsed();
                if silent > stall_budget {
                    break Err(Error::CaptureFatal {
                        source: source.to_string(),
                        message: format!("decoder pipe silent for {silent:?}"),
                    });
                }
                if silent > Duration::from_secs(2) && !stall_warned {
                    stall_warned = true;
                    transient.fetch_add(1, Ordering::Relaxed);
                    debug!(source, "decoder pipe quiet, waiting");
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Err(Error::CaptureFatal {
                    source: source.to_string(),
                    message: "stream closed by remote end".to_string(),
                });
            }
        }
    };

    registry.unregister(source);
    decoder.stop();
    if let Err(e) = &result {
        warn!(source, error = %e, "stream capture exiting");
    }
    result
}

/// Convert buffered s16le bytes into canonical frames; leftover bytes stay
/// in `pending` until the next read completes them.
fn emit_frames(
    source: &str,
    pending: &mut Vec<u8>,
    clock: &mut FrameClock,
    ring: &ClipRing,
    frame_tx: &SyncSender<AudioFrame>,
    frames_dropped: &crate::metrics::Counter,
) {
    const FRAME_BYTES: usize = FRAME_SAMPLES * 2;
    while pending.len() >= FRAME_BYTES {
        let raw: Vec<u8> = pending.drain(..FRAME_BYTES).collect();
        let ints: Vec<i16> = bytemuck::pod_collect_to_vec(&raw);
        let samples: Vec<f32> = ints.iter().map(|&v| f32::from(v) / 32_768.0).collect();
        let frame = clock.stamp(source, samples);
        ring.push(&frame.samples);
        if frame_tx.try_send(frame).is_err() {
            frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
