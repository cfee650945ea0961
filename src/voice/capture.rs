//! Microphone capture: device callback → fixed-size frames → bounded queue.
//!
//! ```text
//! audio thread ──samples──▸ FrameChunker ──try_send──▸ mpsc(queue_frames) ──▸ uplink task
//! ```
//!
//! The device callback never blocks: it chunks samples and `try_send`s whole
//! frames. Encoding and network I/O happen on the consumer side. When the
//! queue is full the newest frame is dropped and counted.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::CaptureConfig;
use crate::error::DeviceError;

/// Callback a [`MicStream`] invokes with each block of mono float samples.
///
/// Called on the platform audio thread; implementations must not block.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Requested capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl CaptureFormat {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }
}

/// Platform microphone access.
pub trait Microphone: Send + Sync {
    /// Acquire the input device. Fails if permission is denied or no
    /// device exists. The hardware is held until the stream is dropped.
    fn acquire(&self, format: CaptureFormat) -> Result<Box<dyn MicStream>, DeviceError>;
}

/// An acquired microphone stream.
pub trait MicStream: Send {
    /// Begin delivering samples to `sink`.
    fn start(&mut self, sink: SampleSink) -> Result<(), DeviceError>;

    /// Disconnect the input. No further `sink` calls may start after this
    /// returns. Must be idempotent.
    fn stop(&mut self);
}

/// One captured frame of mono float samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

// ── Frame chunking ────────────────────────────────────────────────

/// Re-blocks arbitrarily sized device buffers into fixed-size frames.
#[derive(Debug)]
pub struct FrameChunker {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples and hand every completed frame to `emit`.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        while !samples.is_empty() {
            let room = self.frame_samples - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.pending.len() == self.frame_samples {
                let frame = std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_samples),
                );
                emit(frame);
            }
        }
    }

    /// Samples waiting for a full frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ── Pipeline ──────────────────────────────────────────────────────

struct CaptureGate {
    chunker: FrameChunker,
    frame_tx: mpsc::Sender<AudioFrame>,
    sample_rate: u32,
}

/// Counters shared between the audio thread and the owner.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_queued: AtomicU64,
    pub frames_dropped: AtomicU64,
}

/// Running capture graph: owns the mic stream and the producer side of the
/// frame queue.
pub struct CapturePipeline {
    stream: Option<Box<dyn MicStream>>,
    gate: Arc<Mutex<Option<CaptureGate>>>,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    /// Start capturing from `stream`, queueing fixed-size frames on a bounded
    /// channel. Returns the pipeline and the consumer end of the queue.
    pub fn start(
        mut stream: Box<dyn MicStream>,
        config: &CaptureConfig,
    ) -> Result<(Self, mpsc::Receiver<AudioFrame>), DeviceError> {
        let (frame_tx, frame_rx) = mpsc::channel(config.queue_frames.max(1));
        let gate = Arc::new(Mutex::new(Some(CaptureGate {
            chunker: FrameChunker::new(config.frame_samples),
            frame_tx,
            sample_rate: config.sample_rate,
        })));
        let stats = Arc::new(CaptureStats::default());

        let sink_gate = Arc::clone(&gate);
        let sink_stats = Arc::clone(&stats);
        stream.start(Box::new(move |samples: &[f32]| {
            let mut guard = sink_gate.lock();
            let Some(gate) = guard.as_mut() else {
                return;
            };
            let CaptureGate {
                chunker,
                frame_tx,
                sample_rate,
            } = gate;
            chunker.push(samples, |frame| {
                let frame = AudioFrame {
                    samples: frame,
                    sample_rate: *sample_rate,
                };
                match frame_tx.try_send(frame) {
                    Ok(()) => {
                        sink_stats.frames_queued.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let dropped = sink_stats.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 || dropped.is_multiple_of(50) {
                            tracing::warn!(dropped, "Capture queue full, dropping frame");
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            });
        }))?;

        tracing::debug!(
            sample_rate = config.sample_rate,
            frame_samples = config.frame_samples,
            queue_frames = config.queue_frames,
            "Audio capture started"
        );

        Ok((
            Self {
                stream: Some(stream),
                gate,
                stats,
            },
            frame_rx,
        ))
    }

    /// Stop capture. After this returns no further frames are queued.
    /// Idempotent.
    pub fn stop(&mut self) {
        // Closing the gate under its lock serializes with any in-flight callback.
        let was_open = self.gate.lock().take().is_some();
        if let Some(stream) = self.stream.as_mut() {
            stream.stop();
        }
        if was_open {
            tracing::debug!(
                queued = self.stats.frames_queued.load(Ordering::Relaxed),
                dropped = self.stats.frames_dropped.load(Ordering::Relaxed),
                "Audio capture stopped"
            );
        }
    }

    /// Stop capture and release the microphone.
    pub fn release(mut self) {
        self.stop();
        self.stream.take();
    }

    pub fn is_running(&self) -> bool {
        self.gate.lock().is_some()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
