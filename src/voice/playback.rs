//! Gapless playback scheduling on an output clock.
//!
//! Every decoded frame is scheduled at `max(cursor, now)` and the cursor is
//! advanced by the frame's duration, so frames arriving in bursts queue up
//! back-to-back and frames arriving late simply start at "now". In-flight
//! buffers are tracked by id until the output reports completion or
//! [`PlaybackScheduler::stop_all`] cancels them.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::codec::pcm16_to_float;
use crate::error::DeviceError;

/// Monotonic handle for a scheduled buffer.
pub type BufferId = u64;

/// Decoded, normalized audio ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    /// Interleaved samples in `[-1, 1]`.
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackBuffer {
    /// Normalize interleaved PCM16. A trailing partial frame is dropped.
    pub fn from_pcm16(samples: &[i16], sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() - samples.len() % usize::from(channels);
        Self {
            samples: samples[..whole].iter().copied().map(pcm16_to_float).collect(),
            sample_rate,
            channels,
        }
    }

    /// Sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// One-shot notifier the output fires when a buffer finishes on its own.
#[derive(Debug)]
pub struct PlaybackDone {
    id: BufferId,
    tx: mpsc::UnboundedSender<BufferId>,
}

impl PlaybackDone {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn finished(self) {
        let _ = self.tx.send(self.id);
    }
}

/// Platform audio output with a monotonic clock.
pub trait AudioOutput: Send + Sync {
    /// Current position of the output clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to start at `start_at` on the output clock. The
    /// output calls `done.finished()` when playback ends naturally.
    fn play_at(
        &self,
        buffer: PlaybackBuffer,
        start_at: f64,
        done: PlaybackDone,
    ) -> Result<(), DeviceError>;

    /// Halt a buffer immediately, whether it is playing or still pending.
    fn stop(&self, id: BufferId);
}

/// Where and for how long a buffer was scheduled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Schedules decoded frames back-to-back on an [`AudioOutput`].
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    cursor: f64,
    next_id: BufferId,
    in_flight: BTreeMap<BufferId, ScheduledPlayback>,
    done_tx: mpsc::UnboundedSender<BufferId>,
}

impl PlaybackScheduler {
    /// Create a scheduler and the receiver on which completed buffer ids
    /// arrive. Feed those back through [`Self::finished`].
    pub fn new(output: Arc<dyn AudioOutput>) -> (Self, mpsc::UnboundedReceiver<BufferId>) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        (
            Self {
                output,
                cursor: 0.0,
                next_id: 0,
                in_flight: BTreeMap::new(),
                done_tx,
            },
            done_rx,
        )
    }

    /// Decode-side entry point: normalize `samples` and schedule them.
    ///
    /// Returns `Ok(None)` for an empty frame.
    pub fn enqueue(
        &mut self,
        samples: &[i16],
        sample_rate: u32,
        channels: u16,
    ) -> Result<Option<ScheduledPlayback>, DeviceError> {
        let buffer = PlaybackBuffer::from_pcm16(samples, sample_rate, channels);
        if buffer.frames() == 0 || sample_rate == 0 {
            return Ok(None);
        }
        self.schedule(buffer).map(Some)
    }

    /// Schedule an already normalized buffer.
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> Result<ScheduledPlayback, DeviceError> {
        let duration = buffer.duration();
        let start = self.cursor.max(self.output.current_time());
        let id = self.next_id;
        self.next_id += 1;

        self.output.play_at(
            buffer,
            start,
            PlaybackDone {
                id,
                tx: self.done_tx.clone(),
            },
        )?;

        self.cursor = start + duration;
        let scheduled = ScheduledPlayback {
            id,
            start,
            duration,
        };
        self.in_flight.insert(id, scheduled);

        tracing::trace!(
            id,
            start,
            duration,
            in_flight = self.in_flight.len(),
            "Scheduled playback buffer"
        );
        Ok(scheduled)
    }

    /// A buffer finished naturally. Returns `false` if it was already gone
    /// (e.g. stopped by [`Self::stop_all`]).
    pub fn finished(&mut self, id: BufferId) -> bool {
        self.in_flight.remove(&id).is_some()
    }

    /// Halt every in-flight buffer and reset the cursor to the clock.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for id in self.in_flight.keys() {
            self.output.stop(*id);
        }
        self.in_flight.clear();
        self.cursor = self.output.current_time();
        if stopped > 0 {
            tracing::debug!(stopped, cursor = self.cursor, "Stopped all playback");
        }
        stopped
    }

    /// Raw cursor: end of the last scheduled buffer (or the clock at the
    /// last reset).
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Earliest start time a new buffer would get right now.
    pub fn next_start_time(&self) -> f64 {
        self.cursor.max(self.output.current_time())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: BufferId) -> bool {
        self.in_flight.contains_key(&id)
    }
}
