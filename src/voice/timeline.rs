//! Sample-clock mixer behind the [`AudioOutput`] seam.
//!
//! The clock is the number of frames rendered so far. A device callback
//! calls [`TimelineOutput::render`] with its output block; each scheduled
//! buffer contributes samples from its start frame onward, and buffers whose
//! last frame has been rendered are reported finished.

use parking_lot::Mutex;

use super::playback::{AudioOutput, BufferId, PlaybackBuffer, PlaybackDone};
use crate::error::DeviceError;

struct Voice {
    id: BufferId,
    start_frame: u64,
    buffer: PlaybackBuffer,
    done: PlaybackDone,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

struct Timeline {
    clock_frames: u64,
    voices: Vec<Voice>,
}

pub struct TimelineOutput {
    sample_rate: u32,
    channels: u16,
    inner: Mutex<Timeline>,
}

impl TimelineOutput {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            inner: Mutex::new(Timeline {
                clock_frames: 0,
                voices: Vec::new(),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Buffers scheduled and not yet finished or stopped.
    pub fn active_voices(&self) -> usize {
        self.inner.lock().voices.len()
    }

    /// Mix the next block of interleaved output and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let out_channels = usize::from(self.channels);
        let frames = (out.len() / out_channels) as u64;

        let finished = {
            let mut timeline = self.inner.lock();
            let block_start = timeline.clock_frames;
            let block_end = block_start + frames;

            for voice in &timeline.voices {
                let from = voice.start_frame.max(block_start);
                let to = voice.end_frame().min(block_end);
                let src_channels = usize::from(voice.buffer.channels.max(1));
                for t in from..to {
                    let src = (t - voice.start_frame) as usize * src_channels;
                    let dst = (t - block_start) as usize * out_channels;
                    for ch in 0..out_channels {
                        out[dst + ch] += voice.buffer.samples[src + ch % src_channels];
                    }
                }
            }

            timeline.clock_frames = block_end;
            let (done, pending): (Vec<Voice>, Vec<Voice>) = std::mem::take(&mut timeline.voices)
                .into_iter()
                .partition(|voice| voice.end_frame() <= block_end);
            timeline.voices = pending;
            done
        };

        for voice in finished {
            voice.done.finished();
        }
    }
}

impl AudioOutput for TimelineOutput {
    fn current_time(&self) -> f64 {
        self.inner.lock().clock_frames as f64 / f64::from(self.sample_rate)
    }

    fn play_at(
        &self,
        buffer: PlaybackBuffer,
        start_at: f64,
        done: PlaybackDone,
    ) -> Result<(), DeviceError> {
        if buffer.sample_rate != self.sample_rate {
            return Err(DeviceError::UnsupportedFormat(format!(
                "buffer rate {} Hz does not match output rate {} Hz",
                buffer.sample_rate, self.sample_rate
            )));
        }
        let start_frame = (start_at.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        let mut timeline = self.inner.lock();
        let start_frame = start_frame.max(timeline.clock_frames);
        timeline.voices.push(Voice {
            id: done.id(),
            start_frame,
            buffer,
            done,
        });
        Ok(())
    }

    fn stop(&self, id: BufferId) {
        self.inner.lock().voices.retain(|voice| voice.id != id);
    }
}
