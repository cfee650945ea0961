//! cpal-backed microphone and speaker.
//!
//! cpal streams are `!Send` on some hosts, so each device lives on its own
//! thread and is driven through a command channel. Both sides prefer a
//! config at the requested rate and fall back to the device default: the
//! microphone then downmixes and resamples to the capture rate, and the
//! speaker resamples each buffer to the device rate before mixing.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::capture::{CaptureFormat, MicStream, Microphone, SampleSink};
use super::playback::{AudioOutput, BufferId, PlaybackBuffer, PlaybackDone};
use super::resample::{resample_interleaved, MonoConverter};
use super::timeline::TimelineOutput;
use crate::error::DeviceError;

enum Command {
    Play(mpsc::SyncSender<Result<(), DeviceError>>),
    Pause,
    Shutdown,
}

fn stream_error(err: impl std::fmt::Display) -> DeviceError {
    DeviceError::Stream(err.to_string())
}

/// Pick a supported config at `rate`, preferring the requested channel count
/// and float samples.
fn pick_config(
    ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    rate: u32,
    channels: u16,
) -> Option<cpal::SupportedStreamConfig> {
    let format_rank = |format: cpal::SampleFormat| match format {
        cpal::SampleFormat::F32 => Some(0),
        cpal::SampleFormat::I16 => Some(1),
        cpal::SampleFormat::U16 => Some(2),
        _ => None,
    };
    ranges
        .filter(|range| range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0)
        .filter_map(|range| {
            let rank = format_rank(range.sample_format())?;
            Some(((range.channels() != channels, rank), range))
        })
        .min_by_key(|(key, _)| *key)
        .map(|(_, range)| range.with_sample_rate(cpal::SampleRate(rate)))
}

/// Run `open` on a fresh thread, keep the stream alive there and serve
/// commands until shutdown. The value paired with the stream is handed
/// back to the caller.
fn spawn_device_thread<T, F>(
    name: &str,
    open: F,
) -> Result<(mpsc::Sender<Command>, JoinHandle<()>, T), DeviceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<(cpal::Stream, T), DeviceError> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let (command_tx, command_rx) = mpsc::channel::<Command>();

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match open() {
                Ok((stream, value)) => {
                    let _ = ready_tx.send(Ok(value));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while let Ok(command) = command_rx.recv() {
                match command {
                    Command::Play(reply) => {
                        let _ = reply.send(stream.play().map_err(stream_error));
                    }
                    Command::Pause => {
                        if let Err(e) = stream.pause() {
                            tracing::debug!(error = %e, "Audio stream pause failed");
                        }
                    }
                    Command::Shutdown => break,
                }
            }
        })
        .map_err(stream_error)?;

    match ready_rx.recv() {
        Ok(Ok(value)) => Ok((command_tx, thread, value)),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(DeviceError::Stream("audio thread exited during setup".into()))
        }
    }
}

fn play(commands: &mpsc::Sender<Command>) -> Result<(), DeviceError> {
    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
    commands
        .send(Command::Play(reply_tx))
        .map_err(|_| DeviceError::Stream("audio thread gone".into()))?;
    reply_rx
        .recv()
        .map_err(|_| DeviceError::Stream("audio thread gone".into()))?
}

// ── Microphone ────────────────────────────────────────────────────

/// Default input device of the default host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl Microphone for CpalMicrophone {
    fn acquire(&self, format: CaptureFormat) -> Result<Box<dyn MicStream>, DeviceError> {
        let sink: Arc<Mutex<Option<SampleSink>>> = Arc::new(Mutex::new(None));
        let callback_sink = Arc::clone(&sink);

        let (commands, thread, ()) = spawn_device_thread("travx-mic", move || {
            open_input(format, callback_sink).map(|stream| (stream, ()))
        })?;

        Ok(Box::new(CpalMicStream {
            sink,
            commands,
            thread: Some(thread),
        }))
    }
}

fn open_input(
    format: CaptureFormat,
    sink: Arc<Mutex<Option<SampleSink>>>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(DeviceError::NotFound("input"))?;
    let ranges = device.supported_input_configs().map_err(stream_error)?;
    let config = match pick_config(ranges, format.sample_rate, format.channels) {
        Some(config) => config,
        None => device.default_input_config().map_err(stream_error)?,
    };
    let device_rate = config.sample_rate().0;
    let err_fn = |err: cpal::StreamError| tracing::error!(error = %err, "Microphone stream error");

    tracing::info!(
        device = %device.name().unwrap_or_default(),
        device_rate,
        capture_rate = format.sample_rate,
        channels = config.channels(),
        sample_format = ?config.sample_format(),
        "Opening microphone"
    );

    macro_rules! build_stream {
        ($sample_type:ty, $converter:expr) => {{
            let mut raw: Vec<f32> = Vec::new();
            let mut mono = MonoConverter::new(device_rate, config.channels(), format.sample_rate);
            device.build_input_stream(
                &config.config(),
                move |data: &[$sample_type], _: &cpal::InputCallbackInfo| {
                    let converter = $converter;
                    raw.clear();
                    raw.extend(data.iter().map(|&s| converter(s)));
                    let block = mono.convert(&raw);
                    if block.is_empty() {
                        return;
                    }
                    if let Some(sink) = sink.lock().as_mut() {
                        sink(block);
                    }
                },
                err_fn,
                None,
            )
        }};
    }

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream!(f32, |s: f32| s),
        cpal::SampleFormat::I16 => build_stream!(i16, |s: i16| f32::from(s) / 32768.0),
        cpal::SampleFormat::U16 => {
            build_stream!(u16, |s: u16| (f32::from(s) - 32768.0) / 32768.0)
        }
        other => {
            return Err(DeviceError::UnsupportedFormat(format!("{other:?}")));
        }
    };
    stream.map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NotFound("input"),
        other => stream_error(other),
    })
}

struct CpalMicStream {
    sink: Arc<Mutex<Option<SampleSink>>>,
    commands: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl MicStream for CpalMicStream {
    fn start(&mut self, sink: SampleSink) -> Result<(), DeviceError> {
        *self.sink.lock() = Some(sink);
        play(&self.commands)
    }

    fn stop(&mut self) {
        // The callback holds this lock while it runs.
        self.sink.lock().take();
        let _ = self.commands.send(Command::Pause);
    }
}

impl Drop for CpalMicStream {
    fn drop(&mut self) {
        self.stop();
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::debug!("Microphone released");
    }
}

// ── Speaker ───────────────────────────────────────────────────────

/// Default output device rendering a [`TimelineOutput`].
pub struct CpalSpeaker {
    timeline: Arc<TimelineOutput>,
    commands: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSpeaker {
    /// Open the default output and start it, preferring `sample_rate` and
    /// `channels` when the device offers them.
    pub fn open(sample_rate: u32, channels: u16) -> Result<Self, DeviceError> {
        let (commands, thread, timeline) = spawn_device_thread("travx-speaker", move || {
            open_output(sample_rate, channels)
        })?;
        play(&commands)?;
        Ok(Self {
            timeline,
            commands,
            thread: Some(thread),
        })
    }

    pub fn timeline(&self) -> &Arc<TimelineOutput> {
        &self.timeline
    }
}

fn open_output(
    sample_rate: u32,
    channels: u16,
) -> Result<(cpal::Stream, Arc<TimelineOutput>), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NotFound("output"))?;
    let ranges = device.supported_output_configs().map_err(stream_error)?;
    let config = match pick_config(ranges, sample_rate, channels) {
        Some(config) => config,
        None => device.default_output_config().map_err(stream_error)?,
    };
    // Mono buffers fan out to every device channel when mixed.
    let timeline = Arc::new(TimelineOutput::new(config.sample_rate().0, config.channels()));
    let render = Arc::clone(&timeline);
    let err_fn = |err: cpal::StreamError| tracing::error!(error = %err, "Speaker stream error");

    tracing::info!(
        device = %device.name().unwrap_or_default(),
        device_rate = config.sample_rate().0,
        channels = config.channels(),
        sample_format = ?config.sample_format(),
        "Opening speaker"
    );

    macro_rules! build_stream {
        ($sample_type:ty, $converter:expr) => {{
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config.config(),
                move |data: &mut [$sample_type], _: &cpal::OutputCallbackInfo| {
                    let converter = $converter;
                    scratch.resize(data.len(), 0.0);
                    render.render(&mut scratch);
                    for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                        *out = converter(s.clamp(-1.0, 1.0));
                    }
                },
                err_fn,
                None,
            )
        }};
    }

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream!(f32, |s: f32| s),
        cpal::SampleFormat::I16 => build_stream!(i16, super::codec::float_to_pcm16),
        cpal::SampleFormat::U16 => build_stream!(u16, |s: f32| {
            (i32::from(super::codec::float_to_pcm16(s)) + 32768) as u16
        }),
        other => {
            return Err(DeviceError::UnsupportedFormat(format!("{other:?}")));
        }
    };
    let stream = stream.map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NotFound("output"),
        other => stream_error(other),
    })?;
    Ok((stream, timeline))
}

impl AudioOutput for CpalSpeaker {
    fn current_time(&self) -> f64 {
        self.timeline.current_time()
    }

    fn play_at(
        &self,
        buffer: PlaybackBuffer,
        start_at: f64,
        done: PlaybackDone,
    ) -> Result<(), DeviceError> {
        let device_rate = self.timeline.sample_rate();
        let buffer = if buffer.sample_rate == device_rate {
            buffer
        } else {
            PlaybackBuffer {
                samples: resample_interleaved(
                    &buffer.samples,
                    usize::from(buffer.channels),
                    buffer.sample_rate,
                    device_rate,
                )
                .into(),
                sample_rate: device_rate,
                channels: buffer.channels,
            }
        };
        self.timeline.play_at(buffer, start_at, done)
    }

    fn stop(&self, id: BufferId) {
        self.timeline.stop(id);
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
