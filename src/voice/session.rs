//! Voice session controller.
//!
//! ```text
//! Disconnected ──connect──▸ Connecting ──open──▸ Connected
//!      ▴                        │                    │
//!      └──── mic denied / ──────┘                    │
//!            open failed                             │
//!      └──────── disconnect / remote close ──────────┘
//! ```
//!
//! One session at a time. Each open session runs two tasks:
//!
//! - **uplink**: capture queue → `encode_frame` → `SessionTransport::send`
//! - **downlink**: inbound events → `decode_frame` → `PlaybackScheduler::enqueue`,
//!   plus playback completion bookkeeping
//!
//! `disconnect` is synchronous and idempotent. Status callbacks are never
//! invoked while the session lock is held, so a callback may call
//! `disconnect` itself. Statuses of one session are delivered in order and
//! nothing follows its `Disconnected`.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::{AudioFrame, CaptureFormat, CapturePipeline, MicStream, Microphone};
use super::codec::{decode_frame, encode_frame, WireFrame};
use super::gemini_live::GeminiLiveConnector;
use super::playback::{AudioOutput, BufferId, PlaybackScheduler};
use super::transport::{LiveConnector, SessionSetup, SessionTransport, TransportState};
use super::VoiceEvent;
use crate::config::VoiceConfig;
use crate::error::{ConnectError, TransportError};

/// Coarse status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    MicError,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::MicError => "Error Accessing Mic",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StatusCallback = Arc<dyn Fn(SessionStatus) + Send + Sync>;

/// Serializes the statuses of one session. Once `Disconnected` is out,
/// anything later is dropped.
struct StatusReporter {
    callback: StatusCallback,
    // Reentrant: a callback may disconnect from inside a status call.
    ended: ReentrantMutex<Cell<bool>>,
}

impl StatusReporter {
    fn new(callback: StatusCallback) -> Arc<Self> {
        Arc::new(Self {
            callback,
            ended: ReentrantMutex::new(Cell::new(false)),
        })
    }

    fn report(&self, status: SessionStatus) {
        let ended = self.ended.lock();
        if ended.get() {
            tracing::debug!(status = %status, "Session already ended, status dropped");
            return;
        }
        if status == SessionStatus::Disconnected {
            ended.set(true);
        }
        (self.callback)(status);
    }
}

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

// ── Session slot ──────────────────────────────────────────────────

struct PendingSession {
    transport: Arc<SessionTransport>,
    stream: Option<Box<dyn MicStream>>,
    status: Arc<StatusReporter>,
}

struct ActiveSession {
    transport: Arc<SessionTransport>,
    capture: CapturePipeline,
    status: Arc<StatusReporter>,
    uplink: JoinHandle<()>,
    downlink: JoinHandle<()>,
}

impl ActiveSession {
    /// Stop capture, silence playback, close the link and release the mic.
    fn shutdown(self, playback: &Mutex<PlaybackScheduler>) {
        let Self {
            transport,
            mut capture,
            status,
            uplink,
            downlink,
        } = self;

        capture.stop();
        uplink.abort();
        // Close before the flush: the downlink schedules audio only while
        // the transport is open, checked under the playback lock.
        let closed = transport.close();
        playback.lock().stop_all();
        downlink.abort();
        capture.release();
        if closed {
            status.report(SessionStatus::Disconnected);
        }
        tracing::info!(session_id = %transport.session_id(), "Voice session torn down");
    }
}

enum Slot {
    Idle,
    Connecting(PendingSession),
    Connected(ActiveSession),
}

impl Slot {
    fn transport(&self) -> Option<&Arc<SessionTransport>> {
        match self {
            Self::Idle => None,
            Self::Connecting(pending) => Some(&pending.transport),
            Self::Connected(active) => Some(&active.transport),
        }
    }

    fn holds(&self, transport: &Arc<SessionTransport>) -> bool {
        self.transport().is_some_and(|t| Arc::ptr_eq(t, transport))
    }
}

// ── Controller ────────────────────────────────────────────────────

/// Full-duplex voice session with a live model.
pub struct VoiceAssistant {
    config: VoiceConfig,
    setup: SessionSetup,
    microphone: Arc<dyn Microphone>,
    connector: Arc<dyn LiveConnector>,
    playback: Arc<Mutex<PlaybackScheduler>>,
    completions: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BufferId>>>,
    slot: Arc<Mutex<Slot>>,
}

impl VoiceAssistant {
    pub fn new(
        config: VoiceConfig,
        microphone: Arc<dyn Microphone>,
        output: Arc<dyn AudioOutput>,
        connector: Arc<dyn LiveConnector>,
    ) -> Self {
        let (scheduler, completions) = PlaybackScheduler::new(output);
        Self {
            setup: SessionSetup::from_config(&config),
            config,
            microphone,
            connector,
            playback: Arc::new(Mutex::new(scheduler)),
            completions: Arc::new(tokio::sync::Mutex::new(completions)),
            slot: Arc::new(Mutex::new(Slot::Idle)),
        }
    }

    /// Controller talking to Gemini Live.
    pub fn with_gemini(
        config: VoiceConfig,
        microphone: Arc<dyn Microphone>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let connector = Arc::new(GeminiLiveConnector::from_config(&config));
        Self::new(config, microphone, output, connector)
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    /// Open a session: acquire the microphone, open the live connection,
    /// then start streaming both ways.
    ///
    /// Status goes `Connecting...` → `Connected`, or `Connecting...` →
    /// `Error Accessing Mic` / `Disconnected` on failure. If the microphone
    /// fails after the link opened, `Error Accessing Mic` is followed by
    /// `Disconnected`. Later closes are reported as `Disconnected` exactly
    /// once.
    pub async fn connect<F>(&self, on_status: F) -> Result<(), ConnectError>
    where
        F: Fn(SessionStatus) + Send + Sync + 'static,
    {
        let status = StatusReporter::new(Arc::new(on_status));
        let transport = Arc::new(SessionTransport::new(uuid::Uuid::new_v4().to_string()));
        let session_id = transport.session_id().to_string();

        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Idle) {
                return Err(ConnectError::AlreadyActive);
            }
            *slot = Slot::Connecting(PendingSession {
                transport: Arc::clone(&transport),
                stream: None,
                status: Arc::clone(&status),
            });
        }
        tracing::info!(session_id = %session_id, model = %self.setup.model, "Voice session connecting");
        status.report(SessionStatus::Connecting);

        // Mic first: a denied microphone never opens a connection.
        let format = CaptureFormat::mono(self.config.capture.sample_rate);
        let stream = match self.microphone.acquire(format) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Microphone unavailable");
                self.release_slot(&transport);
                status.report(SessionStatus::MicError);
                return Err(e.into());
            }
        };
        {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Connecting(pending) if Arc::ptr_eq(&pending.transport, &transport) => {
                    pending.stream = Some(stream);
                }
                _ => return Err(TransportError::Cancelled.into()),
            }
        }

        let inbound = match transport.open(self.connector.as_ref(), &self.setup).await {
            Ok(inbound) => inbound,
            Err(e) => {
                // Disconnect already tore this session down and reported it.
                if self.release_slot(&transport) {
                    status.report(SessionStatus::Disconnected);
                }
                return Err(e.into());
            }
        };

        let mut slot = self.slot.lock();
        let pending = match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Connecting(pending) if Arc::ptr_eq(&pending.transport, &transport) => pending,
            other => {
                *slot = other;
                return Err(TransportError::Cancelled.into());
            }
        };
        let PendingSession {
            transport,
            stream,
            status,
        } = pending;

        let started = stream
            .ok_or_else(|| crate::error::DeviceError::Stream("microphone stream missing".into()))
            .and_then(|stream| CapturePipeline::start(stream, &self.config.capture));
        let (capture, frames) = match started {
            Ok(started) => started,
            Err(e) => {
                drop(slot);
                tracing::error!(session_id = %session_id, error = %e, "Audio capture failed to start");
                let closed = transport.close();
                status.report(SessionStatus::MicError);
                if closed {
                    status.report(SessionStatus::Disconnected);
                }
                return Err(e.into());
            }
        };

        let uplink = tokio::spawn(uplink(frames, Arc::clone(&transport)));
        let downlink = tokio::spawn(
            Downlink {
                transport: Arc::clone(&transport),
                playback: Arc::clone(&self.playback),
                slot: Arc::clone(&self.slot),
                status: Arc::clone(&status),
                fallback_rate: self.config.playback.sample_rate,
                channels: self.config.playback.channels,
            }
            .run(inbound, Arc::clone(&self.completions)),
        );

        *slot = Slot::Connected(ActiveSession {
            transport,
            capture,
            status: Arc::clone(&status),
            uplink,
            downlink,
        });
        drop(slot);
        tracing::info!(session_id = %session_id, "Voice session streaming");
        // Dropped by the reporter if the session already ended.
        status.report(SessionStatus::Connected);
        Ok(())
    }

    /// Tear the current session down. Safe to call in any state, any number
    /// of times.
    pub fn disconnect(&self) {
        let taken = std::mem::replace(&mut *self.slot.lock(), Slot::Idle);
        match taken {
            Slot::Idle => {
                self.playback.lock().stop_all();
            }
            Slot::Connecting(pending) => {
                let PendingSession {
                    transport,
                    stream,
                    status,
                } = pending;
                drop(stream);
                self.playback.lock().stop_all();
                if transport.close() {
                    status.report(SessionStatus::Disconnected);
                }
                tracing::info!(session_id = %transport.session_id(), "Voice session cancelled while connecting");
            }
            Slot::Connected(active) => active.shutdown(&self.playback),
        }
    }

    pub fn state(&self) -> SessionState {
        match &*self.slot.lock() {
            Slot::Idle => SessionState::Disconnected,
            Slot::Connecting(_) => SessionState::Connecting,
            Slot::Connected(_) => SessionState::Connected,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.slot
            .lock()
            .transport()
            .map(|t| t.session_id().to_string())
    }

    pub fn transport_state(&self) -> Option<TransportState> {
        self.slot.lock().transport().map(|t| t.state())
    }

    /// Buffers scheduled on the output and not yet finished.
    pub fn playback_in_flight(&self) -> usize {
        self.playback.lock().in_flight()
    }

    /// Output-clock time at which the next received frame would start.
    pub fn playback_cursor(&self) -> f64 {
        self.playback.lock().cursor()
    }

    /// Drop a connecting session that failed. Returns `true` if it was still
    /// ours to drop.
    fn release_slot(&self, transport: &Arc<SessionTransport>) -> bool {
        let mut slot = self.slot.lock();
        if !slot.holds(transport) {
            return false;
        }
        // Dropping the pending session releases any acquired mic stream.
        *slot = Slot::Idle;
        true
    }
}

impl Drop for VoiceAssistant {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// Rate carried by [`encode_frame`]'s MIME tag.
const CAPTURE_WIRE_RATE: u32 = 16_000;

fn encode_captured(frame: &AudioFrame) -> WireFrame {
    let mut wire = encode_frame(&frame.samples);
    if frame.sample_rate != CAPTURE_WIRE_RATE {
        wire.mime_type = format!("audio/pcm;rate={}", frame.sample_rate);
    }
    wire
}

async fn uplink(mut frames: mpsc::Receiver<AudioFrame>, transport: Arc<SessionTransport>) {
    while let Some(frame) = frames.recv().await {
        transport.send(encode_captured(&frame));
    }
    tracing::debug!(session_id = %transport.session_id(), "Uplink finished");
}

struct Downlink {
    transport: Arc<SessionTransport>,
    playback: Arc<Mutex<PlaybackScheduler>>,
    slot: Arc<Mutex<Slot>>,
    status: Arc<StatusReporter>,
    fallback_rate: u32,
    channels: u16,
}

impl Downlink {
    async fn run(
        self,
        mut inbound: mpsc::Receiver<VoiceEvent>,
        completions: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BufferId>>>,
    ) {
        let mut completions = completions.lock().await;
        loop {
            tokio::select! {
                event = inbound.recv() => {
                    let event = event.unwrap_or(VoiceEvent::Closed { reason: None });
                    let terminal = event.is_terminal();
                    self.handle(event);
                    if terminal {
                        break;
                    }
                }
                Some(id) = completions.recv() => {
                    self.playback.lock().finished(id);
                }
            }
        }
    }

    fn handle(&self, event: VoiceEvent) {
        let session_id = self.transport.session_id();
        match event {
            VoiceEvent::Audio { frame } => self.play(&frame),
            VoiceEvent::Interrupted => {
                let stopped = self.playback.lock().stop_all();
                tracing::info!(session_id = %session_id, stopped, "Model interrupted, playback flushed");
            }
            VoiceEvent::InputTranscript { text } => {
                tracing::debug!(session_id = %session_id, text = %text, "User transcript");
            }
            VoiceEvent::OutputTranscript { text } => {
                tracing::debug!(session_id = %session_id, text = %text, "Model transcript");
            }
            VoiceEvent::SetupComplete | VoiceEvent::TurnComplete => {
                tracing::debug!(session_id = %session_id, event = ?event, "Live session event");
            }
            VoiceEvent::Error { message } => {
                tracing::warn!(session_id = %session_id, error = %message, "Live session reported an error");
            }
            VoiceEvent::Closed { reason } => {
                tracing::info!(session_id = %session_id, reason = ?reason, "Live session closed");
                if self.transport.remote_closed() {
                    self.status.report(SessionStatus::Disconnected);
                }
                self.tear_down();
            }
            VoiceEvent::Failed { message } => {
                if self.transport.fail(&message) {
                    self.status.report(SessionStatus::Disconnected);
                }
                self.tear_down();
            }
        }
    }

    fn play(&self, frame: &WireFrame) {
        let samples = match decode_frame(&frame.payload) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.transport.session_id(),
                    error = %e,
                    "Dropping undecodable audio frame"
                );
                return;
            }
        };
        let rate = frame.sample_rate().unwrap_or(self.fallback_rate);
        let mut playback = self.playback.lock();
        if self.transport.state() != TransportState::Open {
            tracing::debug!(
                session_id = %self.transport.session_id(),
                "Session closing, audio frame not scheduled"
            );
            return;
        }
        if let Err(e) = playback.enqueue(&samples, rate, self.channels) {
            tracing::warn!(
                session_id = %self.transport.session_id(),
                error = %e,
                "Failed to schedule audio frame"
            );
        }
    }

    /// Release the session after the remote went away, unless `disconnect`
    /// already did.
    fn tear_down(&self) {
        let session = {
            let mut slot = self.slot.lock();
            if !slot.holds(&self.transport) {
                return;
            }
            std::mem::replace(&mut *slot, Slot::Idle)
        };
        match session {
            Slot::Connected(active) => active.shutdown(&self.playback),
            Slot::Connecting(_) | Slot::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::voice::codec::{encode_pcm16, INPUT_AUDIO_MIME, OUTPUT_AUDIO_MIME};
    use crate::voice::testing::{FakeConnector, FakeMicrophone, ManualOutput};
    use crate::voice::transport::OutboundMessage;

    struct Harness {
        assistant: Arc<VoiceAssistant>,
        mic: FakeMicrophone,
        output: Arc<ManualOutput>,
        connector: FakeConnector,
        statuses: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn with(mic: FakeMicrophone, connector: FakeConnector) -> Self {
            let mut config = VoiceConfig::default();
            config.capture.frame_samples = 4;
            let output = ManualOutput::new(1.5);
            let assistant = Arc::new(VoiceAssistant::new(
                config,
                Arc::new(mic.clone()),
                Arc::clone(&output) as Arc<dyn AudioOutput>,
                Arc::new(connector.clone()),
            ));
            Self {
                assistant,
                mic,
                output,
                connector,
                statuses: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn new() -> Self {
            Self::with(FakeMicrophone::new(), FakeConnector::new())
        }

        fn recorder(&self) -> impl Fn(SessionStatus) + Send + Sync + 'static {
            let statuses = Arc::clone(&self.statuses);
            move |status| statuses.lock().push(status.to_string())
        }

        async fn connect(&self) -> Result<(), ConnectError> {
            self.assistant.connect(self.recorder()).await
        }

        fn statuses(&self) -> Vec<String> {
            self.statuses.lock().clone()
        }
    }

    async fn until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for {what}");
    }

    fn reply(seconds: f64) -> VoiceEvent {
        let samples = vec![8192i16; (24_000.0 * seconds) as usize];
        VoiceEvent::Audio {
            frame: encode_pcm16(&samples, OUTPUT_AUDIO_MIME),
        }
    }

    #[test]
    fn status_strings() {
        assert_eq!(SessionStatus::Connecting.to_string(), "Connecting...");
        assert_eq!(SessionStatus::Connected.to_string(), "Connected");
        assert_eq!(SessionStatus::Disconnected.to_string(), "Disconnected");
        assert_eq!(SessionStatus::MicError.to_string(), "Error Accessing Mic");
    }

    #[test]
    fn captured_frames_are_tagged_with_their_rate() {
        let frame = AudioFrame {
            samples: vec![0.0; 4],
            sample_rate: 16_000,
        };
        assert_eq!(encode_captured(&frame).mime_type, INPUT_AUDIO_MIME);

        let frame = AudioFrame {
            samples: vec![0.0; 4],
            sample_rate: 48_000,
        };
        assert_eq!(encode_captured(&frame).mime_type, "audio/pcm;rate=48000");
    }

    #[tokio::test]
    async fn happy_path_streams_both_ways() {
        let h = Harness::new();
        h.connect().await.unwrap();
        assert_eq!(h.statuses(), vec!["Connecting...", "Connected"]);
        assert_eq!(h.assistant.state(), SessionState::Connected);
        assert_eq!(h.assistant.transport_state(), Some(TransportState::Open));

        let mut remote = h.connector.take_remote().unwrap();

        let captured: Vec<Vec<f32>> = vec![
            vec![0.1, 0.2, 0.3, 0.4],
            vec![-0.1, -0.2, -0.3, -0.4],
            vec![0.5, 0.0, -0.5, 0.25],
        ];
        for frame in &captured {
            assert!(h.mic.feed(frame));
        }
        for frame in &captured {
            assert_eq!(
                remote.outbound.recv().await,
                Some(OutboundMessage::Audio(encode_frame(frame)))
            );
        }

        // t0 = max(cursor, now) = 1.5 on the manual clock.
        remote.inbound.send(reply(0.1)).await.unwrap();
        remote.inbound.send(reply(0.2)).await.unwrap();
        until("two scheduled buffers", || h.output.scheduled().len() == 2).await;

        let scheduled = h.output.scheduled();
        assert!((scheduled[0].start - 1.5).abs() < 1e-9);
        assert!((scheduled[0].duration - 0.1).abs() < 1e-9);
        assert!((scheduled[1].start - 1.6).abs() < 1e-9);
        assert_eq!(h.assistant.playback_in_flight(), 2);
        assert_eq!(h.statuses(), vec!["Connecting...", "Connected"]);
    }

    #[tokio::test]
    async fn mic_denied_never_opens_transport() {
        let h = Harness::with(FakeMicrophone::denied(), FakeConnector::new());
        let err = h.connect().await.unwrap_err();
        assert_eq!(err, ConnectError::Device(DeviceError::PermissionDenied));
        assert_eq!(h.statuses(), vec!["Connecting...", "Error Accessing Mic"]);
        assert!(h.connector.setups().is_empty());
        assert_eq!(h.assistant.state(), SessionState::Disconnected);
        assert_eq!(h.assistant.transport_state(), None);
    }

    #[tokio::test]
    async fn open_failure_releases_mic() {
        let h = Harness::with(
            FakeMicrophone::new(),
            FakeConnector::failing(TransportError::SetupTimeout(15)),
        );
        let err = h.connect().await.unwrap_err();
        assert_eq!(err, ConnectError::Transport(TransportError::SetupTimeout(15)));
        assert_eq!(h.statuses(), vec!["Connecting...", "Disconnected"]);
        assert!(!h.mic.is_held());
        assert_eq!(h.assistant.state(), SessionState::Disconnected);

        // A fresh attempt is allowed after a failure.
        let err = h.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Transport(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let h = Harness::new();
        h.assistant.disconnect();
        h.assistant.disconnect();
        assert_eq!(h.assistant.state(), SessionState::Disconnected);

        h.connect().await.unwrap();
        h.assistant.disconnect();
        h.assistant.disconnect();
        assert_eq!(h.statuses(), vec!["Connecting...", "Connected", "Disconnected"]);
        assert!(!h.mic.is_held());
        assert_eq!(h.assistant.playback_in_flight(), 0);
        assert_eq!(h.assistant.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn nothing_sent_after_disconnect() {
        let h = Harness::new();
        h.connect().await.unwrap();
        let mut remote = h.connector.take_remote().unwrap();

        // Queued by the capture callback just before teardown.
        h.mic.feed(&[0.1, 0.2, 0.3, 0.4]);
        h.assistant.disconnect();
        h.mic.feed_late(&[0.5, 0.6, 0.7, 0.8]);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut messages = Vec::new();
        while let Some(msg) = remote.outbound.recv().await {
            messages.push(msg);
        }
        let tail = messages[messages.len() - 2..].to_vec();
        assert_eq!(tail, vec![OutboundMessage::AudioStreamEnd, OutboundMessage::Close]);
        assert!(!messages
            .iter()
            .any(|m| *m == OutboundMessage::Audio(encode_frame(&[0.5, 0.6, 0.7, 0.8]))));
    }

    #[tokio::test]
    async fn mid_stream_disconnect_silences_playback() {
        let h = Harness::new();
        h.connect().await.unwrap();
        let remote = h.connector.take_remote().unwrap();

        remote.inbound.send(reply(1.0)).await.unwrap();
        remote.inbound.send(reply(1.0)).await.unwrap();
        until("two scheduled buffers", || h.assistant.playback_in_flight() == 2).await;
        // Second buffer is still in the future.
        h.output.set_time(2.0);
        assert!(h.output.scheduled()[1].start > 2.0);

        h.assistant.disconnect();
        assert_eq!(h.assistant.playback_in_flight(), 0);
        let stopped = h.output.stopped();
        assert_eq!(stopped.len(), 2);
        assert!((h.assistant.playback_cursor() - 2.0).abs() < 1e-9);
        assert_eq!(h.statuses().last().map(String::as_str), Some("Disconnected"));
    }

    #[tokio::test]
    async fn natural_completion_leaves_in_flight() {
        let h = Harness::new();
        h.connect().await.unwrap();
        let remote = h.connector.take_remote().unwrap();

        remote.inbound.send(reply(0.1)).await.unwrap();
        until("scheduled buffer", || h.output.scheduled().len() == 1).await;
        let id = h.output.scheduled()[0].id;
        assert!(h.output.complete(id));
        until("completion", || h.assistant.playback_in_flight() == 0).await;
    }

    #[tokio::test]
    async fn interruption_flushes_playback_but_keeps_session() {
        let h = Harness::new();
        h.connect().await.unwrap();
        let remote = h.connector.take_remote().unwrap();

        remote.inbound.send(reply(0.5)).await.unwrap();
        remote.inbound.send(reply(0.5)).await.unwrap();
        remote.inbound.send(VoiceEvent::Interrupted).await.unwrap();
        until("flush", || h.output.stopped().len() == 2).await;

        assert_eq!(h.assistant.playback_in_flight(), 0);
        assert_eq!(h.assistant.state(), SessionState::Connected);
        assert_eq!(h.statuses(), vec!["Connecting...", "Connected"]);
    }

    #[tokio::test]
    async fn bad_payload_is_dropped() {
        let h = Harness::new();
        h.connect().await.unwrap();
        let remote = h.connector.take_remote().unwrap();

        remote
            .inbound
            .send(VoiceEvent::Audio {
                frame: WireFrame::new("@@not base64@@", OUTPUT_AUDIO_MIME),
            })
            .await
            .unwrap();
        remote.inbound.send(reply(0.1)).await.unwrap();
        until("good frame", || h.output.scheduled().len() == 1).await;
        assert_eq!(h.assistant.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn remote_close_reports_once_and_releases() {
        let h = Harness::new();
        h.connect().await.unwrap();
        let remote = h.connector.take_remote().unwrap();

        remote
            .inbound
            .send(VoiceEvent::Closed {
                reason: Some("goAway".into()),
            })
            .await
            .unwrap();
        until("teardown", || h.assistant.state() == SessionState::Disconnected).await;
        assert!(!h.mic.is_held());

        h.assistant.disconnect();
        assert_eq!(h.statuses(), vec!["Connecting...", "Connected", "Disconnected"]);
    }

    #[tokio::test]
    async fn connection_failure_reports_disconnected() {
        let h = Harness::new();
        h.connect().await.unwrap();
        let remote = h.connector.take_remote().unwrap();

        remote
            .inbound
            .send(VoiceEvent::Failed {
                message: "socket reset".into(),
            })
            .await
            .unwrap();
        until("teardown", || h.assistant.state() == SessionState::Disconnected).await;
        assert_eq!(h.statuses(), vec!["Connecting...", "Connected", "Disconnected"]);
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let h = Harness::new();
        h.connect().await.unwrap();
        assert_eq!(h.connect().await, Err(ConnectError::AlreadyActive));
        assert_eq!(h.assistant.state(), SessionState::Connected);
    }

    #[test]
    fn nothing_is_reported_after_disconnected() {
        let seen = Arc::new(Mutex::new(Vec::<SessionStatus>::new()));
        let reporter = {
            let seen = Arc::clone(&seen);
            StatusReporter::new(Arc::new(move |status: SessionStatus| seen.lock().push(status)))
        };
        reporter.report(SessionStatus::Connecting);
        reporter.report(SessionStatus::Disconnected);
        reporter.report(SessionStatus::Connected);
        reporter.report(SessionStatus::Disconnected);
        assert_eq!(
            *seen.lock(),
            vec![SessionStatus::Connecting, SessionStatus::Disconnected]
        );
    }

    #[test]
    fn racing_connected_never_lands_after_disconnected() {
        for _ in 0..50 {
            let seen = Arc::new(Mutex::new(Vec::<SessionStatus>::new()));
            let reporter = {
                let seen = Arc::clone(&seen);
                StatusReporter::new(Arc::new(move |status: SessionStatus| seen.lock().push(status)))
            };
            let closer = {
                let reporter = Arc::clone(&reporter);
                std::thread::spawn(move || reporter.report(SessionStatus::Disconnected))
            };
            reporter.report(SessionStatus::Connected);
            closer.join().unwrap();
            assert_eq!(seen.lock().last(), Some(&SessionStatus::Disconnected));
        }
    }

    #[tokio::test]
    async fn callback_may_disconnect_on_connected() {
        let h = Harness::new();
        let on_status = {
            let statuses = Arc::clone(&h.statuses);
            let assistant = Arc::clone(&h.assistant);
            move |status: SessionStatus| {
                statuses.lock().push(status.to_string());
                if status == SessionStatus::Connected {
                    assistant.disconnect();
                }
            }
        };
        h.assistant.connect(on_status).await.unwrap();
        assert_eq!(h.statuses(), vec!["Connecting...", "Connected", "Disconnected"]);
        assert_eq!(h.assistant.state(), SessionState::Disconnected);
        assert!(!h.mic.is_held());
    }

    #[tokio::test]
    async fn capture_start_failure_closes_link() {
        let h = Harness::with(FakeMicrophone::fails_to_start(), FakeConnector::new());
        let err = h.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Device(DeviceError::Stream(_))));
        assert_eq!(
            h.statuses(),
            vec!["Connecting...", "Error Accessing Mic", "Disconnected"]
        );
        assert!(!h.mic.is_held());
        assert_eq!(h.assistant.state(), SessionState::Disconnected);

        let mut remote = h.connector.take_remote().unwrap();
        assert_eq!(remote.outbound.recv().await, Some(OutboundMessage::AudioStreamEnd));
        assert_eq!(remote.outbound.recv().await, Some(OutboundMessage::Close));
        assert_eq!(remote.outbound.recv().await, None);
    }

    /// Output whose first `play_at` takes a while, like a device busy
    /// opening a stream.
    #[derive(Default)]
    struct SlowOutput {
        played: Mutex<Vec<BufferId>>,
        stopped: Mutex<Vec<BufferId>>,
    }

    impl AudioOutput for SlowOutput {
        fn current_time(&self) -> f64 {
            0.0
        }

        fn play_at(
            &self,
            _buffer: crate::voice::playback::PlaybackBuffer,
            _start_at: f64,
            done: crate::voice::playback::PlaybackDone,
        ) -> Result<(), DeviceError> {
            let id = done.id();
            self.played.lock().push(id);
            if id == 0 {
                std::thread::sleep(std::time::Duration::from_millis(150));
            }
            Ok(())
        }

        fn stop(&self, id: BufferId) {
            self.stopped.lock().push(id);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_while_scheduling_leaves_nothing_playing() {
        let output = Arc::new(SlowOutput::default());
        let connector = FakeConnector::new();
        let assistant = VoiceAssistant::new(
            VoiceConfig::default(),
            Arc::new(FakeMicrophone::new()),
            Arc::clone(&output) as Arc<dyn AudioOutput>,
            Arc::new(connector.clone()),
        );
        assistant.connect(|_| {}).await.unwrap();
        let remote = connector.take_remote().unwrap();
        for _ in 0..3 {
            remote.inbound.send(reply(0.1)).await.unwrap();
        }

        for _ in 0..500 {
            if !output.played.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(*output.played.lock(), vec![0]);

        // Buffer 0 is still being handed to the output.
        assistant.disconnect();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let played = output.played.lock().clone();
        let stopped = output.stopped.lock().clone();
        assert!(
            played.iter().all(|id| stopped.contains(id)),
            "played {played:?}, stopped {stopped:?}"
        );
        assert_eq!(played, vec![0]);
        assert_eq!(assistant.playback_in_flight(), 0);
    }

    #[tokio::test]
    async fn disconnect_while_connecting_cancels() {
        let h = Harness::with(FakeMicrophone::new(), FakeConnector::gated());
        let connecting = {
            let assistant = Arc::clone(&h.assistant);
            let on_status = h.recorder();
            tokio::spawn(async move { assistant.connect(on_status).await })
        };
        h.connector.wait_for_attempt().await;
        assert_eq!(h.assistant.state(), SessionState::Connecting);

        h.assistant.disconnect();
        assert!(!h.mic.is_held());
        h.connector.release();

        let result = connecting.await.unwrap();
        assert_eq!(result, Err(ConnectError::Transport(TransportError::Cancelled)));
        assert_eq!(h.statuses(), vec!["Connecting...", "Disconnected"]);
        assert_eq!(h.assistant.state(), SessionState::Disconnected);
    }
}
