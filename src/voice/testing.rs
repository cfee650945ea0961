//! Deterministic stand-ins for the device and connector seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use super::capture::{CaptureFormat, MicStream, Microphone, SampleSink};
use super::playback::{AudioOutput, BufferId, PlaybackBuffer, PlaybackDone};
use super::transport::{LiveConnector, LiveLink, OutboundMessage, SessionSetup};
use super::VoiceEvent;
use crate::error::{DeviceError, TransportError};

// ── Microphone ────────────────────────────────────────────────────

#[derive(Default)]
struct MicState {
    denied: bool,
    start_fails: bool,
    held: bool,
    running: bool,
    sink: Option<SampleSink>,
    stop_calls: usize,
}

/// Microphone whose audio callback is driven by the test.
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<Mutex<MicState>>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `acquire` fails with `PermissionDenied`.
    pub fn denied() -> Self {
        let mic = Self::default();
        mic.state.lock().denied = true;
        mic
    }

    /// `acquire` succeeds but `start` fails, like a device unplugged in
    /// between.
    pub fn fails_to_start() -> Self {
        let mic = Self::default();
        mic.state.lock().start_fails = true;
        mic
    }

    /// Deliver samples as a running device would. Returns `false` if the
    /// stream is not running.
    pub fn feed(&self, samples: &[f32]) -> bool {
        let mut state = self.state.lock();
        if !state.running {
            return false;
        }
        match state.sink.as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }

    /// Deliver samples through the last sink even after stop/release, like a
    /// callback already dispatched when teardown began.
    pub fn feed_late(&self, samples: &[f32]) {
        if let Some(sink) = self.state.lock().sink.as_mut() {
            sink(samples);
        }
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }
}

impl Microphone for FakeMicrophone {
    fn acquire(&self, _format: CaptureFormat) -> Result<Box<dyn MicStream>, DeviceError> {
        let mut state = self.state.lock();
        if state.denied {
            return Err(DeviceError::PermissionDenied);
        }
        state.held = true;
        Ok(Box::new(FakeMicStream {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeMicStream {
    state: Arc<Mutex<MicState>>,
}

impl MicStream for FakeMicStream {
    fn start(&mut self, sink: SampleSink) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.start_fails {
            return Err(DeviceError::Stream("input device vanished".into()));
        }
        state.sink = Some(sink);
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        state.running = false;
        state.stop_calls += 1;
    }
}

impl Drop for FakeMicStream {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.running = false;
        state.held = false;
    }
}

// ── Output ────────────────────────────────────────────────────────

/// One `play_at` call as seen by [`ManualOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlayCall {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
}

#[derive(Default)]
struct OutputState {
    now: f64,
    scheduled: Vec<PlayCall>,
    pending: HashMap<BufferId, PlaybackDone>,
    stopped: Vec<BufferId>,
    fail_next: bool,
}

/// Output device with a hand-driven clock that records every call.
#[derive(Default)]
pub struct ManualOutput {
    state: Mutex<OutputState>,
}

impl ManualOutput {
    pub fn new(now: f64) -> Arc<Self> {
        let output = Self::default();
        output.state.lock().now = now;
        Arc::new(output)
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().now = now;
    }

    pub fn scheduled(&self) -> Vec<PlayCall> {
        self.state.lock().scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<BufferId> {
        self.state.lock().stopped.clone()
    }

    /// Finish a buffer naturally. Returns `false` if it was stopped or
    /// already finished.
    pub fn complete(&self, id: BufferId) -> bool {
        let done = self.state.lock().pending.remove(&id);
        match done {
            Some(done) => {
                done.finished();
                true
            }
            None => false,
        }
    }

    pub fn fail_next_play(&self) {
        self.state.lock().fail_next = true;
    }
}

impl AudioOutput for ManualOutput {
    fn current_time(&self) -> f64 {
        self.state.lock().now
    }

    fn play_at(
        &self,
        buffer: PlaybackBuffer,
        start_at: f64,
        done: PlaybackDone,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(DeviceError::Stream("output unavailable".into()));
        }
        state.scheduled.push(PlayCall {
            id: done.id(),
            start: start_at,
            duration: buffer.duration(),
        });
        state.pending.insert(done.id(), done);
        Ok(())
    }

    fn stop(&self, id: BufferId) {
        let mut state = self.state.lock();
        state.pending.remove(&id);
        state.stopped.push(id);
    }
}

// ── Connector ─────────────────────────────────────────────────────

/// Remote side of a [`FakeConnector`] link.
pub struct Remote {
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub inbound: mpsc::Sender<VoiceEvent>,
}

#[derive(Default)]
struct ConnectorState {
    failure: Option<TransportError>,
    gated: bool,
    attempted: Notify,
    gate: Notify,
    setups: Mutex<Vec<SessionSetup>>,
    remote: Mutex<Option<Remote>>,
}

/// In-memory connector exposing both ends of each link it opens.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<ConnectorState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt fails with `err`.
    pub fn failing(err: TransportError) -> Self {
        Self {
            state: Arc::new(ConnectorState {
                failure: Some(err),
                ..ConnectorState::default()
            }),
        }
    }

    /// Attempts block until [`Self::release`] is called.
    pub fn gated() -> Self {
        Self {
            state: Arc::new(ConnectorState {
                gated: true,
                ..ConnectorState::default()
            }),
        }
    }

    pub async fn wait_for_attempt(&self) {
        self.state.attempted.notified().await;
    }

    pub fn release(&self) {
        self.state.gate.notify_one();
    }

    /// Remote end of the most recent link.
    pub fn take_remote(&self) -> Option<Remote> {
        self.state.remote.lock().take()
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.state.setups.lock().clone()
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(
        &self,
        _session_id: &str,
        setup: &SessionSetup,
    ) -> Result<LiveLink, TransportError> {
        self.state.setups.lock().push(setup.clone());
        self.state.attempted.notify_one();
        if self.state.gated {
            self.state.gate.notified().await;
        }
        if let Some(err) = &self.state.failure {
            return Err(err.clone());
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        *self.state.remote.lock() = Some(Remote {
            outbound: outbound_rx,
            inbound: inbound_tx,
        });
        Ok(LiveLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
