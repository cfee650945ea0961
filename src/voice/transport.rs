//! Connection lifecycle for a live voice session.
//!
//! ```text
//! Idle ─▸ Connecting ─▸ Open ─▸ Closed
//!             │           │
//!             └──▸ Error ◂┘
//! ```
//!
//! `send` checks the state synchronously and never blocks: frames offered
//! outside `Open`, or while the outbound queue is full, are dropped. The
//! wire protocol lives behind [`LiveConnector`] so the state machine does not
//! care which provider is on the other end.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::codec::WireFrame;
use super::VoiceEvent;
use crate::config::VoiceConfig;
use crate::error::TransportError;

/// Connection state of a [`SessionTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Message queued for the connector's outbound loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One captured audio frame.
    Audio(WireFrame),
    /// Microphone closed; flush any buffered input.
    AudioStreamEnd,
    /// Close the connection.
    Close,
}

/// Provider-neutral session setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: String,
    pub voice_name: Option<String>,
    pub response_modalities: Vec<String>,
}

impl SessionSetup {
    /// Audio-only replies with the configured persona.
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            model: config.model.clone(),
            system_instruction: config.system_instruction.clone(),
            voice_name: config.voice_name.clone(),
            response_modalities: vec!["AUDIO".to_string()],
        }
    }
}

/// Both ends of an established connection.
pub struct LiveLink {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::Receiver<VoiceEvent>,
}

/// Opens a bidirectional session with a remote model.
///
/// Resolves once the remote is ready to receive audio.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, session_id: &str, setup: &SessionSetup)
        -> Result<LiveLink, TransportError>;
}

struct Inner {
    state: TransportState,
    outbound: Option<mpsc::Sender<OutboundMessage>>,
}

/// Guarded sender half of one live session.
pub struct SessionTransport {
    session_id: String,
    inner: Mutex<Inner>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SessionTransport {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            inner: Mutex::new(Inner {
                state: TransportState::Idle,
                outbound: None,
            }),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    /// Open the connection. Returns the inbound event stream.
    ///
    /// If [`Self::close`] runs while the connector is still working, the
    /// fresh link is shut down and `Cancelled` is returned.
    pub async fn open(
        &self,
        connector: &dyn LiveConnector,
        setup: &SessionSetup,
    ) -> Result<mpsc::Receiver<VoiceEvent>, TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != TransportState::Idle {
                return Err(TransportError::InvalidState(inner.state));
            }
            inner.state = TransportState::Connecting;
        }

        let result = connector.connect(&self.session_id, setup).await;

        let mut inner = self.inner.lock();
        match result {
            Ok(link) if inner.state == TransportState::Connecting => {
                inner.state = TransportState::Open;
                inner.outbound = Some(link.outbound);
                tracing::info!(session_id = %self.session_id, "Live session open");
                Ok(link.inbound)
            }
            Ok(link) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    state = ?inner.state,
                    "Connection finished after close, shutting it down"
                );
                self.offer_control(&link.outbound, OutboundMessage::Close);
                Err(TransportError::Cancelled)
            }
            Err(e) => {
                if inner.state == TransportState::Connecting {
                    inner.state = TransportState::Error;
                }
                tracing::warn!(session_id = %self.session_id, error = %e, "Live session failed to open");
                Err(e)
            }
        }
    }

    /// Queue a frame for transmission. Returns `false` if it was dropped.
    pub fn send(&self, frame: WireFrame) -> bool {
        let inner = self.inner.lock();
        if inner.state != TransportState::Open {
            tracing::debug!(
                session_id = %self.session_id,
                state = ?inner.state,
                "Dropping audio frame: transport not open"
            );
            return false;
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return false;
        };

        match outbound.try_send(OutboundMessage::Audio(frame)) {
            Ok(()) => {
                let sent = self.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
                if sent == 1 || sent.is_multiple_of(50) {
                    tracing::info!(session_id = %self.session_id, frame = sent, "Queued audio frame");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    session_id = %self.session_id,
                    dropped,
                    "Outbound queue full, dropping audio frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(session_id = %self.session_id, "Outbound loop gone, dropping audio frame");
                false
            }
        }
    }

    /// Close from any non-terminal state. Returns `true` on the transition.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        let was_open = inner.state == TransportState::Open;
        inner.state = TransportState::Closed;
        if let Some(outbound) = inner.outbound.take() {
            if was_open {
                self.offer_control(&outbound, OutboundMessage::AudioStreamEnd);
            }
            self.offer_control(&outbound, OutboundMessage::Close);
        }
        tracing::info!(
            session_id = %self.session_id,
            frames_sent = self.frames_sent.load(Ordering::Relaxed),
            frames_dropped = self.frames_dropped.load(Ordering::Relaxed),
            "Live session closed"
        );
        true
    }

    /// The remote ended the session. Returns `true` on the transition.
    pub fn remote_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = TransportState::Closed;
        inner.outbound.take();
        tracing::info!(session_id = %self.session_id, "Live session closed by remote");
        true
    }

    /// The connection dropped unexpectedly. Returns `true` on the transition.
    pub fn fail(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, TransportState::Connecting | TransportState::Open) {
            return false;
        }
        inner.state = TransportState::Error;
        inner.outbound.take();
        tracing::error!(session_id = %self.session_id, reason, "Live session failed");
        true
    }

    /// Best effort: dropping the sender ends the outbound loop regardless.
    fn offer_control(&self, outbound: &mpsc::Sender<OutboundMessage>, message: OutboundMessage) {
        if let Err(e) = outbound.try_send(message) {
            tracing::debug!(
                session_id = %self.session_id,
                message = ?e.into_inner(),
                "Control message not queued"
            );
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}
