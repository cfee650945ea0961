//! Streaming voice session.
//!
//! Full-duplex audio between the user's microphone and a live speech model:
//!
//! ```text
//!   mic ──▸ capture ──▸ codec::encode_frame ──▸ transport ──▸ gemini_live (WS)
//!                                                                 │
//!   speaker ◂── playback (gapless scheduler) ◂── codec::decode ◂──┘
//! ```
//!
//! [`VoiceAssistant`] owns one session at a time and reports coarse status
//! through a callback. Devices and the remote model sit behind traits
//! ([`Microphone`], [`AudioOutput`], [`LiveConnector`]) so the session logic
//! runs the same against hardware, the sample-clock mixer or test fakes.

pub mod capture;
pub mod codec;
#[cfg(feature = "audio-device")]
pub mod device;
pub mod gemini_live;
pub mod playback;
pub mod resample;
pub mod session;
pub mod timeline;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

#[allow(unused_imports)]
pub use capture::{CaptureFormat, CapturePipeline, MicStream, Microphone};
#[allow(unused_imports)]
pub use codec::{decode_frame, encode_frame, WireFrame};
#[allow(unused_imports)]
pub use gemini_live::GeminiLiveConnector;
#[allow(unused_imports)]
pub use playback::{AudioOutput, PlaybackScheduler};
#[allow(unused_imports)]
pub use session::{SessionStatus, StatusCallback, VoiceAssistant};
#[allow(unused_imports)]
pub use timeline::TimelineOutput;
#[allow(unused_imports)]
pub use transport::{LiveConnector, SessionTransport, TransportState};

/// Events delivered by a live connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// The remote accepted the session setup.
    SetupComplete,
    /// A chunk of synthesized speech.
    Audio { frame: WireFrame },
    /// Transcription of what the user said.
    InputTranscript { text: String },
    /// Transcription or text of the model's reply.
    OutputTranscript { text: String },
    /// The model finished its turn.
    TurnComplete,
    /// The user spoke over the model; queued playback should be dropped.
    Interrupted,
    /// The server reported an error without closing the session.
    Error { message: String },
    /// The connection closed. Always the last event.
    Closed { reason: Option<String> },
    /// The connection broke. Always the last event.
    Failed { message: String },
}

impl VoiceEvent {
    /// `true` for the events that end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Failed { .. })
    }
}
