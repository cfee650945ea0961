//! TravX Voice: full-duplex streaming voice sessions.
//!
//! Captures microphone audio, streams it to a live speech model as base64
//! PCM16 frames, and plays the synthesized replies back gaplessly. The entry
//! point is [`voice::VoiceAssistant`].
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use travx_voice::config::VoiceConfig;
//! use travx_voice::voice::{TimelineOutput, VoiceAssistant};
//! # fn mic() -> Arc<dyn travx_voice::voice::Microphone> { unimplemented!() }
//!
//! let config = VoiceConfig::load_default()?;
//! let output = Arc::new(TimelineOutput::new(config.playback.sample_rate, config.playback.channels));
//! let assistant = VoiceAssistant::with_gemini(config, mic(), output);
//! assistant.connect(|status| println!("{status}")).await?;
//! // ...
//! assistant.disconnect();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;
pub mod voice;

pub use config::VoiceConfig;
pub use error::{CodecError, ConnectError, DeviceError, TransportError};
pub use voice::{SessionStatus, VoiceAssistant};
