pub mod schema;

pub use schema::{
    CaptureConfig, PlaybackConfig, TransportConfig, VoiceConfig, DEFAULT_LIVE_ENDPOINT,
    DEFAULT_LIVE_MODEL, DEFAULT_SYSTEM_INSTRUCTION,
};
