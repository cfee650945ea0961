//! PCM16 <-> base64 wire encoding.
//!
//! Outbound frames are float samples in `[-1, 1]` scaled by 32768 and packed
//! as signed 16-bit little-endian, then base64-encoded. Inbound payloads are
//! the reverse: base64 → bytes → `i16` LE samples.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// MIME tag for 16 kHz mono PCM16 capture frames.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// MIME tag the live API uses for 24 kHz synthesized audio.
pub const OUTPUT_AUDIO_MIME: &str = "audio/pcm;rate=24000";

const PCM_SCALE: f32 = 32768.0;

/// Serialized audio frame as it travels on the wire.
///
/// Serializes to `{"mimeType": "...", "data": "<base64>"}`, the shape the
/// live API uses for both `mediaChunks` and `inlineData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "data")]
    pub payload: String,
}

impl WireFrame {
    pub fn new(payload: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Sample rate from a `rate=N` parameter in the MIME tag.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse().ok())
            .filter(|rate| *rate > 0)
    }
}

/// Convert one float sample to PCM16.
///
/// Values outside `[-1, 1]` saturate at the i16 range instead of wrapping
/// (`as` casts from float saturate; NaN maps to 0).
pub fn float_to_pcm16(sample: f32) -> i16 {
    (sample * PCM_SCALE) as i16
}

pub fn pcm16_to_float(sample: i16) -> f32 {
    f32::from(sample) / PCM_SCALE
}

/// Encode captured float samples into a 16 kHz wire frame.
pub fn encode_frame(samples: &[f32]) -> WireFrame {
    let pcm: Vec<i16> = samples.iter().copied().map(float_to_pcm16).collect();
    encode_pcm16(&pcm, INPUT_AUDIO_MIME)
}

/// Encode already-quantized samples with an explicit MIME tag.
pub fn encode_pcm16(samples: &[i16], mime_type: &str) -> WireFrame {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    WireFrame::new(
        base64::engine::general_purpose::STANDARD.encode(bytes),
        mime_type,
    )
}

/// Decode a base64 payload into PCM16 samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_frame(payload: &str) -> Result<Vec<i16>, CodecError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
    if bytes.len() % 2 != 0 {
        tracing::debug!(bytes = bytes.len(), "Ignoring trailing odd byte in PCM payload");
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
