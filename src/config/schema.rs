//! `voice.toml` document.
//!
//! Every section has defaults matching the live API's audio formats, so a
//! missing file or a partial one is valid. The API key may also come from
//! `GEMINI_API_KEY` or `API_KEY`, which win over the file.

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Gemini Live BidiGenerateContent WebSocket endpoint.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used for voice conversations.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are 'TravX Voice', a polyglot Indian travel assistant. \
You can understand and speak English, Hindi, Tamil, Telugu, Bengali, Kannada, Malayalam, Marathi, Gujarati, and Punjabi. \
Detect the user's language and respond in the same language. Be helpful, warm, and concise.";

/// Env vars checked (in order) for the API key.
const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

const CONFIG_FILE_NAME: &str = "voice.toml";

/// Top-level configuration for a voice assistant session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VoiceConfig {
    /// API key for the live endpoint. Env `GEMINI_API_KEY` / `API_KEY` take precedence.
    pub api_key: Option<String>,
    /// Model id, without the `models/` prefix.
    pub model: String,
    /// WebSocket endpoint of the live API.
    pub endpoint: String,
    /// Role/persona instruction sent with the session setup.
    pub system_instruction: String,
    /// Prebuilt voice for synthesized replies. Server default when unset.
    pub voice_name: Option<String>,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub transport: TransportConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_LIVE_MODEL.to_string(),
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice_name: None,
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Microphone capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture rate in Hz. The live API expects 16 kHz input.
    pub sample_rate: u32,
    /// Samples per outbound frame.
    pub frame_samples: usize,
    /// Frames buffered between the audio thread and the uplink task.
    pub queue_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 4096,
            queue_frames: 32,
        }
    }
}

/// Speaker playback settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Fallback output rate when an inbound frame carries no `rate=` tag.
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
        }
    }
}

/// Live connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TransportConfig {
    /// How long to wait for `setupComplete` after the socket opens.
    pub setup_timeout_secs: u64,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            setup_timeout_secs: 15,
            outbound_capacity: 256,
            inbound_capacity: 256,
        }
    }
}

impl VoiceConfig {
    /// Load from a TOML file. A missing file yields defaults; env overrides
    /// are applied either way.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Self>(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "Voice config not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `voice.toml` from the platform config directory.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = Self::default_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine a config directory"))?;
        Self::load(&path)
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "travx")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(key) = API_KEY_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.trim().is_empty())
        {
            self.api_key = Some(key);
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.trim().is_empty() {
            anyhow::bail!("model must not be empty");
        }
        if self.endpoint.trim().is_empty() {
            anyhow::bail!("endpoint must not be empty");
        }
        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            anyhow::bail!("sample rates must be non-zero");
        }
        if self.capture.frame_samples == 0 {
            anyhow::bail!("capture.frame_samples must be non-zero");
        }
        if self.capture.queue_frames == 0 {
            anyhow::bail!("capture.queue_frames must be non-zero");
        }
        if self.playback.channels == 0 {
            anyhow::bail!("playback.channels must be non-zero");
        }
        if self.transport.outbound_capacity == 0 || self.transport.inbound_capacity == 0 {
            anyhow::bail!("transport channel capacities must be non-zero");
        }
        Ok(())
    }

    /// JSON Schema of the config file, for editors and docs.
    pub fn json_schema() -> anyhow::Result<String> {
        let schema = schemars::schema_for!(VoiceConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}
