//! Gemini Live WebSocket client.
//!
//! Implements the bidirectional streaming protocol for Google's Gemini
//! Live API (BidiGenerateContent) behind the [`LiveConnector`] seam.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to the Gemini Live endpoint
//! 2. **Setup**: send model, `responseModalities: ["AUDIO"]` and the persona
//! 3. **Stream**: send audio chunks as `realtimeInput`, receive synthesized
//!    audio as `serverContent`
//! 4. **Close**: `audioStreamEnd`, then a close frame
//!
//! Gemini Live sends its JSON messages as WebSocket Binary frames as well as
//! Text frames. Binary frames starting with `{` are parsed as JSON; anything
//! else is skipped.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{WireFrame, OUTPUT_AUDIO_MIME};
use super::transport::{LiveConnector, LiveLink, OutboundMessage, SessionSetup};
use super::VoiceEvent;
use crate::config::VoiceConfig;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Setup message (JSON sent as first frame) ───────────────────────

/// Top-level setup message for Gemini Live session initialization.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig", skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: PrebuiltVoiceSelection,
}

/// `voiceConfig` object.
#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceSelection {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Build the setup message for a voice session.
pub fn build_setup_message(setup: &SessionSetup) -> SetupMessage {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: setup.response_modalities.clone(),
                speech_config: setup.voice_name.as_ref().map(|name| SpeechConfig {
                    voice_config: PrebuiltVoiceSelection {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: name.clone(),
                        },
                    },
                }),
            },
            system_instruction: (!setup.system_instruction.trim().is_empty()).then(|| {
                SystemInstruction {
                    parts: vec![TextPart {
                        text: setup.system_instruction.clone(),
                    }],
                }
            }),
        },
    }
}

// ── Audio input message ────────────────────────────────────────────

/// Audio input message sent to Gemini Live.
///
/// The SDKs still put `mediaChunks` on the wire; the newer `audio` field is
/// not reliably processed by the server yet.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage<'a> {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput<'a> {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: [&'a WireFrame; 1],
}

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
pub fn build_audio_message(frame: &WireFrame) -> RealtimeInputMessage<'_> {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: [frame],
        },
    }
}

/// Message to signal the end of the audio stream to Gemini Live.
#[derive(Debug, Serialize)]
pub struct AudioStreamEndMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: AudioStreamEndPayload,
}

#[derive(Debug, Serialize)]
pub struct AudioStreamEndPayload {
    #[serde(rename = "audioStreamEnd")]
    pub audio_stream_end: bool,
}

pub fn build_audio_stream_end_message() -> AudioStreamEndMessage {
    AudioStreamEndMessage {
        realtime_input: AudioStreamEndPayload {
            audio_stream_end: true,
        },
    }
}

// ── Server response parsing ────────────────────────────────────────

/// Parse a JSON frame from Gemini Live into a list of events.
///
/// Only the first `inlineData` part of a model turn is taken as audio.
pub fn parse_server_message(json_text: &str) -> Vec<VoiceEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(VoiceEvent::Error {
                message: format!("Failed to parse server message: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(VoiceEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::Interrupted);
        }
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            let audio = parts.iter().find_map(|part| {
                let inline = part.get("inlineData")?;
                let data = inline.get("data")?.as_str()?;
                let mime = inline
                    .get("mimeType")
                    .and_then(|v| v.as_str())
                    .unwrap_or(OUTPUT_AUDIO_MIME);
                Some(WireFrame::new(data, mime))
            });
            if let Some(frame) = audio {
                events.push(VoiceEvent::Audio { frame });
            }
            for text in parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
            {
                events.push(VoiceEvent::OutputTranscript {
                    text: text.to_string(),
                });
            }
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::TurnComplete);
        }
    }

    if let Some(text) = transcription_text(&value, "inputTranscription") {
        events.push(VoiceEvent::InputTranscript { text });
    }
    if let Some(text) = transcription_text(&value, "outputTranscription") {
        events.push(VoiceEvent::OutputTranscript { text });
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(VoiceEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

/// Transcriptions arrive either top-level or inside `serverContent`.
fn transcription_text(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .pointer(&format!("/{key}/text"))
        .or_else(|| value.pointer(&format!("/serverContent/{key}/text")))
        .and_then(|v| v.as_str())
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

// ── Connector ──────────────────────────────────────────────────────

/// Opens Gemini Live sessions over a WebSocket.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    api_key: Option<String>,
    endpoint: String,
    setup_timeout: Duration,
    outbound_capacity: usize,
    inbound_capacity: usize,
}

impl GeminiLiveConnector {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            endpoint: config.endpoint.clone(),
            setup_timeout: Duration::from_secs(config.transport.setup_timeout_secs),
            outbound_capacity: config.transport.outbound_capacity.max(1),
            inbound_capacity: config.transport.inbound_capacity.max(1),
        }
    }

    /// Wait for `setupComplete` on the unsplit stream.
    async fn await_setup_complete(
        ws_stream: &mut WsStream,
        session_id: &str,
    ) -> Result<(), TransportError> {
        while let Some(msg_result) = ws_stream.next().await {
            match msg_result {
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        if Self::is_setup_complete(text, session_id)? {
                            return Ok(());
                        }
                    }
                }
                Ok(WsMessage::Text(text)) => {
                    if Self::is_setup_complete(text.as_str(), session_id)? {
                        return Ok(());
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    return Err(TransportError::ClosedDuringSetup(format!("{frame:?}")));
                }
                Err(e) => return Err(TransportError::Connect(e.to_string())),
                other => {
                    tracing::debug!(
                        session_id = %session_id,
                        msg = ?other,
                        "Gemini Live setup phase: non-JSON frame"
                    );
                }
            }
        }
        Err(TransportError::ClosedDuringSetup("stream ended".to_string()))
    }

    /// Setup replies either acknowledge or reject; anything else is ignored.
    fn is_setup_complete(text: &str, session_id: &str) -> Result<bool, TransportError> {
        for event in parse_server_message(text) {
            match event {
                VoiceEvent::SetupComplete => {
                    tracing::info!(session_id = %session_id, "Gemini Live setup complete");
                    return Ok(true);
                }
                VoiceEvent::Error { message } => {
                    return Err(TransportError::Setup(message));
                }
                _ => {}
            }
        }
        Ok(false)
    }

    // ── Internal loops ────────────────────────────────────────────

    /// Outbound loop: serialize queued messages and send them in order.
    async fn outbound_loop(
        mut rx: mpsc::Receiver<OutboundMessage>,
        mut ws_sender: SplitSink<WsStream, WsMessage>,
        session_id: String,
    ) {
        let mut audio_chunk_count: u64 = 0;

        while let Some(msg) = rx.recv().await {
            let json = match &msg {
                OutboundMessage::Audio(frame) => {
                    audio_chunk_count += 1;
                    if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                        tracing::info!(
                            session_id = %session_id,
                            chunk = audio_chunk_count,
                            b64_len = frame.payload.len(),
                            "Sending audio chunk to Gemini"
                        );
                    }
                    serde_json::to_string(&build_audio_message(frame))
                }
                OutboundMessage::AudioStreamEnd => {
                    tracing::info!(session_id = %session_id, "Sending audioStreamEnd to Gemini Live");
                    serde_json::to_string(&build_audio_stream_end_message())
                }
                OutboundMessage::Close => break,
            };

            match json {
                Ok(json) => {
                    if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                        tracing::warn!(
                            session_id = %session_id,
                            "WebSocket send failed, closing outbound loop"
                        );
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to serialize outbound message"
                    );
                }
            }
        }

        let _ = ws_sender.send(WsMessage::Close(None)).await;
        tracing::debug!(session_id = %session_id, chunks = audio_chunk_count, "Outbound loop terminated");
    }

    /// Inbound loop: receive frames from Gemini Live and dispatch events.
    async fn inbound_loop(
        mut ws_receiver: SplitStream<WsStream>,
        event_tx: mpsc::Sender<VoiceEvent>,
        session_id: String,
    ) {
        let start_time = Instant::now();
        let mut audio_response_count: u64 = 0;

        let terminal = loop {
            let Some(msg_result) = ws_receiver.next().await else {
                break VoiceEvent::Closed {
                    reason: Some("stream ended".to_string()),
                };
            };
            let text = match msg_result {
                Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                Ok(WsMessage::Binary(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    match std::str::from_utf8(&data) {
                        Ok(text) if data.first() == Some(&b'{') => text.to_owned(),
                        _ => {
                            tracing::warn!(
                                session_id = %session_id,
                                len = data.len(),
                                first_byte = data.first().copied().unwrap_or(0),
                                "Unexpected non-JSON binary frame from Gemini Live, skipping"
                            );
                            continue;
                        }
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
                    break VoiceEvent::Closed {
                        reason: frame.map(|f| f.reason.to_string()),
                    };
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                    break VoiceEvent::Failed {
                        message: format!("WebSocket error: {e}"),
                    };
                }
            };

            let elapsed = start_time.elapsed().as_secs_f32();
            for event in parse_server_message(&text) {
                match &event {
                    VoiceEvent::Audio { frame } => {
                        audio_response_count += 1;
                        tracing::debug!(
                            session_id = %session_id,
                            t = format!("{elapsed:.1}s"),
                            audio_n = audio_response_count,
                            b64_len = frame.payload.len(),
                            "⬇ Gemini audio response"
                        );
                    }
                    VoiceEvent::TurnComplete => {
                        tracing::info!(
                            session_id = %session_id,
                            t = format!("{elapsed:.1}s"),
                            audio_chunks = audio_response_count,
                            "⬇ Turn complete"
                        );
                    }
                    VoiceEvent::Interrupted => {
                        tracing::info!(session_id = %session_id, t = format!("{elapsed:.1}s"), "⬇ Interrupted");
                    }
                    _ => {}
                }
                if event_tx.send(event).await.is_err() {
                    tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                    return;
                }
            }
        };

        let _ = event_tx.send(terminal).await;
        tracing::debug!(session_id = %session_id, "Inbound loop terminated");
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        session_id: &str,
        setup: &SessionSetup,
    ) -> Result<LiveLink, TransportError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(TransportError::MissingApiKey)?;
        let url = format!("{}?key={api_key}", self.endpoint);

        tracing::info!(session_id = %session_id, model = %setup.model, "Connecting to Gemini Live");

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let setup_json = serde_json::to_string(&build_setup_message(setup))
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        tracing::debug!(session_id = %session_id, setup = %setup_json, "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        match tokio::time::timeout(
            self.setup_timeout,
            Self::await_setup_complete(&mut ws_stream, session_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::SetupTimeout(self.setup_timeout.as_secs())),
        }

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (event_tx, event_rx) = mpsc::channel(self.inbound_capacity);

        tokio::spawn(Self::outbound_loop(outbound_rx, ws_sender, session_id.to_string()));
        tokio::spawn(Self::inbound_loop(ws_receiver, event_tx, session_id.to_string()));

        Ok(LiveLink {
            outbound: outbound_tx,
            inbound: event_rx,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────
