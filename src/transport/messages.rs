use base64::Engine;
use serde::{Deserialize, Serialize};

/// MIME type of outbound microphone frames (16kHz PCM mono)
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// MIME type of outbound vision frames
pub const IMAGE_MIME: &str = "image/jpeg";

/// Media message sent to the remote endpoint
///
/// Wire format: `{"realtimeInput": {"media": {"data": "<base64>", "mimeType": "..."}}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeInput {
    pub media: MediaBlob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    /// Base64-encoded payload
    pub data: String,
    pub mime_type: String,
}

impl ClientMessage {
    /// Wrap raw bytes in a realtime media envelope
    pub fn media(bytes: &[u8], mime_type: &str) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media: MediaBlob {
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                    mime_type: mime_type.to_string(),
                },
            },
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.realtime_input.media.mime_type
    }
}

/// Message received from the remote endpoint
///
/// Only the fields needed to drive the session are modelled; anything else
/// in the payload is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,

    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// Base64-encoded audio
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

impl ServerMessage {
    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Base64 audio carried in the first model turn part
    pub fn audio_payload(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
            .map(|d| d.data.as_str())
    }

    pub fn interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    /// Partial user transcript, if non-empty
    pub fn input_text(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .input_transcription
            .as_ref()
            .map(|t| t.text.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Partial assistant transcript, if non-empty
    pub fn output_text(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .output_transcription
            .as_ref()
            .map(|t| t.text.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }
}
