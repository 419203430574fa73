// Wire types: JSON text frames tagged with "event" and camelCase payload
// fields; captured audio travels as raw binary frames.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// Attachment descriptor carried on assistant messages. Opaque to the
/// engine: replaced wholesale with each snapshot, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub id: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub display_name: String,
    #[serde(rename = "previewImageURL", skip_serializing_if = "Option::is_none")]
    pub preview_image_url: Option<String>,
}

/// Full accumulated state of the in-progress assistant reply. Each event
/// replaces what came before; nothing on the wire is a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEvent {
    pub text_snapshot: String,
    #[serde(default)]
    pub references_snapshot: Vec<Reference>,
    #[serde(default)]
    pub finished: bool,
}

/// Transcription-so-far for the active capture session. Same full-text
/// contract as [`SnapshotEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

/// Inbound frames (server → client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(SnapshotEvent),
    Transcript(TranscriptEvent),
}

/// Outbound frames (client → server).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        content: String,
    },
    /// Terminal marker for a capture session. Nothing may follow it.
    EndRecording,
    /// One ~250ms slice of captured audio, sent as a binary frame.
    AudioChunk(Vec<u8>),
}

impl Outbound {
    pub fn into_ws(self) -> tungstenite::Message {
        match self {
            Outbound::AudioChunk(buf) => tungstenite::Message::Binary(buf),
            other => {
                // Tagged unit/struct variants always serialize.
                let text = serde_json::to_string(&other).unwrap_or_default();
                tungstenite::Message::Text(text)
            }
        }
    }
}

/// Decode an inbound frame. Returns `None` for frames the engine does not
/// consume (pings, unknown events, malformed JSON); callers log and move on.
pub fn decode(msg: &tungstenite::Message) -> Option<ServerEvent> {
    let text = match msg {
        tungstenite::Message::Text(t) => t.as_str(),
        _ => return None,
    };
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => Some(event),
        Err(e) => {
            log::debug!("[protocol] dropping undecodable frame: {}", e);
            None
        }
    }
}
