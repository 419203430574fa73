//! Client-side conversation synchronization engine.
//!
//! Maintains a live, append-and-mutate view of a chat transcript over one
//! persistent streaming connection: optimistic local sends reconciled
//! against authoritative server snapshots, plus a microphone capture
//! pipeline whose live transcription feeds the same compose buffer the user
//! types into. Hosting views render [`Conversation::messages`], the
//! `awaiting_answer` flag, the compose draft and the capture status; the
//! engine owns everything underneath.

pub mod audio;
pub mod chat;
pub mod compose;
pub mod connection;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod service;
pub mod settings;
pub mod transcript;

pub use audio::{AudioBackend, CaptureSession, CaptureStatus, CpalBackend, InputHandle};
pub use chat::{ChatLog, Message, Role};
pub use compose::ComposeBuffer;
pub use connection::{Connection, ConnectionState};
pub use engine::{Conversation, LogNotifier, Notifier};
pub use error::{CaptureError, EngineError};
pub use protocol::{Outbound, Reference, ServerEvent, SnapshotEvent, TranscriptEvent};
pub use service::{ConversationSource, NoHistory, RestSource};
pub use settings::Settings;
