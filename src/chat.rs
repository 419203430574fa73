use crate::error::EngineError;
use crate::protocol::{Reference, SnapshotEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub references: Vec<Reference>,
}

/// The conversation transcript, insertion-ordered, oldest first. At most one
/// assistant turn is in flight at a time; `awaiting_answer` tracks it.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<Message>,
    awaiting_answer: bool,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    /// Replace the list with previously persisted history.
    pub fn seed(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Optimistically append a user message, before any server acknowledgment.
    /// Rejected while the previous turn is unfinished.
    pub fn append_user(&mut self, content: String) -> Result<(), EngineError> {
        if self.awaiting_answer {
            return Err(EngineError::TurnInFlight);
        }
        self.messages.push(Message {
            id: format!("local-{}", Uuid::new_v4()),
            role: Role::User,
            content,
            created_at: Utc::now(),
            references: Vec::new(),
        });
        self.awaiting_answer = true;
        Ok(())
    }

    /// Reconcile one snapshot into the tail of the list.
    ///
    /// If the last message is a user message there is no assistant
    /// placeholder for this turn yet, so one is appended; either way the last
    /// message's content and references are overwritten with the snapshot.
    /// Always a full replace, never a concatenation: every event carries the
    /// whole reply so far. The wire has no sequence numbers, so events are
    /// applied in arrival order and the last one applied wins.
    pub fn apply_snapshot(&mut self, snapshot: SnapshotEvent) -> Result<(), EngineError> {
        let needs_placeholder = match self.messages.last() {
            // Nothing was ever sent; this snapshot belongs to no turn.
            None => return Err(EngineError::ProtocolViolation("snapshot with no turn")),
            Some(last) => last.role == Role::User,
        };
        if needs_placeholder {
            self.messages.push(Message {
                id: format!("packet-{}", Uuid::new_v4()),
                role: Role::Assistant,
                content: String::new(),
                created_at: Utc::now(),
                references: Vec::new(),
            });
        }
        if let Some(last) = self.messages.last_mut() {
            last.content = snapshot.text_snapshot;
            last.references = snapshot.references_snapshot;
        }
        if snapshot.finished {
            self.awaiting_answer = false;
        }
        Ok(())
    }
}
