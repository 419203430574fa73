use crate::chat::Message;
use serde::Deserialize;
use std::time::Duration;

/// Supplies the previously persisted transcript, oldest first. Implementations
/// may block; the engine always calls this off the async runtime.
pub trait ConversationSource: Send + Sync {
    fn fetch(&self) -> Result<Vec<Message>, String>;
}

/// Source for hosts without a history backend: the view starts empty.
pub struct NoHistory;

impl ConversationSource for NoHistory {
    fn fetch(&self) -> Result<Vec<Message>, String> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct HistoryPayload {
    #[serde(default)]
    items: Vec<Message>,
}

/// Blocking REST fetch of the conversation history.
pub struct RestSource {
    base_url: String,
    user_id: Option<String>,
    user_email: Option<String>,
}

impl RestSource {
    pub fn new(base_url: String, user_id: Option<String>, user_email: Option<String>) -> Self {
        Self {
            base_url,
            user_id,
            user_email,
        }
    }
}

impl ConversationSource for RestSource {
    fn fetch(&self) -> Result<Vec<Message>, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| format!("http client error: {e}"))?;

        let mut url = format!("{}/chat", self.base_url.trim_end_matches('/'));
        if let Some(user_id) = &self.user_id {
            url.push_str("?userId=");
            url.push_str(user_id);
        }

        let mut request = client.get(url);
        if let Some(email) = &self.user_email {
            request = request.header("x-user-email", email);
        }

        let payload = request
            .send()
            .map_err(|e| format!("request failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("history endpoint error: {e}"))?
            .json::<HistoryPayload>()
            .map_err(|e| format!("invalid response json: {e}"))?;

        Ok(payload.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;

    #[test]
    fn history_payload_parses_messages() {
        let raw = r#"{"items":[
            {"id":"m1","role":"user","content":"hi","createdAt":"2026-01-05T10:00:00Z"},
            {"id":"m2","role":"assistant","content":"hello","createdAt":"2026-01-05T10:00:02Z","references":[]}
        ]}"#;
        let payload: HistoryPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.items.len(), 2);
        assert_eq!(payload.items[0].role, Role::User);
        assert_eq!(payload.items[1].content, "hello");
    }

    #[test]
    fn missing_items_means_empty_history() {
        let payload: HistoryPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.items.is_empty());
    }
}
