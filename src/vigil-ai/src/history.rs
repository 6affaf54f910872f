//! Chat messages and the bounded conversation window

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    /// User turn with an optional base64 JPEG attached as a data url
    pub fn user(text: impl Into<String>, image_base64: Option<&str>) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        if let Some(image) = image_base64 {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{}", image),
                },
            });
        }
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn has_image(&self) -> bool {
        match &self.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
            MessageContent::Text(_) => false,
        }
    }
}

/// Most recent messages of a conversation, oldest dropped first
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    limit: usize,
    messages: VecDeque<ChatMessage>,
}

impl ConversationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            messages: VecDeque::with_capacity(limit + 1),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.limit {
            self.messages.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_window_keeps_most_recent() {
        let mut history = ConversationHistory::new(10);
        for i in 0..13 {
            history.push(ChatMessage::assistant(format!("reply {}", i)));
        }

        assert_eq!(history.len(), 10);
        assert_eq!(history.limit(), 10);
        assert_eq!(
            history.iter().next(),
            Some(&ChatMessage::assistant("reply 3"))
        );

        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_user_message_wire_format() {
        let message = ChatMessage::user("check ppe", Some("QUJD"));
        assert!(message.has_image());
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "check ppe"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,QUJD"}}
                ]
            })
        );
    }

    #[test]
    fn test_text_message_wire_format() {
        assert_eq!(
            serde_json::to_value(ChatMessage::system("be careful")).unwrap(),
            json!({"role": "system", "content": "be careful"})
        );
        assert!(!ChatMessage::user("no image", None).has_image());
    }
}
