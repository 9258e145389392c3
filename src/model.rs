//! Queue payloads and the search document.
//!
//! Payload field names are the producer's camelCase wire names; the
//! structs stay snake_case through serde renaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Command payload on the `create_chats` queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChat {
    pub token: String,
    pub chat_number: i64,
    pub creator_id: i64,
}

/// Command payload on the `create_messages` queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    pub token: String,
    pub chat_number: i64,
    pub message_number: i64,
    pub sender_id: i64,
    pub body: String,
    /// RFC 3339 creation timestamp as produced upstream. Malformed values
    /// fall back to the consumer's clock.
    pub date: String,
}

/// Command payload on the `update_messages` queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub token: String,
    pub chat_number: i64,
    pub message_number: i64,
    pub body: String,
}

/// Document shape indexed for full-text search over message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDocument {
    pub id: i64,
    pub token: String,
    pub chat_number: i64,
    pub number: i64,
    pub body: String,
    pub sender_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageDocument {
    /// Stable document id: the message's external identifier triple.
    pub fn doc_id(&self) -> String {
        search_doc_id(&self.token, self.chat_number, self.number)
    }
}

/// Build the composite search document id `<token>:<chat_number>:<number>`.
pub fn search_doc_id(token: &str, chat_number: i64, number: i64) -> String {
    format!("{token}:{chat_number}:{number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_chat_wire_names() {
        let payload: CreateChat =
            serde_json::from_str(r#"{"token":"abc","chatNumber":1,"creatorId":7}"#).unwrap();
        assert_eq!(payload.token, "abc");
        assert_eq!(payload.chat_number, 1);
        assert_eq!(payload.creator_id, 7);
    }

    #[test]
    fn create_message_wire_names() {
        let payload: CreateMessage = serde_json::from_str(
            r#"{"token":"abc","chatNumber":1,"messageNumber":2,"senderId":7,
                "body":"hello","date":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(payload.message_number, 2);
        assert_eq!(payload.body, "hello");
    }

    #[test]
    fn unknown_fields_rejected_nowhere() {
        // Producers may add fields; the consumer must keep parsing.
        let payload: UpdateMessage = serde_json::from_str(
            r#"{"token":"abc","chatNumber":1,"messageNumber":9,"body":"x","extra":true}"#,
        )
        .unwrap();
        assert_eq!(payload.message_number, 9);
    }

    #[test]
    fn doc_id_is_colon_joined_triple() {
        assert_eq!(search_doc_id("abc", 1, 2), "abc:1:2");
    }

    #[test]
    fn sender_name_omitted_when_absent() {
        let doc = MessageDocument {
            id: 1,
            token: "abc".into(),
            chat_number: 1,
            number: 1,
            body: "hello".into(),
            sender_id: 7,
            sender_name: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("sender_name").is_none());
    }
}
