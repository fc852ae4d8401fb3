//! Client-facing wire frames. One closed enum per direction; an inbound
//! frame kind that is not listed here fails to parse and is dropped.

use serde::{Deserialize, Serialize};

use crate::models::MessageView;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "chat_message")]
    ChatMessage { message: String },

    #[serde(rename = "mark_delivered")]
    MarkDelivered { message_id: i64 },

    #[serde(rename = "mark_read")]
    MarkRead { message_id: i64 },

    #[serde(rename = "writing_indicator")]
    WritingIndicator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "chat_history")]
    ChatHistory { messages: Vec<MessageView> },

    #[serde(rename = "chat_message")]
    ChatMessage { message: MessageView },

    #[serde(rename = "online-acknowledge")]
    OnlineAck { message: String, sender: String },

    #[serde(rename = "offline-acknowledge")]
    OfflineAck { message: String, sender: String },

    #[serde(rename = "writing-indicator")]
    WritingIndicator { message: String, sender: String },

    #[serde(rename = "delivery-receipt")]
    DeliveryReceipt {
        message_id: i64,
        sender: String,
        serialized_message: MessageView,
    },

    #[serde(rename = "read-receipt")]
    ReadReceipt {
        message_id: i64,
        sender: String,
        serialized_message: MessageView,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl OutboundFrame {
    pub fn to_json(&self) -> String {
        // Outbound frames are plain data; serialization cannot fail.
        serde_json::to_string(self).expect("serialize outbound frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_parse_by_type_tag() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"chat_message","message":"hi"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::ChatMessage { message } if message == "hi"));

        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"mark_read","message_id":12}"#).unwrap();
        assert!(matches!(frame, InboundFrame::MarkRead { message_id: 12 }));

        let frame: InboundFrame = serde_json::from_str(r#"{"type":"writing_indicator"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::WritingIndicator));
    }

    #[test]
    fn unrecognized_frame_type_is_an_error() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"type":"shrug"}"#).is_err());
        assert!(serde_json::from_str::<InboundFrame>("not json").is_err());
    }

    #[test]
    fn outbound_type_tags_match_the_protocol() {
        let ack = OutboundFrame::OnlineAck {
            message: "alice is online".into(),
            sender: "alice".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&ack.to_json()).unwrap();
        assert_eq!(value["type"], "online-acknowledge");

        let typing = OutboundFrame::WritingIndicator {
            message: "bob is typing...".into(),
            sender: "bob".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&typing.to_json()).unwrap();
        assert_eq!(value["type"], "writing-indicator");
        assert_eq!(value["sender"], "bob");
    }
}
