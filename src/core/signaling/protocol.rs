use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "message-type", rename_all = "kebab-case")]
pub enum ClientMessage {
    GetChannelPrefix {
        #[serde(rename = "demo-group-name")]
        demo_group_name: String,
    },
    GetCurrentRoom {},
    GetAgoraToken {
        uid: String,
        #[serde(rename = "agora-channel-name")]
        agora_channel_name: String,
        #[serde(rename = "token-role")]
        token_role: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "message-type", rename_all = "kebab-case")]
pub enum ServerMessage {
    SetChannelPrefix {
        #[serde(rename = "channel-prefix")]
        channel_prefix: String,
    },
    JoinRoom {
        #[serde(default)]
        nth: Option<usize>,
    },
    NewAgoraToken {
        token: String,
    },
    #[serde(other)]
    Unknown,
}

/// Every server frame may carry the room the server currently considers
/// authoritative for this client, whatever its message type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(flatten)]
    pub body: ServerMessage,
}

impl ServerEnvelope {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SetChannelPrefix,
    JoinRoom,
    NewAgoraToken,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SetChannelPrefix => "set-channel-prefix",
            MessageKind::JoinRoom => "join-room",
            MessageKind::NewAgoraToken => "new-agora-token",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::SetChannelPrefix { .. } => MessageKind::SetChannelPrefix,
            ServerMessage::JoinRoom { .. } => MessageKind::JoinRoom,
            ServerMessage::NewAgoraToken { .. } => MessageKind::NewAgoraToken,
            ServerMessage::Unknown => MessageKind::Unknown,
        }
    }
}

pub fn decode_server_frame(raw: &str) -> Result<ServerEnvelope, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_client_message(message: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_kebab_case_keys() {
        let encoded = serde_json::to_value(ClientMessage::GetAgoraToken {
            uid: "42".into(),
            agora_channel_name: "prefix:room-bar".into(),
            token_role: 1,
        })
        .expect("encodes");
        assert_eq!(
            encoded,
            json!({
                "message-type": "get-agora-token",
                "uid": "42",
                "agora-channel-name": "prefix:room-bar",
                "token-role": 1
            })
        );

        let current = serde_json::to_value(ClientMessage::GetCurrentRoom {}).expect("encodes");
        assert_eq!(current, json!({ "message-type": "get-current-room" }));
    }

    #[test]
    fn join_room_frame_carries_room_in_envelope() {
        let frame = decode_server_frame(
            r#"{"message-type":"join-room","room":"room-conf-table","nth":2}"#,
        )
        .expect("decodes");
        assert_eq!(frame.room.as_deref(), Some("room-conf-table"));
        assert_eq!(frame.body, ServerMessage::JoinRoom { nth: Some(2) });
    }

    #[test]
    fn unrecognised_message_type_decodes_as_unknown() {
        let frame =
            decode_server_frame(r#"{"message-type":"server-hello","room":"room-bar"}"#)
                .expect("decodes");
        assert_eq!(frame.kind(), MessageKind::Unknown);
        assert_eq!(frame.room.as_deref(), Some("room-bar"));
    }

    #[test]
    fn frame_without_discriminant_is_rejected() {
        assert!(decode_server_frame(r#"{"token":"abc"}"#).is_err());
    }
}
