//! JSON bodies of the frames the client sends and understands. Field names on the wire are
//!  camelCase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;


#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleMessageBody {
    pub message_type: u32,
    pub from_id: String,
    pub to_id: String,
    pub message_id: String,
    pub content: String,
    pub send_time: i64,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadBody {
    pub from_id: String,
    pub to_id: String,
    pub last_sequence: i64,
    pub conversation_type: u32,
}

/// sent by the receiving client to confirm a SINGLE_MESSAGE, routed back to the sender
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveAckBody {
    pub from_id: String,
    pub to_id: String,
    pub message_key: Option<i64>,
    pub message_id: String,
    pub message_sequence: Option<i64>,
    pub to_imei: Option<String>,
    pub to_client_type: Option<u32>,
}


/// MESSAGE_ACK: the server persisted (or refused) a message
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAckBody {
    pub message_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message_key: Option<i64>,
    #[serde(default)]
    pub message_sequence: Option<i64>,
    #[serde(default)]
    pub error_msg: Option<String>,
}

/// MESSAGE_RECEIVE_ACK as seen by the original sender: the receiver got the message, or the
///  server stands in for an offline receiver (`server_send`).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveAckNotice {
    pub message_id: String,
    #[serde(default)]
    pub message_key: Option<i64>,
    #[serde(default, alias = "sequence")]
    pub message_sequence: Option<i64>,
    #[serde(default)]
    pub server_send: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundSingleMessage {
    pub from_id: String,
    #[serde(default)]
    pub message_key: Option<i64>,
    pub message_id: String,
    #[serde(default)]
    pub message_type: u32,
    #[serde(default, alias = "content")]
    pub message_body: Value,
    #[serde(default)]
    pub send_time: i64,
    #[serde(default)]
    pub message_sequence: Option<i64>,
    #[serde(default)]
    pub imei: Option<String>,
    #[serde(default)]
    pub client_type: Option<u32>,
}

impl InboundSingleMessage {
    /// Message content is usually a JSON string. Anything else (e.g. structured media
    ///  descriptors) is handed on in its JSON representation.
    pub fn content(&self) -> String {
        match &self.message_body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserClientsStatus {
    #[serde(default)]
    pub status: u32,
    /// client type -> status
    #[serde(default)]
    pub clients_status_map: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusUpdateBody {
    #[serde(default)]
    pub app_id: Option<u32>,
    pub user_id: String,
    #[serde(default)]
    pub user_clients_status: UserClientsStatus,
}
