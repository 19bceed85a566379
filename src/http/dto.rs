//! Request and response bodies of the REST API.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::bodies::UserClientsStatus;


/// The envelope of every REST response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn into_data(self) -> anyhow::Result<T> {
        let code = self.code;
        let message = self.message;
        self.data
            .ok_or_else(|| anyhow!("response without data (code {}): {}", code, message.unwrap_or_default()))
    }
}


#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginRequest<'a> {
    pub user_id: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshTokenRequest<'a> {
    pub refresh_token: &'a str,
    pub user_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FriendListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConversationSyncRequest {
    pub last_sequence: i64,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateConversationRequest<'a> {
    pub to_id: &'a str,
    #[serde(rename = "type")]
    pub conversation_type: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateConversationRequest<'a> {
    pub from_id: Option<String>,
    pub to_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_top: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_mute: Option<u32>,
}


#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct RouteInfo {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub route_info: Option<RouteInfo>,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

/// where to open the IM connection
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct ImServerAddress {
    pub ip: String,
    pub port: u16,
}

impl ImServerAddress {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.ip, self.port)
    }
}

/// the user's current sequence numbers per data category, for incremental sync
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSequence {
    pub user_info_sequence: i64,
    pub conversation_sequence: i64,
    pub friendship_sequence: i64,
    pub friend_request_sequence: i64,
    pub group_sequence: i64,
    pub friendship_group_sequence: i64,
    pub message_sequence: i64,
    pub group_message_sequence: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Friend {
    pub id: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub remark: Option<String>,
    pub email: Option<String>,
    pub location: Option<String>,
    pub signature: Option<String>,
    pub age: Option<u32>,
    pub phone: Option<String>,
    pub birthday: Option<String>,
    pub gender: Option<u32>,
    pub status: Option<u32>,
    pub sequence: i64,
    pub add_source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FriendListPage {
    #[serde(alias = "list")]
    pub friends: Vec<Friend>,
    pub next_cursor: Option<i64>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendStatus {
    pub friend_id: String,
    #[serde(default)]
    pub status: UserClientsStatus,
    #[serde(default)]
    pub custom_text: Option<String>,
}

/// a user defined group of friends, with the ids of its members
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FriendGroup {
    pub group_id: String,
    pub group_name: String,
    pub sequence: i64,
    pub friend_ids: Vec<String>,
}

/// one batch of an incremental sync
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse<T> {
    #[serde(default)]
    pub max_sequence: i64,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default = "Vec::new")]
    pub data_list: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineMessage {
    pub message_key: i64,
    #[serde(default)]
    pub message_body: Value,
    #[serde(default)]
    pub send_time: i64,
    #[serde(default)]
    pub del_flag: u32,
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub message_sequence: i64,
    #[serde(default)]
    pub conversation_type: u32,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub conversation_type: u32,
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub is_top: bool,
    #[serde(default)]
    pub is_mute: bool,
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub read_sequence: i64,
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use super::*;

    #[test]
    fn test_api_response_without_data() {
        let response: ApiResponse<UserSequence> = serde_json::from_value(json!({"code": 500, "message": "boom"})).unwrap();
        assert_eq!(response.data, None);
        let err = response.into_data().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_sync_response() {
        let response: ApiResponse<SyncResponse<Conversation>> = serde_json::from_value(json!({
            "code": 200,
            "data": {
                "maxSequence": 17,
                "isCompleted": true,
                "dataList": [{"id": "c1", "type": 0, "fromId": "u1", "toId": "u2", "isTop": true, "sequence": 17}],
            }
        })).unwrap();

        let sync = response.into_data().unwrap();
        assert_eq!(sync.max_sequence, 17);
        assert!(sync.is_completed);
        assert_eq!(sync.data_list.len(), 1);
        assert_eq!(sync.data_list[0].to_id, "u2");
        assert!(sync.data_list[0].is_top);
        assert!(!sync.data_list[0].is_mute);
    }

    #[test]
    fn test_update_conversation_skips_missing_flags() {
        let request = UpdateConversationRequest {
            from_id: Some("u1".to_string()),
            to_id: "u2",
            is_top: None,
            is_mute: Some(1),
        };
        assert_eq!(serde_json::to_value(&request).unwrap(), json!({"fromId": "u1", "toId": "u2", "isMute": 1}));
    }
}
