use std::collections::BTreeMap;

#[cfg(test)] use mockall::automock;
use serde_json::Value;
use tracing::warn;


#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DeliveryStatus {
    /// the server persisted the message and stands in for the (offline) receiver
    Sent,
    /// the receiver confirmed the message
    Delivered,
    Failed,
}

/// The final state of an outgoing message. Every message that was sent reaches exactly one
///  of these.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageAckEvent {
    pub conversation_id: String,
    pub message_id: String,
    pub status: DeliveryStatus,
    pub message_key: Option<i64>,
    pub message_sequence: Option<i64>,
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub sender_id: String,
    pub key: Option<i64>,
    pub id: String,
    pub message_type: u32,
    pub content: String,
    pub send_time: i64,
    pub sequence: Option<i64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientsStatus {
    /// 1 if at least one of the user's clients is online
    pub status: u32,
    /// client type -> status
    pub clients_status_map: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FriendStatusChange {
    pub app_id: Option<u32>,
    pub id: String,
    pub status: ClientsStatus,
}


/// Implemented by the application to learn about message delivery, incoming messages and
///  presence changes. Callbacks are invoked from the client's dispatch task one at a time and
///  in the order the triggering events arrived, so they should return quickly.
#[cfg_attr(test, automock)]
pub trait ClientCallbacks: Send + Sync + 'static {
    fn on_message_ack(&self, event: MessageAckEvent);

    fn on_single_message(&self, message: ReceivedMessage);

    fn on_friend_status_change(&self, friend_id: &str, change: FriendStatusChange);

    /// The same user logged in from another device of the same client type. The server is
    ///  going to close this connection.
    fn on_multi_login(&self, body: &Value) {
        warn!("logged in from another device: {}", body);
    }
}
