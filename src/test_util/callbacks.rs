use std::sync::Mutex;

use serde_json::Value;

use crate::client::callbacks::{ClientCallbacks, FriendStatusChange, MessageAckEvent, ReceivedMessage};


#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    MessageAck(MessageAckEvent),
    SingleMessage(ReceivedMessage),
    FriendStatusChange(String, FriendStatusChange),
    MultiLogin(Value),
}

/// remembers all callback invocations in order
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
}

impl RecordingCallbacks {
    pub fn new() -> RecordingCallbacks {
        Default::default()
    }

    /// returns and forgets everything recorded so far
    pub fn take(&self) -> Vec<CallbackEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn acks(&self) -> Vec<MessageAckEvent> {
        self.events.lock().unwrap().iter()
            .filter_map(|e| match e {
                CallbackEvent::MessageAck(ack) => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: CallbackEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ClientCallbacks for RecordingCallbacks {
    fn on_message_ack(&self, event: MessageAckEvent) {
        self.record(CallbackEvent::MessageAck(event));
    }

    fn on_single_message(&self, message: ReceivedMessage) {
        self.record(CallbackEvent::SingleMessage(message));
    }

    fn on_friend_status_change(&self, friend_id: &str, change: FriendStatusChange) {
        self.record(CallbackEvent::FriendStatusChange(friend_id.to_string(), change));
    }

    fn on_multi_login(&self, body: &Value) {
        self.record(CallbackEvent::MultiLogin(body.clone()));
    }
}
