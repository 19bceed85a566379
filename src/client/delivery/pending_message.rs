use bytes::Bytes;
use tokio::task::AbortHandle;

use crate::client::callbacks::DeliveryStatus;


/// The acknowledgements an outgoing message collected so far.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct AckStatus {
    /// MESSAGE_ACK with `success=true`: the server persisted the message
    pub server_ack: bool,
    /// MESSAGE_RECEIVE_ACK: the receiver (or the server on its behalf) confirmed
    pub receiver_ack: bool,
    /// the server stands in for an offline receiver
    pub server_send: bool,
}

impl AckStatus {
    /// the terminal status if the acks collected so far finalize the message
    pub fn outcome(&self) -> Option<DeliveryStatus> {
        if !self.server_ack || !(self.receiver_ack || self.server_send) {
            return None;
        }
        if self.server_send {
            Some(DeliveryStatus::Sent)
        }
        else {
            Some(DeliveryStatus::Delivered)
        }
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimeoutAction {
    /// resend the frame, `attempt` is the new retry count
    Retry { attempt: u32 },
    GiveUp,
    /// the timer is outdated or the message is final anyway
    Ignore,
}


/// An outgoing message between sending and its final acknowledgement or failure. It keeps the
///  exact bytes that were sent, retries resend them verbatim.
///
/// Retries are driven from outside: each ack timer expiry is fed into
///  [PendingMessage::on_timeout], which decides what happens next.
#[derive(Debug)]
pub struct PendingMessage {
    pub conversation_id: String,
    pub frame: Bytes,
    pub retry_count: u32,
    pub ack_status: AckStatus,
    pub message_key: Option<i64>,
    pub message_sequence: Option<i64>,
    timer: Option<AbortHandle>,
}

impl PendingMessage {
    pub fn new(conversation_id: String, frame: Bytes) -> PendingMessage {
        PendingMessage {
            conversation_id,
            frame,
            retry_count: 0,
            ack_status: Default::default(),
            message_key: None,
            message_sequence: None,
            timer: None,
        }
    }

    /// replaces (and cancels) the current timer
    pub fn set_timer(&mut self, timer: AbortHandle) {
        self.cancel_timer();
        self.timer = Some(timer);
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn merge_ids(&mut self, message_key: Option<i64>, message_sequence: Option<i64>) {
        if message_key.is_some() {
            self.message_key = message_key;
        }
        if message_sequence.is_some() {
            self.message_sequence = message_sequence;
        }
    }

    pub fn on_server_ack(&mut self, message_key: Option<i64>, message_sequence: Option<i64>) -> Option<DeliveryStatus> {
        self.merge_ids(message_key, message_sequence);
        self.ack_status.server_ack = true;
        self.ack_status.outcome()
    }

    pub fn on_receive_ack(&mut self, message_key: Option<i64>, message_sequence: Option<i64>, server_send: bool) -> Option<DeliveryStatus> {
        self.merge_ids(message_key, message_sequence);
        self.ack_status.receiver_ack = true;
        self.ack_status.server_send = server_send;
        self.ack_status.outcome()
    }

    /// `attempt` is the retry count at the time the expired timer was started
    pub fn on_timeout(&mut self, attempt: u32, max_retries: u32) -> TimeoutAction {
        if attempt != self.retry_count || self.ack_status.outcome().is_some() {
            return TimeoutAction::Ignore;
        }
        if self.retry_count >= max_retries {
            return TimeoutAction::GiveUp;
        }
        self.retry_count += 1;
        TimeoutAction::Retry { attempt: self.retry_count }
    }
}

impl Drop for PendingMessage {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::nothing(false, false, false, None)]
    #[case::server_ack_only(true, false, false, None)]
    #[case::receiver_ack_only(false, true, false, None)]
    #[case::server_send_without_server_ack(false, true, true, None)]
    #[case::delivered(true, true, false, Some(DeliveryStatus::Delivered))]
    #[case::sent(true, true, true, Some(DeliveryStatus::Sent))]
    #[case::sent_without_receiver_ack(true, false, true, Some(DeliveryStatus::Sent))]
    fn test_outcome(#[case] server_ack: bool, #[case] receiver_ack: bool, #[case] server_send: bool, #[case] expected: Option<DeliveryStatus>) {
        let status = AckStatus { server_ack, receiver_ack, server_send };
        assert_eq!(status.outcome(), expected);
    }

    #[test]
    fn test_receive_ack_before_server_ack() {
        let mut msg = PendingMessage::new("u2".to_string(), Bytes::from_static(b"frame"));
        assert_eq!(msg.on_receive_ack(Some(11), None, false), None);
        assert_eq!(msg.on_server_ack(None, Some(22)), Some(DeliveryStatus::Delivered));
        assert_eq!(msg.message_key, Some(11));
        assert_eq!(msg.message_sequence, Some(22));
    }

    #[test]
    fn test_timeouts() {
        let mut msg = PendingMessage::new("u2".to_string(), Bytes::from_static(b"frame"));

        assert_eq!(msg.on_timeout(0, 3), TimeoutAction::Retry { attempt: 1 });
        // a late timer of an earlier attempt
        assert_eq!(msg.on_timeout(0, 3), TimeoutAction::Ignore);
        assert_eq!(msg.on_timeout(1, 3), TimeoutAction::Retry { attempt: 2 });
        assert_eq!(msg.on_timeout(2, 3), TimeoutAction::Retry { attempt: 3 });
        assert_eq!(msg.on_timeout(3, 3), TimeoutAction::GiveUp);
        assert_eq!(msg.retry_count, 3);
    }

    #[test]
    fn test_timeout_after_outcome() {
        let mut msg = PendingMessage::new("u2".to_string(), Bytes::from_static(b"frame"));
        msg.on_server_ack(None, None);
        msg.on_receive_ack(None, None, true);
        assert_eq!(msg.on_timeout(0, 3), TimeoutAction::Ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_timer() {
        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        });
        let mut msg = PendingMessage::new("u2".to_string(), Bytes::from_static(b"frame"));
        msg.set_timer(timer.abort_handle());
        drop(msg);

        assert!(timer.await.unwrap_err().is_cancelled());
    }
}
