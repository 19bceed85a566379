//! Reliable delivery of outgoing chat messages.
//!
//! Every message is tracked from sending until it is acknowledged twice (by the server, and by
//!  the receiver or the server on the receiver's behalf), refused by the server, or out of
//!  retries. Each of these ends is reported to the application exactly once.

pub mod pending_message;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::callbacks::{ClientCallbacks, DeliveryStatus, MessageAckEvent};
use crate::client::client_config::ClientConfig;
use crate::client::client_event::ClientEvent;
use crate::client::connection::Connection;
use crate::client::delivery::pending_message::{PendingMessage, TimeoutAction};
use crate::client::session::ClientSession;
use crate::clock::Clock;
use crate::protocol::bodies::{MessageAckBody, ReceiveAckNotice, SingleMessageBody};
use crate::protocol::command::{Command, MessageType};


pub const DEFAULT_SEND_FAILURE: &str = "message send failed";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SendResult {
    pub sent: bool,
    /// calibrated time stamp of the message, `i64::MAX` if it was not sent
    pub send_time: i64,
}

impl SendResult {
    pub const NOT_SENT: SendResult = SendResult {
        sent: false,
        send_time: i64::MAX,
    };
}


pub struct DeliveryEngine {
    config: Arc<ClientConfig>,
    session: Arc<ClientSession>,
    connection: Arc<dyn Connection>,
    clock: Arc<dyn Clock>,
    callbacks: Arc<dyn ClientCallbacks>,
    events: mpsc::Sender<ClientEvent>,
    pending: Mutex<FxHashMap<String, PendingMessage>>,
}

impl DeliveryEngine {
    pub fn new(
        config: Arc<ClientConfig>,
        session: Arc<ClientSession>,
        connection: Arc<dyn Connection>,
        clock: Arc<dyn Clock>,
        callbacks: Arc<dyn ClientCallbacks>,
        events: mpsc::Sender<ClientEvent>,
    ) -> DeliveryEngine {
        DeliveryEngine {
            config,
            session,
            connection,
            clock,
            callbacks,
            events,
            pending: Default::default(),
        }
    }

    /// Sends a chat message to `to_id`, which is also the message's conversation id.
    ///
    /// Without a connection, this triggers a reconnect and returns [SendResult::NOT_SENT]. The
    ///  message is not tracked in that case, and there is no ack callback for it.
    pub async fn send_message(&self, message_id: &str, to_id: &str, content: &str, message_type: MessageType) -> anyhow::Result<SendResult> {
        if !self.connection.has_active_channel() {
            info!("no connection to send message {} - reconnecting", message_id);
            self.connection.request_reconnect();
            return Ok(SendResult::NOT_SENT);
        }

        let send_time = self.clock.now_millis();
        let frame = self.session.frame_with(Command::SingleMessage, &SingleMessageBody {
            message_type: message_type.code(),
            from_id: self.session.user_id().to_string(),
            to_id: to_id.to_string(),
            message_id: message_id.to_string(),
            content: content.to_string(),
            send_time,
        })?;

        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(message_id) {
                bail!("message {} is already pending", message_id);
            }

            let mut msg = PendingMessage::new(to_id.to_string(), frame.clone());
            msg.set_timer(self.schedule_timeout(message_id, 0, self.config.ack_timeout));
            pending.insert(message_id.to_string(), msg);
        }

        debug!("sending message {} to {}", message_id, to_id);
        if let Err(e) = self.connection.send_raw(frame).await {
            // the message is tracked, the ack timer takes care of it
            warn!("failed to send message {}: {}", message_id, e);
        }
        Ok(SendResult { sent: true, send_time })
    }

    fn schedule_timeout(&self, message_id: &str, attempt: u32, delay: Duration) -> AbortHandle {
        let events = self.events.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(ClientEvent::AckTimeout { message_id, attempt }).await;
        })
            .abort_handle()
    }

    pub async fn on_message_ack(&self, ack: MessageAckBody) {
        let finalized = {
            let mut pending = self.pending.lock().await;
            let Some(msg) = pending.get_mut(&ack.message_id) else {
                debug!("MESSAGE_ACK for message {} which is not pending - ignoring", ack.message_id);
                return;
            };

            if ack.success {
                match msg.on_server_ack(ack.message_key, ack.message_sequence) {
                    Some(status) => Self::finalize(&mut pending, &ack.message_id, status, None),
                    None => None,
                }
            }
            else {
                let error_msg = ack.error_msg.unwrap_or_else(|| DEFAULT_SEND_FAILURE.to_string());
                warn!("server refused message {}: {}", ack.message_id, error_msg);
                msg.merge_ids(ack.message_key, ack.message_sequence);
                Self::finalize(&mut pending, &ack.message_id, DeliveryStatus::Failed, Some(error_msg))
            }
        };

        if let Some(event) = finalized {
            self.callbacks.on_message_ack(event);
        }
    }

    pub async fn on_receive_ack(&self, notice: ReceiveAckNotice) {
        let finalized = {
            let mut pending = self.pending.lock().await;
            let Some(msg) = pending.get_mut(&notice.message_id) else {
                debug!("MESSAGE_RECEIVE_ACK for message {} which is not pending - ignoring", notice.message_id);
                return;
            };

            match msg.on_receive_ack(notice.message_key, notice.message_sequence, notice.server_send) {
                Some(status) => Self::finalize(&mut pending, &notice.message_id, status, None),
                None => None,
            }
        };

        if let Some(event) = finalized {
            self.callbacks.on_message_ack(event);
        }
    }

    pub async fn on_ack_timeout(&self, message_id: &str, attempt: u32) {
        let (action, finalized) = {
            let mut pending = self.pending.lock().await;
            let Some(msg) = pending.get_mut(message_id) else {
                return;
            };

            match msg.on_timeout(attempt, self.config.max_retries) {
                TimeoutAction::Ignore => return,
                TimeoutAction::GiveUp => {
                    warn!("message {} was not acknowledged after {} retries", message_id, self.config.max_retries);
                    let error_msg = format!("not acknowledged after {} retries", self.config.max_retries);
                    (None, Self::finalize(&mut pending, message_id, DeliveryStatus::Failed, Some(error_msg)))
                }
                TimeoutAction::Retry { attempt } => {
                    msg.set_timer(self.schedule_timeout(message_id, attempt, self.config.retry_timeout));
                    (Some((attempt, msg.frame.clone())), None)
                }
            }
        };

        if let Some(event) = finalized {
            self.callbacks.on_message_ack(event);
        }

        if let Some((attempt, frame)) = action {
            if self.connection.has_active_channel() {
                info!("resending message {} (retry #{})", message_id, attempt);
                if let Err(e) = self.connection.send_raw(frame).await {
                    warn!("failed to resend message {}: {}", message_id, e);
                }
            }
            else {
                info!("no connection for retry #{} of message {} - reconnecting", attempt, message_id);
                self.connection.request_reconnect();
            }
        }
    }

    fn finalize(pending: &mut FxHashMap<String, PendingMessage>, message_id: &str, status: DeliveryStatus, error_msg: Option<String>) -> Option<MessageAckEvent> {
        // dropping the pending message cancels its timer
        let msg = pending.remove(message_id)?;
        debug!("message {} is final: {:?}", message_id, status);

        Some(MessageAckEvent {
            conversation_id: msg.conversation_id.clone(),
            message_id: message_id.to_string(),
            status,
            message_key: msg.message_key,
            message_sequence: msg.message_sequence,
            error_msg,
        })
    }

    pub async fn num_pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Forgets all pending messages and cancels their timers, without notifying the application.
    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            info!("discarding {} pending messages", pending.len());
        }
        pending.clear();
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::test_util::callbacks::RecordingCallbacks;
    use crate::test_util::clock::ManualClock;
    use crate::test_util::connection::{test_session, TrackingMockConnection};

    struct Fixture {
        engine: DeliveryEngine,
        connection: Arc<TrackingMockConnection>,
        callbacks: Arc<RecordingCallbacks>,
        events: mpsc::Receiver<ClientEvent>,
    }

    fn fixture(connected: bool) -> Fixture {
        let connection = Arc::new(TrackingMockConnection::new(connected));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let (event_send, events) = mpsc::channel(100);
        let engine = DeliveryEngine::new(
            Arc::new(ClientConfig::new()),
            Arc::new(test_session()),
            connection.clone(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            callbacks.clone(),
            event_send,
        );
        Fixture { engine, connection, callbacks, events }
    }

    impl Fixture {
        /// waits for the next ack timer and processes it the way the dispatcher does
        async fn next_timeout(&mut self) -> (String, u32) {
            match self.events.recv().await {
                Some(ClientEvent::AckTimeout { message_id, attempt }) => {
                    self.engine.on_ack_timeout(&message_id, attempt).await;
                    (message_id, attempt)
                }
                other => panic!("expected an ack timeout, got {:?}", other),
            }
        }
    }

    fn server_ack(message_id: &str) -> MessageAckBody {
        MessageAckBody {
            message_id: message_id.to_string(),
            success: true,
            message_key: Some(77),
            message_sequence: Some(5),
            error_msg: None,
        }
    }

    fn receive_ack(message_id: &str, server_send: bool) -> ReceiveAckNotice {
        ReceiveAckNotice {
            message_id: message_id.to_string(),
            message_key: Some(77),
            message_sequence: Some(5),
            server_send,
        }
    }

    fn ack_event(status: DeliveryStatus, error_msg: Option<&str>) -> MessageAckEvent {
        MessageAckEvent {
            conversation_id: "u2".to_string(),
            message_id: "m1".to_string(),
            status,
            message_key: Some(77),
            message_sequence: Some(5),
            error_msg: error_msg.map(|s| s.to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message() {
        let fixture = fixture(true);
        let result = fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        assert_eq!(result, SendResult { sent: true, send_time: 1_700_000_000_000 });

        let frame = fixture.connection.assert_frame_sent(Command::SingleMessage);
        assert_eq!(frame.body, Some(json!({
            "messageType": 1,
            "fromId": "u1",
            "toId": "u2",
            "messageId": "m1",
            "content": "hello",
            "sendTime": 1_700_000_000_000i64,
        })));
        assert_eq!(frame.device_id, "dev-1");
        assert_eq!(fixture.engine.num_pending().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_connection() {
        let fixture = fixture(false);
        let result = fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();

        assert_eq!(result, SendResult::NOT_SENT);
        assert_eq!(fixture.connection.num_reconnect_requests(), 1);
        assert_eq!(fixture.engine.num_pending().await, 0);
        fixture.connection.assert_no_remaining_frames();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_message_id() {
        let fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        assert!(fixture.engine.send_message("m1", "u2", "again", MessageType::Text).await.is_err());
        assert_eq!(fixture.engine.num_pending().await, 1);
    }

    #[rstest::rstest]
    #[case::delivered(false, DeliveryStatus::Delivered)]
    #[case::sent_by_server(true, DeliveryStatus::Sent)]
    #[tokio::test(start_paused = true)]
    async fn test_dual_ack(#[case] server_send: bool, #[case] expected: DeliveryStatus) {
        let fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();

        fixture.engine.on_message_ack(server_ack("m1")).await;
        assert!(fixture.callbacks.acks().is_empty());

        fixture.engine.on_receive_ack(receive_ack("m1", server_send)).await;
        assert_eq!(fixture.callbacks.acks(), vec![ack_event(expected, None)]);
        assert_eq!(fixture.engine.num_pending().await, 0);

        // duplicates are ignored
        fixture.engine.on_receive_ack(receive_ack("m1", server_send)).await;
        fixture.engine.on_message_ack(server_ack("m1")).await;
        assert_eq!(fixture.callbacks.acks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_ack_first() {
        let fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();

        fixture.engine.on_receive_ack(receive_ack("m1", false)).await;
        assert!(fixture.callbacks.acks().is_empty());

        fixture.engine.on_message_ack(server_ack("m1")).await;
        assert_eq!(fixture.callbacks.acks(), vec![ack_event(DeliveryStatus::Delivered, None)]);
    }

    #[rstest::rstest]
    #[case::with_message(Some("blocked"), "blocked")]
    #[case::default_message(None, DEFAULT_SEND_FAILURE)]
    #[tokio::test(start_paused = true)]
    async fn test_refused_by_server(#[case] error_msg: Option<&str>, #[case] expected: &str) {
        let mut fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();

        fixture.engine.on_message_ack(MessageAckBody {
            success: false,
            error_msg: error_msg.map(|s| s.to_string()),
            ..server_ack("m1")
        }).await;

        assert_eq!(fixture.callbacks.acks(), vec![ack_event(DeliveryStatus::Failed, Some(expected))]);
        assert_eq!(fixture.engine.num_pending().await, 0);

        // no timer is left
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_failure() {
        let mut fixture = fixture(true);
        let start = Instant::now();
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        let original = fixture.connection.sent_frames()[0].clone();
        fixture.connection.assert_frame_sent(Command::SingleMessage);

        for (retry, at_secs) in [(1, 15), (2, 20), (3, 25)] {
            assert_eq!(fixture.next_timeout().await, ("m1".to_string(), retry - 1));
            assert_eq!(start.elapsed(), Duration::from_secs(at_secs));
            assert!(start.elapsed() >= Duration::from_secs(5 * retry as u64));

            let resent = fixture.connection.sent_frames();
            assert_eq!(resent, vec![original.clone()]);
            fixture.connection.assert_frame_sent(Command::SingleMessage);
        }
        assert!(fixture.callbacks.acks().is_empty());

        fixture.next_timeout().await;
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        fixture.connection.assert_no_remaining_frames();
        assert_eq!(fixture.callbacks.acks(), vec![MessageAckEvent {
            conversation_id: "u2".to_string(),
            message_id: "m1".to_string(),
            status: DeliveryStatus::Failed,
            message_key: None,
            message_sequence: None,
            error_msg: Some("not acknowledged after 3 retries".to_string()),
        }]);
        assert_eq!(fixture.engine.num_pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_retry() {
        let mut fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();

        fixture.next_timeout().await;
        fixture.engine.on_message_ack(server_ack("m1")).await;
        fixture.engine.on_receive_ack(receive_ack("m1", true)).await;
        assert_eq!(fixture.callbacks.acks(), vec![ack_event(DeliveryStatus::Sent, None)]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_without_connection_still_counts() {
        let mut fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        fixture.connection.assert_frame_sent(Command::SingleMessage);
        fixture.connection.set_connected(false);

        for _ in 0..3 {
            fixture.next_timeout().await;
        }
        assert_eq!(fixture.connection.num_reconnect_requests(), 3);
        fixture.connection.assert_no_remaining_frames();

        fixture.next_timeout().await;
        assert_eq!(fixture.callbacks.acks().len(), 1);
        assert_eq!(fixture.callbacks.acks()[0].status, DeliveryStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_is_ignored() {
        let fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        fixture.connection.assert_frame_sent(Command::SingleMessage);

        fixture.engine.on_ack_timeout("m1", 0).await;
        fixture.engine.on_ack_timeout("m1", 0).await;
        fixture.connection.assert_frame_sent(Command::SingleMessage);
        fixture.connection.assert_no_remaining_frames();

        fixture.engine.on_ack_timeout("unknown", 0).await;
        assert!(fixture.callbacks.acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let mut fixture = fixture(true);
        fixture.engine.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        fixture.engine.send_message("m2", "u3", "hello", MessageType::Text).await.unwrap();

        fixture.engine.cancel_all().await;
        assert_eq!(fixture.engine.num_pending().await, 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(fixture.events.try_recv().is_err());
        assert!(fixture.callbacks.acks().is_empty());
    }
}
