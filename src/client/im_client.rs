use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::callbacks::ClientCallbacks;
use crate::client::client_config::ClientConfig;
use crate::client::connection::{Connection, ConnectionManager};
use crate::client::connection_state::ConnectionState;
use crate::client::delivery::{DeliveryEngine, SendResult};
use crate::client::dispatcher::Dispatcher;
use crate::client::session::{ClientSession, SessionParams};
use crate::clock::Clock;
use crate::protocol::bodies::MessageReadBody;
use crate::protocol::command::{Command, MessageType};
use crate::transport::Connector;


struct ClientCore {
    session: Arc<ClientSession>,
    connection: ConnectionManager,
    delivery: Arc<DeliveryEngine>,
    dispatcher: AbortHandle,
}

/// The client facade applications work with. It is created once and brought online with
///  [ImClient::init], after which it stays connected (reconnecting as necessary) until it is
///  destroyed or dropped.
pub struct ImClient {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    core: OnceLock<ClientCore>,
}

impl ImClient {
    /// `clock` provides the time stamps of outgoing messages, typically a calibrated clock
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>, clock: Arc<dyn Clock>) -> anyhow::Result<ImClient> {
        config.validate()?;

        Ok(ImClient {
            config: Arc::new(config),
            connector,
            clock,
            core: OnceLock::new(),
        })
    }

    /// Connects and logs in, returning once the server acknowledged the login. This retries
    ///  with a back-off until it succeeds or the client is destroyed.
    ///
    /// A client can be initialized only once.
    pub async fn init(&self, params: SessionParams, callbacks: Arc<dyn ClientCallbacks>) -> anyhow::Result<()> {
        if self.core.get().is_some() {
            bail!("client is already initialized");
        }

        let session = Arc::new(ClientSession::new(params, &self.config)?);
        let (event_send, event_recv) = mpsc::channel(self.config.event_queue_capacity);

        let connection = ConnectionManager::new(self.config.clone(), session.clone(), self.connector.clone(), event_send.clone())?;
        let delivery = Arc::new(DeliveryEngine::new(
            self.config.clone(),
            session.clone(),
            Arc::new(connection.clone()),
            self.clock.clone(),
            callbacks.clone(),
            event_send,
        ));

        let dispatcher = Dispatcher::new(session.clone(), Arc::new(connection.clone()), delivery.clone(), callbacks);
        let dispatcher = tokio::spawn(dispatcher.run(event_recv)).abort_handle();

        let core = ClientCore {
            session,
            connection: connection.clone(),
            delivery,
            dispatcher,
        };
        if let Err(core) = self.core.set(core) {
            // a concurrent init won
            core.dispatcher.abort();
            bail!("client is already initialized");
        }

        info!("initialized client for user {}", self.session()?.user_id());
        connection.connect().await
    }

    pub fn is_init(&self) -> bool {
        self.core.get().is_some()
    }

    fn core(&self) -> anyhow::Result<&ClientCore> {
        self.core.get()
            .ok_or_else(|| anyhow!("client is not initialized"))
    }

    pub fn session(&self) -> anyhow::Result<&ClientSession> {
        Ok(&self.core()?.session)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.get()
            .map(|core| core.connection.state())
            .unwrap_or(ConnectionState::Init)
    }

    /// Sends a chat message to `to_id`. Its final delivery status is reported through
    ///  [ClientCallbacks::on_message_ack] if (and only if) the result says it was sent.
    pub async fn send_message(&self, message_id: &str, to_id: &str, content: &str, message_type: MessageType) -> anyhow::Result<SendResult> {
        self.core()?.delivery.send_message(message_id, to_id, content, message_type).await
    }

    /// Marks everything in a conversation up to `last_sequence` as read. This is fire and
    ///  forget: there is no acknowledgement and no retry. Returns false if there is no
    ///  connection (which triggers a reconnect).
    pub async fn mark_message_read(&self, last_sequence: i64, to_id: &str, conversation_type: u32) -> anyhow::Result<bool> {
        let core = self.core()?;
        if !core.connection.has_active_channel() {
            core.connection.request_reconnect();
            return Ok(false);
        }

        let frame = core.session.frame_with(Command::MessageRead, &MessageReadBody {
            from_id: core.session.user_id().to_string(),
            to_id: to_id.to_string(),
            last_sequence,
            conversation_type,
        })?;
        core.connection.send_raw(frame).await?;
        Ok(true)
    }

    pub fn generate_message_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Takes the client offline for good: closes the connection and stops all timers. Pending
    ///  messages are discarded without callbacks.
    pub async fn destroy(&self) {
        let Some(core) = self.core.get() else {
            debug!("destroying a client that was never initialized");
            return;
        };

        core.dispatcher.abort();
        core.connection.shut_down().await;
        core.delivery.cancel_all().await;
    }
}

impl Drop for ImClient {
    fn drop(&mut self) {
        if let Some(core) = self.core.get() {
            core.dispatcher.abort();
            // the channel closes when its last reference is gone
            let _ = core.connection.begin_shut_down();
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::sleep;

    use super::*;
    use crate::client::callbacks::{DeliveryStatus, ReceivedMessage};
    use crate::protocol::frame::InboundFrame;
    use crate::test_util::callbacks::{CallbackEvent, RecordingCallbacks};
    use crate::test_util::clock::ManualClock;
    use crate::test_util::connection::{test_session_params, InMemoryConnector, ServerSide};

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        client: Arc<ImClient>,
        connector: Arc<InMemoryConnector>,
        callbacks: Arc<RecordingCallbacks>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let connector = Arc::new(InMemoryConnector::new());
            let client = ImClient::new(ClientConfig::new(), connector.clone(), Arc::new(ManualClock::new(NOW))).unwrap();
            Fixture {
                client: Arc::new(client),
                connector,
                callbacks: Arc::new(RecordingCallbacks::new()),
            }
        }

        async fn init(&self) -> ServerSide {
            let client = self.client.clone();
            let callbacks = self.callbacks.clone();
            let init = tokio::spawn(async move {
                client.init(test_session_params(), callbacks).await
            });

            let mut server = self.connector.next_connection().await;
            server.accept_login().await;
            init.await.unwrap().unwrap();
            server
        }
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = ClientConfig::new();
        config.protocol_version = "1.0".to_string();
        assert!(ImClient::new(config, Arc::new(InMemoryConnector::new()), Arc::new(ManualClock::new(NOW))).is_err());
    }

    #[tokio::test]
    async fn test_init_once() {
        let fixture = Fixture::new();
        assert!(!fixture.client.is_init());
        assert_eq!(fixture.client.connection_state(), ConnectionState::Init);

        let _server = fixture.init().await;
        assert!(fixture.client.is_init());
        assert_eq!(fixture.client.connection_state(), ConnectionState::Connected);
        assert_eq!(fixture.client.session().unwrap().user_id(), "u1");

        assert!(fixture.client.init(test_session_params(), fixture.callbacks.clone()).await.is_err());
        assert_eq!(fixture.connector.num_connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let fixture = Fixture::new();
        assert!(fixture.client.send_message("m1", "u2", "hi", MessageType::Text).await.is_err());
        assert!(fixture.client.mark_message_read(5, "u2", 0).await.is_err());
        fixture.client.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_round_trip() {
        let fixture = Fixture::new();
        let mut server = fixture.init().await;

        let result = fixture.client.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        assert_eq!(result, SendResult { sent: true, send_time: NOW });

        let frame = server.expect_frame(Command::SingleMessage).await;
        assert_eq!(frame.body.unwrap()["messageId"], "m1");

        server.send(InboundFrame::new(Command::MessageAck, json!({
            "messageId": "m1", "success": true, "messageKey": 77, "messageSequence": 5,
        }))).await;
        server.send(InboundFrame::new(Command::MessageReceiveAck, json!({
            "messageId": "m1", "serverSend": false,
        }))).await;
        sleep(Duration::from_millis(10)).await;

        let acks = fixture.callbacks.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, DeliveryStatus::Delivered);
        assert_eq!(acks[0].message_key, Some(77));

        // no retry after the final ack
        sleep(Duration::from_secs(30)).await;
        assert!(server.try_recv_frame().map(|f| f.known_command() == Some(Command::HeartBeat)).unwrap_or(true));
    }

    #[tokio::test]
    async fn test_incoming_message_is_acked() {
        let fixture = Fixture::new();
        let mut server = fixture.init().await;

        server.send(InboundFrame::new(Command::SingleMessage, json!({
            "fromId": "u2", "messageKey": 3, "messageId": "m9", "messageType": 1,
            "messageBody": "hey", "sendTime": 42, "messageSequence": 8,
        }))).await;

        let ack = server.expect_frame(Command::MessageReceiveAck).await;
        let body = ack.body.unwrap();
        assert_eq!(body["toId"], "u2");
        assert_eq!(body["messageId"], "m9");

        assert_eq!(fixture.callbacks.take(), vec![CallbackEvent::SingleMessage(ReceivedMessage {
            sender_id: "u2".to_string(),
            key: Some(3),
            id: "m9".to_string(),
            message_type: 1,
            content: "hey".to_string(),
            send_time: 42,
            sequence: Some(8),
        })]);
    }

    #[tokio::test]
    async fn test_mark_message_read() {
        let fixture = Fixture::new();
        let mut server = fixture.init().await;

        assert!(fixture.client.mark_message_read(12, "u2", 0).await.unwrap());
        let frame = server.expect_frame(Command::MessageRead).await;
        assert_eq!(frame.body, Some(json!({
            "fromId": "u1", "toId": "u2", "lastSequence": 12, "conversationType": 0,
        })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_send_triggers_reconnect() {
        let fixture = Fixture::new();
        let server = fixture.init().await;

        server.close().await;
        sleep(Duration::from_millis(10)).await;
        // the loss was processed, and a new connection is being established
        assert_eq!(fixture.client.connection_state(), ConnectionState::Reconnecting);

        let result = fixture.client.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        assert_eq!(result, SendResult::NOT_SENT);
        assert!(!fixture.client.mark_message_read(1, "u2", 0).await.unwrap());

        let mut server = fixture.connector.next_connection().await;
        server.accept_login().await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(fixture.client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy() {
        let fixture = Fixture::new();
        let mut server = fixture.init().await;

        fixture.client.send_message("m1", "u2", "hello", MessageType::Text).await.unwrap();
        server.expect_frame(Command::SingleMessage).await;

        fixture.client.destroy().await;
        assert_eq!(fixture.client.connection_state(), ConnectionState::Disconnecting);
        assert!(!server.is_open());

        // no retries, no give-up callback, no reconnect
        sleep(Duration::from_secs(120)).await;
        assert!(fixture.callbacks.take().is_empty());
        assert_eq!(fixture.connector.num_connect_attempts(), 1);
        assert_eq!(fixture.client.send_message("m2", "u2", "hello", MessageType::Text).await.unwrap(), SendResult::NOT_SENT);
    }

    #[test]
    fn test_generate_message_id() {
        let a = ImClient::generate_message_id();
        let b = ImClient::generate_message_id();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
