use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use crate::client::client_config::ClientConfig;
use crate::client::connection::Connection;
use crate::client::session::{ClientSession, SessionParams};
use crate::protocol::command::Command;
use crate::protocol::frame::{InboundFrame, OutboundFrame};
use crate::transport::{Channel, Connector, TransportEvent};


pub fn test_session_params() -> SessionParams {
    SessionParams {
        ws_url: "ws://im.test/ws".to_string(),
        http_url: "http://im.test".to_string(),
        user_id: "u1".to_string(),
        token: "t1".to_string(),
        app_id: 10000,
        device_id: "dev-1".to_string(),
    }
}

/// user `u1` with token `t1`, app id 10000, device id `dev-1`, default client config
pub fn test_session() -> ClientSession {
    ClientSession::new(test_session_params(), &ClientConfig::new())
        .expect("default config is valid")
}


/// A [Connector] that connects to the test itself: every successful `connect()` hands the
///  server end of the new connection to the test through [InMemoryConnector::next_connection].
pub struct InMemoryConnector {
    accepted_send: mpsc::UnboundedSender<ServerSide>,
    accepted_recv: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerSide>>,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
}

impl InMemoryConnector {
    pub fn new() -> InMemoryConnector {
        let (accepted_send, accepted_recv) = mpsc::unbounded_channel();
        InMemoryConnector {
            accepted_send,
            accepted_recv: tokio::sync::Mutex::new(accepted_recv),
            refuse: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// the next `n` connection attempts fail
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn num_connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn next_connection(&self) -> ServerSide {
        self.accepted_recv.lock().await
            .recv().await
            .expect("connector was dropped")
    }
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        InMemoryConnector::new()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<(Arc<dyn Channel>, mpsc::Receiver<TransportEvent>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            bail!("connection to {} refused", url);
        }

        let (to_client, client_events) = mpsc::channel(1024);
        let (to_server, from_client) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        self.accepted_send.send(ServerSide {
            to_client,
            from_client,
            open: open.clone(),
        })
            .map_err(|_| anyhow!("nobody accepts connections"))?;

        Ok((Arc::new(InMemoryChannel { to_server, open }), client_events))
    }
}


struct InMemoryChannel {
    to_server: mpsc::UnboundedSender<Bytes>,
    open: Arc<AtomicBool>,
}

impl Debug for InMemoryChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InMemoryChannel{{open:{}}}", self.is_open())
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        if !self.is_open() {
            bail!("channel is closed");
        }
        self.to_server.send(frame)
            .map_err(|_| anyhow!("server side is gone"))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}


/// The server end of an in-memory connection.
pub struct ServerSide {
    to_client: mpsc::Sender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
    open: Arc<AtomicBool>,
}

impl ServerSide {
    /// `None` once the client dropped the connection
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
            .map(|buf| OutboundFrame::try_decode(&buf).expect("client sent an invalid frame"))
    }

    pub fn try_recv_frame(&mut self) -> Option<OutboundFrame> {
        self.from_client.try_recv().ok()
            .map(|buf| OutboundFrame::try_decode(&buf).expect("client sent an invalid frame"))
    }

    /// Waits for the next frame with the given command. Heartbeats are skipped unless they are
    ///  what the test waits for, any other frame is a test failure.
    pub async fn expect_frame(&mut self, command: Command) -> OutboundFrame {
        loop {
            let frame = self.recv_frame().await
                .unwrap_or_else(|| panic!("connection closed while waiting for {:?}", command));
            match frame.known_command() {
                Some(actual) if actual == command => return frame,
                Some(Command::HeartBeat) => continue,
                other => panic!("expected {:?}, got {:?}: {:?}", command, other, frame),
            }
        }
    }

    pub async fn accept_login(&mut self) -> OutboundFrame {
        let login = self.expect_frame(Command::Login).await;
        self.send_login_ack().await;
        login
    }

    pub async fn send_login_ack(&self) {
        self.send(InboundFrame::new(Command::LoginAck, json!({}))).await;
    }

    pub async fn send(&self, frame: InboundFrame) {
        self.send_bytes(frame.encode().expect("frame can be encoded")).await;
    }

    pub async fn send_bytes(&self, buf: Bytes) {
        let _ = self.to_client.send(TransportEvent::Frame(buf)).await;
    }

    pub async fn fail(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.to_client.send(TransportEvent::Error(reason.to_string())).await;
    }

    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.to_client.send(TransportEvent::Closed).await;
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}


/// A [Connection] that records sent frames instead of sending them, for testing code on top
///  of a connection without running a connection lifecycle.
#[derive(Default)]
pub struct TrackingMockConnection {
    connected: AtomicBool,
    shut_down: AtomicBool,
    sent: Mutex<VecDeque<Bytes>>,
    reconnect_requests: AtomicUsize,
    lost: Mutex<Vec<u64>>,
}

impl TrackingMockConnection {
    pub fn new(connected: bool) -> TrackingMockConnection {
        TrackingMockConnection {
            connected: AtomicBool::new(connected),
            ..Default::default()
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    pub fn num_reconnect_requests(&self) -> usize {
        self.reconnect_requests.load(Ordering::SeqCst)
    }

    pub fn lost_generations(&self) -> Vec<u64> {
        self.lost.lock().unwrap().clone()
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().iter().cloned().collect()
    }

    pub fn assert_frame_sent(&self, command: Command) -> OutboundFrame {
        let buf = self.sent.lock().unwrap().pop_front()
            .unwrap_or_else(|| panic!("no frame was sent, expected {:?}", command));
        let frame = OutboundFrame::try_decode(&buf).expect("invalid frame");
        assert_eq!(frame.known_command(), Some(command), "{:?}", frame);
        frame
    }

    pub fn assert_no_remaining_frames(&self) {
        let sent = self.sent.lock().unwrap();
        assert!(sent.is_empty(), "unexpected frames: {:?}", sent);
    }
}

#[async_trait]
impl Connection for TrackingMockConnection {
    fn has_active_channel(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_raw(&self, frame: Bytes) -> anyhow::Result<()> {
        if !self.has_active_channel() {
            self.request_reconnect();
            bail!("no active connection");
        }
        self.sent.lock().unwrap().push_back(frame);
        Ok(())
    }

    fn request_reconnect(&self) {
        self.reconnect_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transport_lost(&self, generation: u64, _reason: &str) {
        self.lost.lock().unwrap().push(generation);
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
