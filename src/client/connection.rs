use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::client::client_config::ClientConfig;
use crate::client::client_event::ClientEvent;
use crate::client::connection_state::ConnectionState;
use crate::client::session::ClientSession;
use crate::protocol::command::Command;
use crate::protocol::frame::InboundFrame;
use crate::transport::{Channel, Connector, TransportEvent};


/// The connection as seen by the code that sends frames and reacts to connection loss.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// true if the client is logged in and the channel is open
    fn has_active_channel(&self) -> bool;

    /// Sends a complete frame. Without an active channel, this triggers a reconnect and fails.
    async fn send_raw(&self, frame: Bytes) -> anyhow::Result<()>;

    fn request_reconnect(&self);

    fn on_transport_lost(&self, generation: u64, reason: &str);

    fn is_shut_down(&self) -> bool;
}


struct ActiveChannel {
    generation: u64,
    channel: Arc<dyn Channel>,
}

struct ConnectionData {
    state: ConnectionState,
    channel: Option<ActiveChannel>,
    heartbeat: Option<AbortHandle>,
    pump: Option<AbortHandle>,
    connect_loop: Option<AbortHandle>,
}

struct Inner {
    config: Arc<ClientConfig>,
    session: Arc<ClientSession>,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<ClientEvent>,
    heartbeat_frame: Bytes,
    shutdown: broadcast::Sender<()>,
    generation_counter: AtomicU64,
    data: Mutex<ConnectionData>,
}


/// Owns the connection to the IM server and runs its lifecycle: connect and log in, send
///  heartbeats while connected, and reconnect after the connection is lost, for as long as
///  it takes.
///
/// Inbound frames and connection loss are reported as [ClientEvent]s on the client's event
///  queue. Connection loss is handled when that event is processed, see
///  [Connection::on_transport_lost].
///
/// This is a cheap handle, clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Debug for ConnectionManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionManager{{url:{}, state:{}}}", self.inner.session.ws_url(), self.state())
    }
}

impl ConnectionManager {
    pub fn new(
        config: Arc<ClientConfig>,
        session: Arc<ClientSession>,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<ClientEvent>,
    ) -> anyhow::Result<ConnectionManager> {
        let heartbeat_frame = session.heartbeat_frame()?;
        let (shutdown, _) = broadcast::channel(1);

        Ok(ConnectionManager {
            inner: Arc::new(Inner {
                config,
                session,
                connector,
                events,
                heartbeat_frame,
                shutdown,
                generation_counter: AtomicU64::new(0),
                data: Mutex::new(ConnectionData {
                    state: ConnectionState::Init,
                    channel: None,
                    heartbeat: None,
                    pump: None,
                    connect_loop: None,
                }),
            }),
        })
    }

    fn data(&self) -> MutexGuard<'_, ConnectionData> {
        self.inner.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.data().state
    }

    /// Brings the connection up for the first time, returning once the client is logged in.
    ///  This keeps trying until it succeeds or the connection is shut down.
    pub async fn connect(&self) -> anyhow::Result<()> {
        {
            let mut data = self.data();
            if data.state != ConnectionState::Init {
                bail!("connection was started before, state is {}", data.state);
            }
            data.state = ConnectionState::Connecting;
        }
        self.connect_loop().await
    }

    /// Starts a reconnect loop if the connection is down. Concurrent triggers (e.g. a transport
    ///  error followed by a close) start only one loop.
    pub fn trigger_reconnect(&self) {
        let mut data = self.data();
        match data.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                debug!("reconnect requested while already connecting - ignoring");
                return;
            }
            state => {
                debug!("reconnect requested in state {} - ignoring", state);
                return;
            }
        }

        info!("reconnecting");
        data.state = ConnectionState::Reconnecting;
        let cloned_self = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = cloned_self.connect_loop().await {
                debug!("reconnect loop ended: {}", e);
            }
        });
        data.connect_loop = Some(handle.abort_handle());
    }

    #[instrument(level = "debug", skip_all, fields(url = self.inner.session.ws_url()))]
    async fn connect_loop(&self) -> anyhow::Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let config = &self.inner.config;

        loop {
            if self.is_shut_down() {
                bail!("connection was shut down");
            }

            let generation = self.inner.generation_counter.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("connecting to {} (#{})", self.inner.session.ws_url(), generation);

            let outcome = select! {
                outcome = timeout(config.login_timeout, self.open_and_login()) => outcome,
                _ = shutdown.recv() => bail!("connection was shut down while connecting"),
            };
            match outcome {
                Ok(Ok((channel, transport_events))) => {
                    if self.on_connected(generation, channel, transport_events) {
                        return Ok(());
                    }
                    bail!("connection was shut down while connecting");
                }
                Ok(Err(e)) => warn!("connection attempt #{} failed: {:#}", generation, e),
                Err(_) => warn!("connection attempt #{}: no LOGIN_ACK within {:?}", generation, config.login_timeout),
            }

            select! {
                _ = sleep(config.reconnect_backoff) => {}
                _ = shutdown.recv() => bail!("connection was shut down while waiting to reconnect"),
            }
        }
    }

    async fn open_and_login(&self) -> anyhow::Result<(Arc<dyn Channel>, mpsc::Receiver<TransportEvent>)> {
        let (channel, mut transport_events) = self.inner.connector.connect(self.inner.session.ws_url()).await?;
        channel.send(self.inner.session.login_frame()?).await?;
        debug!("sent LOGIN for user {}", self.inner.session.user_id());

        loop {
            match transport_events.recv().await {
                Some(TransportEvent::Frame(frame)) => {
                    let is_login_ack = InboundFrame::try_decode(&frame)
                        .map(|f| f.known_command() == Some(Command::LoginAck))
                        .unwrap_or(false);
                    if is_login_ack {
                        return Ok((channel, transport_events));
                    }
                    // anything the server sends ahead of LOGIN_ACK is processed as usual
                    let _ = self.inner.events.send(ClientEvent::Inbound(frame)).await;
                }
                Some(TransportEvent::Error(e)) => bail!("transport error before LOGIN_ACK: {}", e),
                Some(TransportEvent::Closed) | None => bail!("connection closed before LOGIN_ACK"),
            }
        }
    }

    /// returns false if the connection was shut down in the meantime
    fn on_connected(&self, generation: u64, channel: Arc<dyn Channel>, transport_events: mpsc::Receiver<TransportEvent>) -> bool {
        let mut data = self.data();
        if data.state == ConnectionState::Disconnecting {
            return false;
        }

        info!("connected and logged in as {} (#{})", self.inner.session.user_id(), generation);
        data.state = ConnectionState::Connected;
        data.pump = Some(self.spawn_pump(generation, transport_events));
        data.heartbeat = Some(self.spawn_heartbeat(channel.clone()));
        data.channel = Some(ActiveChannel { generation, channel });
        data.connect_loop = None;
        true
    }

    /// forwards a connection's events to the client's event queue
    fn spawn_pump(&self, generation: u64, mut transport_events: mpsc::Receiver<TransportEvent>) -> AbortHandle {
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            let reason = loop {
                match transport_events.recv().await {
                    Some(TransportEvent::Frame(frame)) => {
                        trace!("received frame of {} bytes", frame.len());
                        if events.send(ClientEvent::Inbound(frame)).await.is_err() {
                            return;
                        }
                    }
                    Some(TransportEvent::Error(e)) => break e,
                    Some(TransportEvent::Closed) => break "closed by peer".to_string(),
                    None => break "transport event stream ended".to_string(),
                }
            };
            let _ = events.send(ClientEvent::TransportLost { generation, reason }).await;
        })
            .abort_handle()
    }

    fn spawn_heartbeat(&self, channel: Arc<dyn Channel>) -> AbortHandle {
        let period = self.inner.config.heartbeat_interval;
        let frame = self.inner.heartbeat_frame.clone();

        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if channel.is_open() {
                    trace!("sending heartbeat");
                    if let Err(e) = channel.send(frame.clone()).await {
                        warn!("failed to send heartbeat: {}", e);
                    }
                }
            }
        })
            .abort_handle()
    }

    fn active_channel(&self) -> Option<Arc<dyn Channel>> {
        let data = self.data();
        if data.state != ConnectionState::Connected {
            return None;
        }
        data.channel.as_ref()
            .map(|a| a.channel.clone())
    }

    /// Stops all connection activity. This is final: a connection that was shut down does not
    ///  connect again.
    pub async fn shut_down(&self) {
        if let Some(channel) = self.begin_shut_down() {
            channel.close().await;
        }
    }

    /// the synchronous part of shutting down, returns the channel to be closed
    pub(crate) fn begin_shut_down(&self) -> Option<Arc<dyn Channel>> {
        let channel = {
            let mut data = self.data();
            if data.state == ConnectionState::Disconnecting {
                return None;
            }
            info!("shutting down connection in state {}", data.state);
            data.state = ConnectionState::Disconnecting;

            for task in [data.heartbeat.take(), data.pump.take(), data.connect_loop.take()].into_iter().flatten() {
                task.abort();
            }
            data.channel.take()
        };

        let _ = self.inner.shutdown.send(());
        channel.map(|a| a.channel)
    }
}

#[async_trait]
impl Connection for ConnectionManager {
    fn has_active_channel(&self) -> bool {
        self.active_channel()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    async fn send_raw(&self, frame: Bytes) -> anyhow::Result<()> {
        match self.active_channel() {
            Some(channel) if channel.is_open() => channel.send(frame).await,
            _ => {
                self.request_reconnect();
                bail!("no active connection");
            }
        }
    }

    fn request_reconnect(&self) {
        // a channel can be closed before its pump reported the loss
        let closed_generation = {
            let data = self.data();
            match &data.channel {
                Some(active) if !active.channel.is_open() => Some(active.generation),
                _ => None,
            }
        };

        match closed_generation {
            Some(generation) => self.on_transport_lost(generation, "channel is closed"),
            None => self.trigger_reconnect(),
        }
    }

    fn on_transport_lost(&self, generation: u64, reason: &str) {
        {
            let mut data = self.data();
            let is_current = data.state == ConnectionState::Connected
                && data.channel.as_ref().map(|a| a.generation) == Some(generation);
            if !is_current {
                debug!("ignoring loss of connection #{} in state {}: {}", generation, data.state, reason);
                return;
            }

            warn!("connection #{} lost: {}", generation, reason);
            data.state = ConnectionState::Disconnected;
            if let Some(heartbeat) = data.heartbeat.take() {
                heartbeat.abort();
            }
            data.pump = None;
            data.channel = None;
        }

        self.trigger_reconnect();
    }

    fn is_shut_down(&self) -> bool {
        self.state() == ConnectionState::Disconnecting
    }
}
