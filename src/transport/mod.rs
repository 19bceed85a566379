pub mod websocket;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;


/// Everything a connection reports after it was opened. Events of a single connection arrive
///  in order on that connection's receiver, and `Error` / `Closed` are the last events.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    /// a complete binary frame
    Frame(Bytes),
    Error(String),
    Closed,
}

/// An open duplex connection to the IM server.
#[async_trait]
pub trait Channel: Debug + Send + Sync + 'static {
    async fn send(&self, frame: Bytes) -> anyhow::Result<()>;

    fn is_open(&self) -> bool;

    /// Closing is best effort. The connection's event stream ends without a `Closed` event when
    ///  the close was initiated locally.
    async fn close(&self);
}

/// This trait decouples the connection lifecycle (login, heartbeat, reconnect) from the way
///  bytes get to the server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> anyhow::Result<(Arc<dyn Channel>, mpsc::Receiver<TransportEvent>)>;
}
