use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::transport::{Channel, Connector, TransportEvent};


/// events buffered per connection before the reader stops pulling from the socket
const EVENT_BUFFER_SIZE: usize = 1024;

/// how long the closing handshake may take before the socket is simply dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;


/// Connects over WebSocket (`ws://` or `wss://`). IM frames travel as binary messages, text
///  messages are not part of the protocol and are skipped.
#[derive(Debug, Default)]
pub struct WebSocketConnector {}

impl WebSocketConnector {
    pub fn new() -> WebSocketConnector {
        WebSocketConnector {}
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<(Arc<dyn Channel>, mpsc::Receiver<TransportEvent>)> {
        debug!("opening websocket to {}", url);
        let (ws_stream, _) = connect_async(url).await
            .with_context(|| format!("failed to connect websocket: {}", url))?;
        let (sink, mut stream) = ws_stream.split();

        let (event_send, event_recv) = mpsc::channel(EVENT_BUFFER_SIZE);
        let open = Arc::new(AtomicBool::new(true));

        let reader_open = open.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        trace!("received {} bytes", data.len());
                        if event_send.send(TransportEvent::Frame(Bytes::from(data))).await.is_err() {
                            // nobody is listening any more
                            return;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        debug!("skipping text message of {} bytes", text.len());
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("server closed the websocket: {:?}", frame);
                        break;
                    }
                    Ok(_) => {} // ping / pong are handled by tungstenite
                    Err(e) => {
                        warn!("websocket receive failed: {}", e);
                        reader_open.store(false, Ordering::Release);
                        let _ = event_send.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }
            reader_open.store(false, Ordering::Release);
            let _ = event_send.send(TransportEvent::Closed).await;
        });

        let channel = WebSocketChannel {
            url: url.to_string(),
            sink: Mutex::new(sink),
            open,
            reader: reader.abort_handle(),
        };
        Ok((Arc::new(channel), event_recv))
    }
}


pub struct WebSocketChannel {
    url: String,
    sink: Mutex<WsSink>,
    open: Arc<AtomicBool>,
    reader: AbortHandle,
}

impl Debug for WebSocketChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WebSocketChannel{{url:{}, open:{}}}", self.url, self.is_open())
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        if !self.is_open() {
            bail!("websocket to {} is closed", self.url);
        }

        trace!("sending {} bytes", frame.len());
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
            self.open.store(false, Ordering::Release);
            bail!("websocket send failed: {}", e);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.reader.abort();
        let close = async {
            self.sink.lock().await.close().await
        };
        match timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("error closing websocket to {}: {}", self.url, e),
            Err(_) => warn!("closing websocket to {} timed out after {:?}, dropping it", self.url, CLOSE_TIMEOUT),
        }
    }
}
