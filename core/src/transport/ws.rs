// WebSocket reference transport — JSON frames as text messages over
// tokio-tungstenite. A spawned reader task decodes incoming frames into an
// inbox channel; `recv` drains the inbox.

use super::abstraction::{Connector, Link, LinkCounters, LinkState, LinkStats, TransportError};
use crate::message::{codec, Frame};
use crate::relay::RelayEndpoint;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug)]
pub struct WsLink {
    endpoint_id: String,
    sink: Mutex<WsSink>,
    inbox: Mutex<mpsc::UnboundedReceiver<Frame>>,
    state: Arc<RwLock<LinkState>>,
    counters: Arc<LinkCounters>,
    reader: tokio::task::JoinHandle<()>,
}

impl WsLink {
    fn spawn_reader(
        mut source: WsSource,
        tx: mpsc::UnboundedSender<Frame>,
        state: Arc<RwLock<LinkState>>,
        counters: Arc<LinkCounters>,
        endpoint_id: String,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                match next {
                    Ok(WsMessage::Text(text)) => {
                        match codec::decode_frame(text.as_bytes()) {
                            Ok(frame) => {
                                counters.record_received();
                                if tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                counters.record_error();
                                warn!(endpoint = %endpoint_id, error = %e, "dropping undecodable frame");
                            }
                        }
                    }
                    Ok(WsMessage::Binary(bytes)) => match codec::decode_frame(&bytes) {
                        Ok(frame) => {
                            counters.record_received();
                            if tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            counters.record_error();
                            warn!(endpoint = %endpoint_id, error = %e, "dropping undecodable frame");
                        }
                    },
                    Ok(WsMessage::Close(_)) => {
                        *state.write() = LinkState::Disconnected;
                        break;
                    }
                    Ok(_) => {} // ping/pong handled by tungstenite
                    Err(e) => {
                        counters.record_error();
                        warn!(endpoint = %endpoint_id, error = %e, "read error, failing link");
                        *state.write() = LinkState::Failed;
                        break;
                    }
                }
            }
            debug!(endpoint = %endpoint_id, "reader task finished");
        })
    }
}

#[async_trait]
impl Link for WsLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !matches!(self.state(), LinkState::Connected) {
            return Err(TransportError::Closed("link not connected".to_string()));
        }

        let bytes = codec::encode_frame(&frame).map_err(|e| TransportError::Wire(e.to_string()))?;
        let text =
            String::from_utf8(bytes).map_err(|e| TransportError::Wire(e.to_string()))?;

        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(text)).await.map_err(|e| {
            self.counters.record_error();
            *self.state.write() = LinkState::Failed;
            TransportError::SendFailed(e.to_string())
        })?;
        self.counters.record_sent();
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut inbox = self.inbox.lock().await;
        inbox
            .recv()
            .await
            .ok_or_else(|| TransportError::Closed("connection gone".to_string()))
    }

    async fn close(&self, reason: &str) -> Result<(), TransportError> {
        *self.state.write() = LinkState::Disconnecting;

        let mut sink = self.sink.lock().await;
        if let Ok(bytes) = codec::encode_frame(&Frame::Disconnect {
            reason: reason.to_string(),
        }) {
            if let Ok(text) = String::from_utf8(bytes) {
                let _ = sink.send(WsMessage::Text(text)).await;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;

        self.reader.abort();
        *self.state.write() = LinkState::Disconnected;
        debug!(endpoint = %self.endpoint_id, reason, "link closed");
        Ok(())
    }

    fn state(&self) -> LinkState {
        *self.state.read()
    }

    fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }

    fn endpoint_id(&self) -> String {
        self.endpoint_id.clone()
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connector that dials relay endpoints over WebSocket
#[derive(Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &RelayEndpoint,
        timeout: Duration,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let connect = connect_async(endpoint.url.as_str());
        let (stream, _response) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| match e {
                WsError::Tls(tls) => TransportError::Tls(tls.to_string()),
                other => TransportError::Refused(other.to_string()),
            })?;

        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(LinkState::Connected));
        let counters = Arc::new(LinkCounters::new());

        let reader = WsLink::spawn_reader(
            source,
            tx,
            Arc::clone(&state),
            Arc::clone(&counters),
            endpoint.id.clone(),
        );

        debug!(endpoint = %endpoint.id, url = %endpoint.url, "websocket link established");
        Ok(Arc::new(WsLink {
            endpoint_id: endpoint.id.clone(),
            sink: Mutex::new(sink),
            inbox: Mutex::new(rx),
            state,
            counters,
            reader,
        }))
    }
}
