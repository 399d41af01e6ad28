//! Connection seam between the client loop and the network.

use async_trait::async_trait;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracehound_core::TraceEvent;
use tracing::debug;

use crate::ClientError;

/// Opens connections to the gateway.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn BatchSink>, ClientError>;
}

/// An open connection that accepts ordered batches.
#[async_trait]
pub trait BatchSink: Send {
    async fn send_batch(&mut self, batch: &[TraceEvent]) -> Result<(), ClientError>;

    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Connects to the gateway's `/ingest` WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn BatchSink>, ClientError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        debug!(url = %self.url, "Connected to trace gateway");
        Ok(Box::new(WsSink { stream }))
    }
}

struct WsSink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl BatchSink for WsSink {
    /// Sends the batch as one text frame holding a JSON array.
    async fn send_batch(&mut self, batch: &[TraceEvent]) -> Result<(), ClientError> {
        let json = serde_json::to_string(batch)?;
        self.stream
            .send(Message::text(json))
            .await
            .map_err(|e| ClientError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ClientError::Send(e.to_string()))
    }
}
