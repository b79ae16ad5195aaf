//! WebSocket transport for live timing feeds

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace};

use crate::transport::{Transport, TransportConnection};
use crate::{KartwallError, Result};

/// Transport that dials `ws://`/`wss://` feed URLs
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportConnection>> {
        debug!(url, "Dialing timing feed");
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| KartwallError::transport_with_source(format!("cannot connect to {url}"), Box::new(e)))?;
        info!(url, status = %response.status(), "WebSocket connected");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

/// Open WebSocket connection
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl TransportConnection for WebSocketConnection {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => trace!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Feed closed the connection");
                    return Ok(None);
                }
                // Ping/pong is answered by tungstenite itself.
                Ok(_) => {}
                Err(e) => return Err(KartwallError::transport_with_source("WebSocket read failed", Box::new(e))),
            }
        }
        Ok(None)
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| KartwallError::transport_with_source("WebSocket send failed", Box::new(e)))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            trace!(error = %e, "WebSocket close failed");
        }
    }
}
