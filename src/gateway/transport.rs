//! WebSocket Transport Layer
//!
//! Single responsibility: Connect to a WebSocket and send/receive text messages.
//! No knowledge of the gateway protocol, authentication, or session state.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::GatewayError;

type WsConnection = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What the socket delivered next.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Text(String),
    Closed { code: u16, reason: String },
}

/// A connected WebSocket transport.
///
/// This type represents a raw WebSocket connection with no protocol knowledge.
/// It can only be constructed via `Transport::connect()`.
pub struct Transport {
    ws: WsConnection,
    url: String,
}

impl Transport {
    /// Connect to a WebSocket endpoint.
    ///
    /// Returns a Transport only when the connection is established.
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        debug!(url = %url, "Connecting to gateway WebSocket");

        let request = Request::builder()
            .uri(url)
            .header("Host", extract_host(url))
            .header("Origin", "http://localhost")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| GatewayError::Connection(format!("Failed to build request: {}", e)))?;

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| GatewayError::Connection(format!("WebSocket connect to {} failed: {}", url, e)))?;

        debug!(url = %url, "WebSocket connected");
        Ok(Self {
            ws,
            url: url.to_string(),
        })
    }

    /// Send a text message.
    pub async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| GatewayError::Connection(format!("Failed to send: {}", e)))
    }

    /// Receive the next text message.
    ///
    /// Binary payloads are decoded as UTF-8 if possible; ping/pong is handled
    /// by tungstenite. A stream that simply ends is reported as close code 1006.
    pub async fn recv(&mut self) -> Result<Incoming, GatewayError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Incoming::Text(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Incoming::Text(text)),
                    Err(_) => continue,
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Ok(Incoming::Closed { code, reason });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(GatewayError::Connection(format!("WebSocket error: {}", e)))
                }
                None => {
                    return Ok(Incoming::Closed {
                        code: 1006,
                        reason: String::new(),
                    })
                }
            }
        }
    }

    /// Close the connection. Consumes the transport so it cannot be closed twice.
    pub async fn close(mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(url = %self.url, error = %e, "Close handshake failed");
        }
        debug!(url = %self.url, "WebSocket closed");
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
