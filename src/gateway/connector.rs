//! Transport seam of the gateway connection.
//!
//! The connection state machine is written against these traits so the
//! websocket mechanics stay swappable: production uses `tokio-tungstenite`,
//! tests drive the state machine through an in-memory transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::types::{ErrorKind, Result};

/// Events surfaced by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound text frame
    Message(String),
    /// The peer closed the connection
    Closed {
        /// Close code sent by the peer, `1005` if none was supplied
        code: u16,
        /// Close reason, possibly empty
        reason: String,
    },
    /// The transport failed; the connection is unusable
    Error(String),
}

/// Resolves the gateway endpoint URL.
///
/// The endpoint is fetched lazily on first connect and re-resolved after
/// repeated reconnect failures, which treat a stale endpoint as the likely
/// cause.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Produce the current gateway URL
    async fn resolve(&self) -> Result<Url>;
}

/// One open duplex connection
#[async_trait]
pub trait GatewayTransport: Send {
    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<()>;
    /// Receive the next event; `None` once the stream is exhausted
    async fn next_event(&mut self) -> Option<TransportEvent>;
    /// Close with the given code and reason; best-effort
    async fn close(&mut self, code: u16, reason: &str);
}

/// Opens transports to a resolved endpoint
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Establish a connection; resolves once the transport is open
    async fn connect(&self, url: &Url) -> Result<Box<dyn GatewayTransport>>;
}

/// Production connector backed by `tokio-tungstenite`
#[derive(Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl GatewayConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn GatewayTransport>> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ErrorKind::GatewayTransport(format!("connect failed: {e}")))?;
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl GatewayTransport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ErrorKind::GatewayTransport(format!("send failed: {e}")))
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            return match self.stream.next().await? {
                Ok(Message::Text(text)) => Some(TransportEvent::Message(text.to_string())),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    Some(TransportEvent::Closed { code, reason })
                }
                // Control frames are handled by tungstenite itself
                Ok(_) => continue,
                Err(e) => Some(TransportEvent::Error(e.to_string())),
            };
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from(reason),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            log::debug!("Gateway close handshake failed: {e}");
        }
    }
}

/// Shape of the endpoint discovery response
#[derive(Debug, Deserialize)]
struct GatewayInfo {
    url: String,
}

/// Resolver that asks the REST API for the gateway URL
#[derive(Debug)]
pub struct ApiEndpointResolver {
    http: reqwest::Client,
    discovery_url: Url,
}

impl ApiEndpointResolver {
    /// Resolver fetching from `discovery_url`, which must answer with
    /// `{"url": "wss://..."}`
    #[must_use]
    pub fn new(http: reqwest::Client, discovery_url: Url) -> Self {
        Self { http, discovery_url }
    }
}

#[async_trait]
impl EndpointResolver for ApiEndpointResolver {
    async fn resolve(&self) -> Result<Url> {
        let response = self
            .http
            .get(self.discovery_url.clone())
            .send()
            .await
            .map_err(ErrorKind::NetworkRequest)?;
        let info: GatewayInfo = response.json().await.map_err(|e| {
            ErrorKind::FatalProtocol(format!("malformed gateway discovery response: {e}"))
        })?;
        let url = Url::parse(&info.url)?;
        log::debug!("Resolved gateway endpoint: {url}");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_api_endpoint_resolver() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gateway"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"url": "wss://gateway.example"}"#),
            )
            .mount(&server)
            .await;

        let resolver = ApiEndpointResolver::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/gateway", server.uri())).unwrap(),
        );
        let url = resolver.resolve().await.unwrap();
        assert_eq!(url.as_str(), "wss://gateway.example/");
    }

    #[tokio::test]
    async fn test_api_endpoint_resolver_rejects_garbage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let resolver = ApiEndpointResolver::new(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
        );
        assert!(matches!(
            resolver.resolve().await,
            Err(ErrorKind::FatalProtocol(_))
        ));
    }
}
