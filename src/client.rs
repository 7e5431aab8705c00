//! Client surface of the transport layer.
//!
//! This module defines two structs, [`Client`] and [`ClientBuilder`].
//! `Client` submits REST calls through the rate-limit dispatcher and opens
//! gateway sessions; `ClientBuilder` exposes the configuration knobs.

use http::header::{self, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use typed_builder::TypedBuilder;
use url::Url;

use crate::gateway::{
    ApiEndpointResolver, EndpointResolver, GatewayConnector, GatewayEvent, GatewaySession,
    WebSocketConnector,
};
use crate::ratelimit::{BucketSnapshot, Dispatcher};
use crate::types::{ClientId, ErrorKind, Outcome, RestRequest, Result};

/// Default user agent, `chatwire/<version>`
pub const DEFAULT_USER_AGENT: &str = concat!("chatwire/", env!("CARGO_PKG_VERSION"));
/// Default response timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
/// Default ceiling on requests fired per second across all buckets
pub const DEFAULT_GLOBAL_REQUESTS_PER_SECOND: u32 = 50;

/// A timeout for only the connect phase
const CONNECT_TIMEOUT: u64 = 10;

/// Builder for [`Client`].
///
/// See crate-level documentation for usage example.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
pub struct ClientBuilder {
    /// Base URL of the REST API; routes are resolved relative to it
    #[builder(!default)]
    api_base: Url,

    /// Authentication token sent with every request, scheme included.
    ///
    /// Held as a [`SecretString`] so it never ends up in debug output.
    token: Option<SecretString>,

    /// User agent sent with every request
    #[builder(default_code = "String::from(DEFAULT_USER_AGENT)")]
    user_agent: String,

    /// Response timeout per request
    timeout: Option<Duration>,

    /// Platform-wide ceiling on requests fired per second. Zero disables
    /// the heuristic; server-reported global throttles still apply.
    #[builder(default = DEFAULT_GLOBAL_REQUESTS_PER_SECOND)]
    global_requests_per_second: u32,

    /// Extra headers sent with every request
    custom_headers: HeaderMap,
}

impl ClientBuilder {
    /// Instantiate a [`Client`].
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the user agent or token is not a valid header
    /// value, or if the request client cannot be created.
    pub fn client(self) -> Result<Client> {
        let Self {
            api_base,
            token,
            user_agent,
            timeout,
            global_requests_per_second,
            custom_headers: mut headers,
        } = self;

        headers.insert(header::USER_AGENT, HeaderValue::from_str(&user_agent)?);
        if let Some(token) = token.as_ref() {
            let mut value = HeaderValue::from_str(token.expose_secret())?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let http = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
            .timeout(timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
            .build()
            .map_err(ErrorKind::NetworkRequest)?;

        // `Url::join` drops the last path segment of a base without a
        // trailing slash, so normalize here once
        let api_base = if api_base.path().ends_with('/') {
            api_base
        } else {
            Url::parse(&format!("{api_base}/"))?
        };

        let dispatcher = Arc::new(Dispatcher::new(
            http.clone(),
            api_base.clone(),
            global_requests_per_second,
        ));

        Ok(Client {
            http,
            api_base,
            dispatcher,
        })
    }
}

/// Submits REST calls with server-driven pacing and opens gateway sessions.
///
/// See [`ClientBuilder`] which contains sane defaults for all configuration
/// options. Cloning is cheap; clones share the bucket table, so pacing stays
/// correct no matter how many copies issue requests.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    api_base: Url,
    dispatcher: Arc<Dispatcher>,
}

impl Client {
    /// Submit a request and drive it to its single resolution.
    ///
    /// The call is paced by the bucket its route resolves to — suspending
    /// cooperatively while the server-declared window or the global throttle
    /// demands it — and by the bucket's concurrency gate. Throttled (429)
    /// exchanges are absorbed into pacing state and replayed; the returned
    /// outcome reflects the real underlying result.
    ///
    /// # Errors
    ///
    /// Network failures are surfaced as [`ErrorKind::NetworkRequest`]
    /// without internal retry.
    pub async fn request(&self, client: ClientId, request: &RestRequest) -> Result<Outcome> {
        self.dispatcher.execute(client, request).await
    }

    /// Cancel in-flight requests of one issuing client without disturbing
    /// others sharing the same buckets
    pub fn abort_requests(&self, client: ClientId) {
        log::debug!("Aborting in-flight requests for {client}");
        self.dispatcher.abort_requests(client);
    }

    /// Point-in-time view of every live bucket, for diagnostics
    #[must_use]
    pub fn bucket_snapshots(&self) -> Vec<BucketSnapshot> {
        self.dispatcher.snapshots()
    }

    /// Open a gateway session using the platform's endpoint discovery and
    /// the production websocket transport.
    ///
    /// `events` receives the session's [`GatewayEvent`]s.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the discovery URL cannot be derived from the API
    /// base.
    pub fn gateway(&self, events: mpsc::UnboundedSender<GatewayEvent>) -> Result<GatewaySession> {
        let discovery_url = self.api_base.join("gateway")?;
        let resolver = Arc::new(ApiEndpointResolver::new(self.http.clone(), discovery_url));
        Ok(self.gateway_with(resolver, Arc::new(WebSocketConnector), events))
    }

    /// Open a gateway session with custom resolver and connector seams
    #[must_use]
    pub fn gateway_with(
        &self,
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn GatewayConnector>,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> GatewaySession {
        GatewaySession::spawn(resolver, connector, events)
    }
}
