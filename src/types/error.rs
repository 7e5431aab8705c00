use thiserror::Error;

/// Possible errors when interacting with `chatwire`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The given route is malformed and was rejected before queuing
    #[error("Invalid route `{route}`: {reason}")]
    InvalidRoute {
        /// The offending route text
        route: String,
        /// Why it was rejected
        reason: &'static str,
    },
    /// Reqwest network error
    #[error("Network error while trying to connect to an endpoint via reqwest")]
    NetworkRequest(#[source] reqwest::Error),
    /// Reading the response body of a completed exchange failed
    #[error("Error while reading response body")]
    ReadResponseBody(#[source] reqwest::Error),
    /// The given string can not be parsed into a valid URL
    #[error("Cannot parse URL: {0}")]
    ParseUrl(#[from] url::ParseError),
    /// The given header could not be parsed.
    /// A possible error when converting a `HeaderValue` from a string or byte
    /// slice.
    #[error("Header could not be parsed.")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
    /// A pacing wait outlived the safety-net deadline
    #[error("Request to bucket {bucket} waited too long for admission")]
    AdmissionTimeout {
        /// The bucket the request was waiting on
        bucket: String,
    },
    /// `connect()` was called while the session already has an active
    /// transport. Disconnect before connecting again.
    #[error("Gateway is already running. Disconnect before attempting to connect.")]
    GatewayAlreadyConnected,
    /// The gateway transport failed to connect, send, or receive
    #[error("Gateway transport error: {0}")]
    GatewayTransport(String),
    /// The gateway connection task is no longer running
    #[error("Gateway connection task has exited")]
    GatewayTaskExited,
    /// The server repeatedly returned responses this client cannot interpret
    #[error("Fatal protocol error: {0}")]
    FatalProtocol(String),
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::InvalidRoute {
                    route: r1,
                    reason: e1,
                },
                Self::InvalidRoute {
                    route: r2,
                    reason: e2,
                },
            ) => r1 == r2 && e1 == e2,
            (Self::NetworkRequest(e1), Self::NetworkRequest(e2))
            | (Self::ReadResponseBody(e1), Self::ReadResponseBody(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::ParseUrl(e1), Self::ParseUrl(e2)) => e1 == e2,
            (Self::AdmissionTimeout { bucket: b1 }, Self::AdmissionTimeout { bucket: b2 }) => {
                b1 == b2
            }
            (Self::GatewayTransport(m1), Self::GatewayTransport(m2))
            | (Self::FatalProtocol(m1), Self::FatalProtocol(m2)) => m1 == m2,
            (Self::GatewayAlreadyConnected, Self::GatewayAlreadyConnected)
            | (Self::GatewayTaskExited, Self::GatewayTaskExited)
            | (Self::InvalidHeader(_), Self::InvalidHeader(_)) => true,
            _ => false,
        }
    }
}
