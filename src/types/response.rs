use http::HeaderMap;
use reqwest::{Response, StatusCode};

use crate::ratelimit::RateLimitInfo;
use crate::types::{ErrorKind, Result};

/// The result of a completed REST exchange.
///
/// This abstraction exists because [`Response`] cannot be handed around once
/// its body has been consumed; the dispatcher reads the body eagerly so the
/// rate-limit metadata (which may live in a 429 body) can be extracted in one
/// place.
#[derive(Debug, Clone)]
pub struct RestResponse {
    /// HTTP status of the exchange
    pub status: StatusCode,
    /// Response headers as received
    pub headers: HeaderMap,
    /// Response body, if any
    pub text: Option<String>,
    /// Pacing metadata extracted from the exchange, if the server sent any
    pub rate_limit: Option<RateLimitInfo>,
}

impl RestResponse {
    pub(crate) async fn from_response(response: Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let text = match response.text().await.map_err(ErrorKind::ReadResponseBody)? {
            body if body.is_empty() => None,
            body => Some(body),
        };
        let rate_limit = crate::ratelimit::parse_rate_limit(status, &headers, text.as_deref());

        Ok(Self {
            status,
            headers,
            text,
            rate_limit,
        })
    }

    /// Deserialize the body as JSON into `T`
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::FatalProtocol`] if the body is absent or not
    /// valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let text = self.text.as_deref().ok_or_else(|| {
            ErrorKind::FatalProtocol("expected a response body, got none".to_string())
        })?;
        serde_json::from_str(text)
            .map_err(|e| ErrorKind::FatalProtocol(format!("malformed response body: {e}")))
    }
}

/// How a submitted request was resolved.
///
/// Every request resolves exactly once: with a completed exchange, with an
/// error ([`crate::ErrorKind`]), or — as a first-class non-error outcome —
/// cancelled.
#[derive(Debug)]
pub enum Outcome {
    /// The exchange completed; any HTTP status, including server errors
    Response(RestResponse),
    /// The request was aborted before it could complete
    Cancelled,
}

impl Outcome {
    /// The completed response, if the request was not cancelled
    #[must_use]
    pub fn response(self) -> Option<RestResponse> {
        match self {
            Self::Response(response) => Some(response),
            Self::Cancelled => None,
        }
    }

    /// Whether the request was cancelled
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
