use http::Method;
use serde_json::Value;

use crate::types::{Result, RouteKey};

/// A single outbound REST call: a route with resolved parameters and an
/// optional JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    /// The route the call is issued against; also the provisional
    /// rate-limit grouping until the real bucket identity is discovered
    pub route: RouteKey,
    /// Optional JSON body sent with the call
    pub body: Option<Value>,
}

impl RestRequest {
    /// Create a request without a body
    pub fn new<P: AsRef<str>>(method: Method, path: P) -> Result<Self> {
        Ok(Self {
            route: RouteKey::new(method, path)?,
            body: None,
        })
    }

    /// Create a request carrying a JSON body
    pub fn with_body<P: AsRef<str>>(method: Method, path: P, body: Value) -> Result<Self> {
        Ok(Self {
            route: RouteKey::new(method, path)?,
            body: Some(body),
        })
    }

    /// The HTTP method of the underlying route
    #[must_use]
    pub const fn method(&self) -> &Method {
        self.route.method()
    }
}
