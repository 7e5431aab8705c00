use http::Method;
use std::fmt;

use crate::types::{ErrorKind, Result};

/// A type-safe representation of an API route for rate-limiting purposes.
///
/// A route is the HTTP method plus the request path with all parameters
/// already resolved. Until the server reveals the real bucket identity for a
/// route, the route key itself is used to group requests into a provisional
/// bucket, so two calls to the same endpoint must normalize to the same key.
///
/// # Examples
///
/// ```
/// use chatwire::RouteKey;
/// use http::Method;
///
/// let route = RouteKey::new(Method::GET, "channels/42/messages").unwrap();
/// assert_eq!(route.path(), "channels/42/messages");
/// assert_eq!(route.to_string(), "GET channels/42/messages");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    method: Method,
    path: String,
}

impl RouteKey {
    /// Build a route key from a method and a resolved path.
    ///
    /// Leading slashes are stripped so `channels/42` and `/channels/42`
    /// resolve to the same bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidRoute`] if the path is empty, contains
    /// whitespace, or carries a scheme (absolute URLs are not routes).
    pub fn new<P: AsRef<str>>(method: Method, path: P) -> Result<Self> {
        let path = path.as_ref().trim_start_matches('/');

        if path.is_empty() {
            return Err(ErrorKind::InvalidRoute {
                route: path.to_string(),
                reason: "route path is empty",
            });
        }
        if path.chars().any(char::is_whitespace) {
            return Err(ErrorKind::InvalidRoute {
                route: path.to_string(),
                reason: "route path contains whitespace",
            });
        }
        if path.contains("://") {
            return Err(ErrorKind::InvalidRoute {
                route: path.to_string(),
                reason: "route path must be relative to the API base",
            });
        }

        Ok(Self {
            method,
            path: path.to_string(),
        })
    }

    /// The HTTP method of this route
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The resolved request path, relative to the API base
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_key_normalization() {
        let plain = RouteKey::new(Method::GET, "channels/42/messages").unwrap();
        let slashed = RouteKey::new(Method::GET, "/channels/42/messages").unwrap();
        assert_eq!(plain, slashed);
    }

    #[test]
    fn test_route_key_method_separation() {
        let get = RouteKey::new(Method::GET, "channels/42/messages").unwrap();
        let post = RouteKey::new(Method::POST, "channels/42/messages").unwrap();
        assert_ne!(get, post);
    }

    #[test]
    fn test_route_key_rejects_empty() {
        assert!(RouteKey::new(Method::GET, "").is_err());
        assert!(RouteKey::new(Method::GET, "/").is_err());
    }

    #[test]
    fn test_route_key_rejects_whitespace() {
        assert!(RouteKey::new(Method::GET, "channels/4 2").is_err());
    }

    #[test]
    fn test_route_key_rejects_absolute_url() {
        assert!(RouteKey::new(Method::GET, "https://example.com/channels").is_err());
    }

    #[test]
    fn test_route_key_display() {
        let route = RouteKey::new(Method::DELETE, "guilds/7/members/9").unwrap();
        assert_eq!(route.to_string(), "DELETE guilds/7/members/9");
    }
}
