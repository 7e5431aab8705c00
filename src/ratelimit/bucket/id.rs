use std::fmt;

use crate::types::RouteKey;

/// The server-assigned identifier of a rate-limit scope.
///
/// Opaque to the client; two routes sharing the same id share one pacing
/// window, which is only discoverable from response metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketId(String);

impl BucketId {
    /// The identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BucketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for BucketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a bucket in the dispatcher's table.
///
/// A bucket is keyed by its route until the server reveals the real bucket
/// identity; from then on, the known id is the key and the route key variant
/// for that route is never created again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum BucketKey {
    /// Provisional key: the route the first request was issued against
    Route(RouteKey),
    /// Authoritative key: the server-assigned bucket id
    Known(BucketId),
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route(route) => write!(f, "route:{route}"),
            Self::Known(id) => write!(f, "bucket:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn test_bucket_key_separation() {
        let route = RouteKey::new(Method::GET, "channels/1").unwrap();
        let synthetic = BucketKey::Route(route);
        let known = BucketKey::Known(BucketId::from("abc123"));
        assert_ne!(synthetic, known);
        assert_eq!(known.to_string(), "bucket:abc123");
    }
}
