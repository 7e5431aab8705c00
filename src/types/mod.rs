//! Shared types of the transport layer: the crate-wide error enum, the REST
//! call contract, and route identities.

mod error;
mod request;
mod response;
mod route;

use std::fmt;

pub use error::ErrorKind;
pub use request::RestRequest;
pub use response::{Outcome, RestResponse};
pub use route::RouteKey;

/// The result of a `chatwire` operation
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Identity of an issuing client.
///
/// Several independent consumers (plugins, in the host integration) may share
/// one transport; requests are tagged with the issuer so one client's
/// requests can be aborted without disturbing others sharing a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Wrap a raw client identifier
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}
