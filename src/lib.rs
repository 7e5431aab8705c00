//! `chatwire` is the transport layer of a client for a real-time
//! chat-platform API: it issues many concurrent REST calls against a server
//! whose per-route and global rate limits are discovered dynamically from
//! response metadata, and it maintains one persistent duplex connection per
//! session for receiving events, with reconnect/resume semantics across
//! network failures.
//!
//! ```no_run
//! use chatwire::{ClientBuilder, ClientId, RestRequest, Result};
//! use http::Method;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = ClientBuilder::builder()
//!         .api_base(url::Url::parse("https://chat.example.com/api/v9").unwrap())
//!         .token(secrecy::SecretString::from("Bot my-token"))
//!         .build()
//!         .client()?;
//!
//!     let request = RestRequest::new(Method::GET, "users/@me")?;
//!     let outcome = client.request(ClientId::new(1), &request).await?;
//!     if let Some(response) = outcome.response() {
//!         println!("{}", response.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Rate-limit identity is unknown until the first response: requests are
//! grouped provisionally by route and regrouped — exactly once — when the
//! server reveals the real bucket. The gateway connection is owned by a
//! single actor task, so two transports can never be active for one session.

#![warn(missing_docs)]

mod client;
mod types;

pub mod gateway;
pub mod ratelimit;

pub use client::{
    Client, ClientBuilder, DEFAULT_GLOBAL_REQUESTS_PER_SECOND, DEFAULT_TIMEOUT_SECS,
    DEFAULT_USER_AGENT,
};
pub use types::{ClientId, ErrorKind, Outcome, RestRequest, RestResponse, Result, RouteKey};
