//! The persistent duplex connection carrying asynchronous events.
//!
//! # Architecture
//!
//! - [`GatewaySession`]: handle to the single actor task owning one
//!   session's transport and lifecycle state
//! - [`CommandFrame`]: the `{op, d}` envelope sent over the transport, with
//!   a FIFO queue for frames submitted while disconnected
//! - [`GatewayConnector`] / [`GatewayTransport`] / [`EndpointResolver`]:
//!   the transport seam; production implementations speak websocket, tests
//!   drive the state machine in memory

mod commands;
mod connection;
mod connector;

pub use commands::CommandFrame;
pub use connection::{
    CLOSE_NORMAL, CLOSE_RECONNECT_REQUESTED, GatewayEvent, GatewaySession, SessionSnapshot,
    SessionState,
};
pub use connector::{
    ApiEndpointResolver, EndpointResolver, GatewayConnector, GatewayTransport, TransportEvent,
    WebSocketConnector,
};
