//! Connection-level machinery for HTCP: framing, the value codec bridge,
//! wire errors, the server dispatcher/subscription engine, and the client
//! multiplexer. The `htcp` crate wraps this into the public API; most users
//! should depend on that instead of this crate directly.

mod cancel;
mod client;
mod config;
mod connection;
mod envelope;
mod error;
mod server;

pub use cancel::CancelSignal;
pub use client::{Client, OpenSubscription};
pub use config::{ClientConfig, Config};
pub use connection::{serve_connection, ServerIdentity};
pub use envelope::{Request, ServerInfo};
pub use error::{ErrorKind, HtcpError};
pub use server::Server;

pub use htcp_registry::{
    BindError, DuplicateEndpoint, EndpointKind, HandlerContext, HandlerError, ParamDesc,
    ParamListBuilder, Registry, SubscriptionFactory, SubscriptionHandler, TransactionHandler,
};
pub use htcp_value::{EncodingError, Fields, FromValue, Record, ToValue, Value};
pub use htcp_wire::{Frame, FrameError, Kind};
