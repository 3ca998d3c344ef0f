//! HTCP: a lightweight bidirectional RPC-and-streaming protocol over TCP.
//!
//! A server registers named transactions (request/response) and
//! subscriptions (server-pushed streams) against a [`ServerBuilder`], then
//! serves them over a TCP listener. A client connects, performs the
//! handshake, and issues [`HtcpClient::call`]/[`HtcpClient::subscribe`].
//!
//! ```ignore
//! use htcp::prelude::*;
//!
//! let server = ServerBuilder::new("demo", "127.0.0.1", 9000)
//!     .transaction("ping", ParamListBuilder::new().build(), |_args, _ctx| {
//!         Box::pin(async move { Ok(Value::String("pong".into())) })
//!     })
//!     .build();
//!
//! # async fn run(server: HtcpServer) -> Result<(), Box<dyn std::error::Error>> {
//! server.up("127.0.0.1:9000").await?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::TcpStream;

/// The boxed-future return type expected by [`TransactionHandler`],
/// [`SubscriptionHandler`] and [`SubscriptionFactory`] implementations.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use htcp_core::{
    CancelSignal, ClientConfig, Config, EndpointKind, ErrorKind, Frame, FrameError, HtcpError,
    Kind, ServerIdentity, ServerInfo,
};
pub use htcp_registry::{
    BindError, DuplicateEndpoint, HandlerContext, HandlerError, ParamDesc, ParamListBuilder,
    Registry, SubscriptionFactory, SubscriptionHandler, TransactionHandler, ValueKind,
};
pub use htcp_value::{EncodingError, Fields, FromValue, Record, ToValue, Value};

/// Convenience re-exports for implementing handlers and building a server.
pub mod prelude {
    pub use crate::{HtcpClient, HtcpServer, ServerBuilder};
    pub use htcp_registry::{HandlerContext, HandlerError, ParamListBuilder};
    pub use htcp_value::{Fields, FromValue, ToValue, Value};
}

/// Builds a [`HtcpServer`]: register transactions and subscriptions, set an
/// app state, then [`Self::build`].
pub struct ServerBuilder {
    registry: Registry,
    config: Config,
    identity: ServerIdentity,
    app_state: Arc<dyn Any + Send + Sync>,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            registry: Registry::new(),
            config: Config::default(),
            identity: ServerIdentity {
                name: name.into(),
                host: host.into(),
                port,
            },
            app_state: Arc::new(()),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Attach application state retrievable from [`HandlerContext::state`].
    pub fn state<T: Send + Sync + 'static>(mut self, state: T) -> Self {
        self.app_state = Arc::new(state);
        self
    }

    /// Register a transaction endpoint. Panics on a duplicate `code` —
    /// endpoint registration happens once at startup, so a collision is a
    /// programming error, not a runtime condition to recover from.
    pub fn transaction(
        mut self,
        code: impl Into<String>,
        params: Vec<ParamDesc>,
        handler: impl TransactionHandler,
    ) -> Self {
        let code = code.into();
        self.registry
            .register_transaction(code.clone(), params, handler)
            .unwrap_or_else(|e| panic!("{e}"));
        self
    }

    /// Register a subscription endpoint. Panics on a duplicate `code`, for
    /// the same reason as [`Self::transaction`].
    pub fn subscription(
        mut self,
        code: impl Into<String>,
        params: Vec<ParamDesc>,
        factory: impl SubscriptionFactory,
    ) -> Self {
        let code = code.into();
        self.registry
            .register_subscription(code.clone(), params, factory)
            .unwrap_or_else(|e| panic!("{e}"));
        self
    }

    pub fn build(self) -> HtcpServer {
        HtcpServer {
            inner: htcp_core::Server::new(self.registry, self.config, self.identity, self.app_state),
        }
    }
}

/// A server ready to accept connections. Construct with [`ServerBuilder`].
pub struct HtcpServer {
    inner: htcp_core::Server,
}

impl HtcpServer {
    /// Bind `addr` and serve until [`Self::down`] is called from another task.
    pub async fn up(&self, addr: &str) -> Result<(), HtcpError> {
        self.inner.up(addr).await
    }

    /// Stop the accept loop started by [`Self::up`].
    pub async fn down(&self) {
        self.inner.down().await
    }

    pub fn registry(&self) -> &Registry {
        self.inner.registry()
    }
}

/// A connected HTCP client. Construct with [`Self::connect_tcp`] or
/// [`Self::connect`] (any duplex byte stream).
pub struct HtcpClient {
    inner: htcp_core::Client,
}

impl HtcpClient {
    /// Connect over plain TCP with default client settings.
    pub async fn connect_tcp(addr: &str) -> Result<Self, HtcpError> {
        Self::connect_tcp_with_config(addr, ClientConfig::default()).await
    }

    pub async fn connect_tcp_with_config(addr: &str, config: ClientConfig) -> Result<Self, HtcpError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HtcpError::new(ErrorKind::Transport, e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Self::connect(stream, config).await
    }

    /// Perform the handshake over an already-established duplex stream
    /// (a TCP socket, an in-memory `tokio::io::duplex` pair, etc.).
    pub async fn connect<S>(stream: S, config: ClientConfig) -> Result<Self, HtcpError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Ok(Self {
            inner: htcp_core::Client::connect(stream, config).await?,
        })
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.server_info()
    }

    /// Re-query the server's identity and transaction listing mid-connection.
    pub async fn info(&self) -> Result<ServerInfo, HtcpError> {
        self.inner.info().await
    }

    pub async fn call(&self, transaction: impl Into<String>, args: Fields) -> Result<Value, HtcpError> {
        self.inner.call(transaction, args).await
    }

    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        args: Fields,
    ) -> Result<htcp_core::OpenSubscription, HtcpError> {
        self.inner.subscribe(event_type, args).await
    }

    pub async fn disconnect(self) {
        self.inner.disconnect().await
    }
}
