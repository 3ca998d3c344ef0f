use std::any::Any;
use std::sync::Arc;

/// Carried into every handler invocation instead of a process-wide singleton.
///
/// `app_state` is whatever the server was constructed with (see
/// `ServerBuilder::state`); handlers downcast it to their own type.
#[derive(Clone)]
pub struct HandlerContext {
    pub connection_id: u64,
    pub peer_addr: std::net::SocketAddr,
    app_state: Arc<dyn Any + Send + Sync>,
}

impl HandlerContext {
    pub fn new(
        connection_id: u64,
        peer_addr: std::net::SocketAddr,
        app_state: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            connection_id,
            peer_addr,
            app_state,
        }
    }

    /// Downcast the shared application state to `T`.
    ///
    /// Returns `None` if the server was built with a different state type
    /// (or none at all).
    pub fn state<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.app_state.downcast_ref::<T>()
    }
}
