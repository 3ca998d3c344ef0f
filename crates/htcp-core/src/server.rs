//! TCP listener: accepts connections, enforces `max_connections`, and spawns
//! [`serve_connection`] for each one.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::connection::{serve_connection, ServerIdentity};
use crate::error::HtcpError;
use htcp_registry::Registry;

/// A running (or not-yet-started) HTCP server over TCP.
///
/// ```ignore
/// let server = Server::new(registry, Config::default(), identity, app_state);
/// server.up("127.0.0.1:9000").await?;
/// // ... later, from another task ...
/// server.down().await;
/// ```
pub struct Server {
    registry: Arc<Registry>,
    config: Arc<Config>,
    identity: Arc<ServerIdentity>,
    app_state: Arc<dyn Any + Send + Sync>,
    next_conn_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(
        registry: Registry,
        config: Config,
        identity: ServerIdentity,
        app_state: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
            identity: Arc::new(identity),
            app_state,
            next_conn_id: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind `addr` and accept connections until [`Self::down`] is called.
    /// Each connection is handled on its own task by [`serve_connection`];
    /// a connection's own protocol/transport errors are logged and do not
    /// bring the listener down.
    pub async fn up(&self, addr: &str) -> Result<(), HtcpError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HtcpError::new(crate::error::ErrorKind::Transport, e.to_string()))?;
        tracing::info!(addr, "htcp server listening");

        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let mut tasks = JoinSet::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    self.spawn_connection(stream, peer_addr, semaphore.clone(), &mut tasks);
                }
            }
        }

        drop(listener);
        // Each connection's own reader loop already observed `shutdown_rx` and
        // ran its graceful teardown; this just waits for those tasks to
        // actually finish, with `abort_all` as a backstop for any connection
        // stuck elsewhere (e.g. a wedged write) past the drain deadline.
        tokio::time::timeout(self.config.shutdown_drain_deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .ok();
        tasks.abort_all();
        Ok(())
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        semaphore: Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
    ) {
        let permit = match semaphore.try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(peer = %peer_addr, "max_connections reached, rejecting connection");
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let registry = self.registry.clone();
        let config = self.config.clone();
        let identity = self.identity.clone();
        let app_state = self.app_state.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        tasks.spawn(async move {
            let _permit = permit;
            if let Err(e) = serve_connection(
                stream, conn_id, peer_addr, registry, config, identity, app_state, shutdown_rx,
            )
            .await
            {
                tracing::debug!(peer = %peer_addr, conn_id, error = %e, "connection ended");
            }
        });
    }

    /// Signal the accept loop in [`Self::up`] to stop and return. Safe to
    /// call from a different task than the one running `up`.
    pub async fn down(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htcp_registry::{HandlerContext, HandlerError, ParamListBuilder};
    use htcp_value::Value;
    use std::future::Future;
    use std::pin::Pin;

    type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    #[tokio::test]
    async fn up_and_down_round_trip() {
        let mut registry = Registry::new();
        registry
            .register_transaction(
                "ping",
                ParamListBuilder::new().build(),
                |_args: Vec<Value>, _ctx: &HandlerContext| {
                    Box::pin(async move { Ok(Value::String("pong".into())) })
                        as BoxFuture<'static, Result<Value, HandlerError>>
                },
            )
            .unwrap();

        let server = Arc::new(Server::new(
            registry,
            Config::default(),
            ServerIdentity {
                name: "test".into(),
                host: "127.0.0.1".into(),
                port: 0,
            },
            Arc::new(()),
        ));

        let up_server = server.clone();
        let handle = tokio::spawn(async move {
            up_server.up("127.0.0.1:0").await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        server.down().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("up() should return after down()")
            .unwrap();
    }
}
