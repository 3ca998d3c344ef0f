use std::time::Duration;

/// Server-side tunables. All have sensible defaults; construct with
/// `Config::default()` and override only what you need.
#[derive(Clone, Debug)]
pub struct Config {
    /// Connections beyond this count are rejected with an immediate close.
    pub max_connections: usize,
    /// Whether `WELCOME` carries the list of registered transaction codes.
    pub expose_transactions: bool,
    /// High-water mark for a connection's outbound frame queue.
    pub outbound_queue_capacity: usize,
    /// How long to wait for the client's `HELLO` before failing the connection.
    pub handshake_timeout: Duration,
    /// How long a `SubscriptionRun` is given to notice `CANCEL` before it is
    /// force-terminated (and `END(cancelled)` sent anyway).
    pub subscription_cancel_grace: Duration,
    /// How long `down()` waits for the outbound queue to drain before closing sockets.
    pub shutdown_drain_deadline: Duration,
    /// Largest payload accepted for a single frame.
    pub max_payload_len: u32,
    /// How long a frame may wait to be enqueued on a connection's outbound
    /// queue before the connection is failed with a `backpressure` error.
    /// Short stalls are absorbed by `outbound_queue_capacity`'s natural
    /// backpressure; this bounds how long a truly stuck consumer can wedge
    /// a connection open.
    pub backpressure_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            expose_transactions: true,
            outbound_queue_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
            subscription_cancel_grace: Duration::from_secs(5),
            shutdown_drain_deadline: Duration::from_secs(2),
            max_payload_len: htcp_wire::DEFAULT_MAX_PAYLOAD_LEN,
            backpressure_timeout: Duration::from_secs(30),
        }
    }
}

/// Client-side tunables.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long `disconnect()` waits for open subscriptions to see their
    /// terminal frame after `CANCEL` before closing the socket anyway.
    pub disconnect_drain_deadline: Duration,
    /// Largest payload accepted for a single frame.
    pub max_payload_len: u32,
    /// Capacity of each open subscription's item queue.
    pub subscription_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            disconnect_drain_deadline: Duration::from_secs(2),
            max_payload_len: htcp_wire::DEFAULT_MAX_PAYLOAD_LEN,
            subscription_queue_capacity: 64,
        }
    }
}
