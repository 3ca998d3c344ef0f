//! Client-side multiplexer: one reader task demultiplexes `REPLY`/`ERROR`
//! frames to pending calls and `ITEM`/`END` frames to open subscriptions by
//! correlation id, while the public API issues `CALL`/`SUBSCRIBE`/`CANCEL`
//! frames directly from `call`/`subscribe`/`unsubscribe`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use htcp_value::{Fields, Value};
use htcp_wire::{read_frame, write_frame, Frame, Kind};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::envelope::{Request, ServerInfo};
use crate::error::{ErrorKind, HtcpError};

enum PendingCall {
    Transaction(oneshot::Sender<Result<Value, HtcpError>>),
    Handshake(oneshot::Sender<Result<ServerInfo, HtcpError>>),
    Info(oneshot::Sender<Result<ServerInfo, HtcpError>>),
}

struct SharedState {
    outbound_tx: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    subscriptions: Mutex<HashMap<u64, mpsc::Sender<Result<Value, HtcpError>>>>,
    next_corr: AtomicU64,
}

impl SharedState {
    fn next_correlation_id(&self) -> u64 {
        self.next_corr.fetch_add(1, Ordering::Relaxed)
    }
}

/// An open server-pushed stream. Poll with [`Self::recv`]; drop (or call
/// [`Self::unsubscribe`]) to stop it.
///
/// `Drop` only issues a best-effort, non-blocking `CANCEL` — it cannot wait
/// for the server's terminal frame because Rust drop glue isn't async. Call
/// [`Self::unsubscribe`] explicitly when you need to know the subscription
/// has actually ended before proceeding.
pub struct OpenSubscription {
    correlation_id: u64,
    items: mpsc::Receiver<Result<Value, HtcpError>>,
    shared: Arc<SharedState>,
    cancelled: bool,
}

impl OpenSubscription {
    /// Receive the next pushed item, or `None` once the subscription's
    /// terminal frame has been delivered.
    pub async fn recv(&mut self) -> Option<Result<Value, HtcpError>> {
        self.items.recv().await
    }

    /// Send `CANCEL` and wait until the subscription's terminal frame has
    /// been observed (or the channel closes because the connection died).
    pub async fn unsubscribe(mut self) {
        self.send_cancel();
        while self.items.recv().await.is_some() {}
    }

    fn send_cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        let frame = Frame::new(Kind::Cancel, self.correlation_id, Vec::new());
        let _ = self.shared.outbound_tx.try_send(frame);
    }
}

impl Drop for OpenSubscription {
    fn drop(&mut self) {
        self.send_cancel();
        self.shared.subscriptions.lock().remove(&self.correlation_id);
    }
}

/// A connected HTCP client multiplexing calls and subscriptions over one
/// TCP (or other duplex stream) connection.
pub struct Client {
    shared: Arc<SharedState>,
    config: ClientConfig,
    server_info: Mutex<ServerInfo>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Perform the `HELLO`/`WELCOME` handshake over `stream` and return a
    /// ready-to-use client.
    pub async fn connect<S>(stream: S, config: ClientConfig) -> Result<Self, HtcpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.subscription_queue_capacity.max(16));

        let shared = Arc::new(SharedState {
            outbound_tx,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_corr: AtomicU64::new(1),
        });

        let writer_task = tokio::spawn(run_writer(write_half, outbound_rx));
        let (hello_tx, hello_rx) = oneshot::channel();
        let hello_corr = shared.next_correlation_id();
        shared.pending.lock().insert(hello_corr, PendingCall::Handshake(hello_tx));

        let reader_shared = shared.clone();
        let max_payload_len = config.max_payload_len;
        let reader_task =
            tokio::spawn(async move { run_reader(read_half, reader_shared, max_payload_len).await });

        shared
            .outbound_tx
            .send(Frame::new(Kind::Hello, hello_corr, Vec::new()))
            .await
            .map_err(|_| HtcpError::new(ErrorKind::Transport, "writer task is gone"))?;

        let info = hello_rx
            .await
            .map_err(|_| HtcpError::new(ErrorKind::Transport, "connection closed during handshake"))??;

        Ok(Self {
            shared,
            config,
            server_info: Mutex::new(info),
            reader_task,
            writer_task,
        })
    }

    /// The server identity learned at `connect()` time.
    pub fn server_info(&self) -> ServerInfo {
        self.server_info.lock().clone()
    }

    /// Invoke a request/response transaction and wait for its single reply.
    pub async fn call(&self, transaction: impl Into<String>, args: Fields) -> Result<Value, HtcpError> {
        let corr = self.shared.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(corr, PendingCall::Transaction(tx));

        let request = Request {
            code: transaction.into(),
            args,
        };
        let frame = Frame::new(Kind::Call, corr, htcp_value::encode(&request.to_value("transaction")));
        if self.shared.outbound_tx.send(frame).await.is_err() {
            self.shared.pending.lock().remove(&corr);
            return Err(HtcpError::new(ErrorKind::Transport, "writer task is gone"));
        }

        rx.await.map_err(|_| HtcpError::new(ErrorKind::Transport, "connection closed mid-call"))?
    }

    /// Open a subscription; items arrive through the returned handle until
    /// the server sends its terminal frame or the connection closes.
    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        args: Fields,
    ) -> Result<OpenSubscription, HtcpError> {
        let corr = self.shared.next_correlation_id();
        let (item_tx, item_rx) = mpsc::channel(self.config.subscription_queue_capacity);
        self.shared.subscriptions.lock().insert(corr, item_tx);

        let request = Request {
            code: event_type.into(),
            args,
        };
        let frame = Frame::new(Kind::Subscribe, corr, htcp_value::encode(&request.to_value("event_type")));
        if self.shared.outbound_tx.send(frame).await.is_err() {
            self.shared.subscriptions.lock().remove(&corr);
            return Err(HtcpError::new(ErrorKind::Transport, "writer task is gone"));
        }

        Ok(OpenSubscription {
            correlation_id: corr,
            items: item_rx,
            shared: self.shared.clone(),
            cancelled: false,
        })
    }

    /// Re-query the server's identity and transaction listing mid-connection,
    /// without a second handshake.
    pub async fn info(&self) -> Result<ServerInfo, HtcpError> {
        let corr = self.shared.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(corr, PendingCall::Info(tx));

        let frame = Frame::new(Kind::InfoReq, corr, Vec::new());
        if self.shared.outbound_tx.send(frame).await.is_err() {
            self.shared.pending.lock().remove(&corr);
            return Err(HtcpError::new(ErrorKind::Transport, "writer task is gone"));
        }

        rx.await.map_err(|_| HtcpError::new(ErrorKind::Transport, "connection closed mid-call"))?
    }

    /// Close the connection. Waits up to `disconnect_drain_deadline` for
    /// already-queued outbound frames to flush, then aborts both the reader
    /// and writer tasks, which drops the underlying stream.
    pub async fn disconnect(self) {
        let deadline = tokio::time::Instant::now() + self.config.disconnect_drain_deadline;
        let tx = &self.shared.outbound_tx;
        while tx.capacity() < tx.max_capacity() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

impl Drop for Client {
    /// A `Client` dropped without calling [`Self::disconnect`] still must not
    /// leak its reader/writer tasks — aborting both drops the stream they
    /// own, which is what actually closes the socket.
    fn drop(&mut self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

async fn run_writer<W: AsyncWrite + Unpin>(mut write_half: W, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            tracing::warn!(error = %e, "client write failed, closing writer");
            break;
        }
    }
}

async fn run_reader<R: AsyncRead + Unpin>(mut read_half: R, shared: Arc<SharedState>, max_payload_len: u32) {
    loop {
        let frame = match read_frame(&mut read_half, max_payload_len).await {
            Ok(f) => f,
            Err(e) => {
                fail_everything(&shared, HtcpError::from(e));
                return;
            }
        };

        match frame.kind {
            Kind::Welcome => complete_server_info_call(&shared, frame),
            Kind::Reply => {
                let result = htcp_value::decode(&frame.payload).map_err(HtcpError::from);
                complete_call(&shared, frame.correlation_id, result);
            }
            Kind::Error => {
                let result: Result<Value, HtcpError> = match htcp_value::decode(&frame.payload) {
                    Ok(v) => match HtcpError::from_value(v) {
                        Ok(e) => Err(e),
                        Err(e) => Err(HtcpError::from(e)),
                    },
                    Err(e) => Err(HtcpError::from(e)),
                };
                complete_call(&shared, frame.correlation_id, result);
            }
            Kind::Item => deliver_item(&shared, frame),
            Kind::End => deliver_end(&shared, frame),
            Kind::InfoRep => complete_server_info_call(&shared, frame),
            other => {
                tracing::warn!(kind = ?other, "client received unexpected frame kind");
            }
        }
    }
}

/// Completes a `PendingCall::Handshake` or `PendingCall::Info` — both decode
/// the same `ServerInfo` payload shape, from `WELCOME` and `INFO_REP` respectively.
fn complete_server_info_call(shared: &Arc<SharedState>, frame: Frame) {
    let Some(pending) = shared.pending.lock().remove(&frame.correlation_id) else {
        return;
    };
    let result = htcp_value::decode(&frame.payload)
        .map_err(HtcpError::from)
        .and_then(|v| ServerInfo::from_value(v).map_err(HtcpError::from));
    match pending {
        PendingCall::Handshake(tx) => {
            let _ = tx.send(result);
        }
        PendingCall::Info(tx) => {
            let _ = tx.send(result);
        }
        PendingCall::Transaction(tx) => {
            let _ = tx.send(Err(HtcpError::new(
                ErrorKind::Protocol,
                "received a server-info reply for a transaction call",
            )));
        }
    }
}

fn complete_call(shared: &Arc<SharedState>, corr: u64, result: Result<Value, HtcpError>) {
    let Some(pending) = shared.pending.lock().remove(&corr) else {
        return;
    };
    if let PendingCall::Transaction(tx) = pending {
        let _ = tx.send(result);
    }
}

fn deliver_item(shared: &Arc<SharedState>, frame: Frame) {
    let sender = shared.subscriptions.lock().get(&frame.correlation_id).cloned();
    let Some(sender) = sender else { return };
    let value = htcp_value::decode(&frame.payload).map_err(HtcpError::from);
    let _ = sender.try_send(value);
}

fn deliver_end(shared: &Arc<SharedState>, frame: Frame) {
    let sender = shared.subscriptions.lock().remove(&frame.correlation_id);
    let Some(sender) = sender else { return };
    match htcp_value::decode(&frame.payload) {
        Ok(Value::Map(mut fields)) if matches!(fields.get("reason"), Some(Value::String(s)) if s == "cancelled") => {
            let _ = fields.shift_remove("reason");
            let _ = sender.try_send(Err(HtcpError::new(ErrorKind::Cancelled, "subscription cancelled")));
        }
        _ => {
            // Normal end-of-stream: drop the sender so `recv()` observes `None`.
        }
    }
}

fn fail_everything(shared: &Arc<SharedState>, err: HtcpError) {
    let pending: Vec<_> = shared.pending.lock().drain().map(|(_, v)| v).collect();
    for p in pending {
        match p {
            PendingCall::Transaction(tx) => {
                let _ = tx.send(Err(err.clone()));
            }
            PendingCall::Handshake(tx) => {
                let _ = tx.send(Err(err.clone()));
            }
            PendingCall::Info(tx) => {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }
    let subscriptions: Vec<_> = shared.subscriptions.lock().drain().map(|(_, v)| v).collect();
    for sender in subscriptions {
        let _ = sender.try_send(Err(err.clone()));
    }
}
