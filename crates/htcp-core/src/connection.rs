//! Server-side connection lifecycle: handshake, reader loop, dispatcher and
//! the subscription engine that runs one producer task per open subscription.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use htcp_registry::{HandlerContext, Registry};
use htcp_value::Value;
use htcp_wire::{read_frame, write_frame, Frame, FrameError, Kind};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::cancel::CancelSignal;
use crate::config::Config;
use crate::envelope::{Request, ServerInfo};
use crate::error::{ErrorKind, HtcpError};

/// Static identity advertised in `WELCOME`/`INFO_REP`, fixed for the server's lifetime.
#[derive(Clone, Debug)]
pub struct ServerIdentity {
    pub name: String,
    pub host: String,
    pub port: u16,
}

struct SubscriptionRun {
    cancel: CancelSignal,
    claimed: Arc<AtomicBool>,
    abort: AbortHandle,
}

/// State shared between the reader loop and every spawned call/subscription task.
struct Shared {
    outbound_tx: mpsc::Sender<Frame>,
    subscriptions: Mutex<HashMap<u64, SubscriptionRun>>,
    config: Arc<Config>,
}

impl Shared {
    async fn enqueue(&self, frame: Frame) -> Result<(), HtcpError> {
        match tokio::time::timeout(self.config.backpressure_timeout, self.outbound_tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HtcpError::new(ErrorKind::Transport, "connection writer gone")),
            Err(_) => Err(HtcpError::new(
                ErrorKind::Backpressure,
                "outbound queue did not drain in time",
            )),
        }
    }
}

/// Drive one accepted TCP connection (or any `AsyncRead + AsyncWrite` stream,
/// such as an in-memory duplex pair used by tests) through its full lifecycle:
/// handshake, request dispatch, subscription engine, and graceful teardown.
#[allow(clippy::too_many_arguments)]
pub async fn serve_connection<S>(
    stream: S,
    conn_id: u64,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    config: Arc<Config>,
    identity: Arc<ServerIdentity>,
    app_state: Arc<dyn Any + Send + Sync>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), HtcpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_capacity);
    let writer_task = tokio::spawn(run_writer(write_half, outbound_rx));

    let shared = Arc::new(Shared {
        outbound_tx,
        subscriptions: Mutex::new(HashMap::new()),
        config: config.clone(),
    });

    let handshake_result = tokio::time::timeout(
        config.handshake_timeout,
        perform_handshake(&mut read_half, &shared, &registry, &identity, &config),
    )
    .await;

    let result = match handshake_result {
        Ok(Ok(())) => {
            run_reader_loop(
                &mut read_half,
                &shared,
                &registry,
                &config,
                &identity,
                conn_id,
                peer_addr,
                app_state,
                &mut shutdown_rx,
            )
            .await
        }
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer_addr, error = %e, "handshake failed");
            Err(e)
        }
        Err(_) => {
            tracing::warn!(peer = %peer_addr, "handshake timed out");
            Err(HtcpError::new(ErrorKind::Protocol, "handshake timed out"))
        }
    };

    shutdown(&shared, &config).await;
    drop(shared);
    let _ = writer_task.await;
    result
}

async fn perform_handshake<R: AsyncRead + Unpin>(
    read_half: &mut R,
    shared: &Arc<Shared>,
    registry: &Arc<Registry>,
    identity: &ServerIdentity,
    config: &Config,
) -> Result<(), HtcpError> {
    let frame = read_frame(read_half, config.max_payload_len).await?;
    if frame.kind != Kind::Hello {
        return Err(HtcpError::new(
            ErrorKind::Protocol,
            format!("expected HELLO, got {:?}", frame.kind),
        ));
    }

    let info = ServerInfo {
        server_name: identity.name.clone(),
        host: identity.host.clone(),
        port: identity.port,
        connected: true,
        transactions: if config.expose_transactions {
            Some(registry.transaction_codes())
        } else {
            None
        },
    };
    shared
        .enqueue(Frame::new(
            Kind::Welcome,
            frame.correlation_id,
            htcp_value::encode(&info.to_value()),
        ))
        .await
}

async fn run_writer<W: AsyncWrite + Unpin>(mut write_half: W, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            tracing::warn!(error = %e, "connection write failed, closing writer");
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_reader_loop<R: AsyncRead + Unpin>(
    read_half: &mut R,
    shared: &Arc<Shared>,
    registry: &Arc<Registry>,
    config: &Arc<Config>,
    identity: &Arc<ServerIdentity>,
    conn_id: u64,
    peer_addr: SocketAddr,
    app_state: Arc<dyn Any + Send + Sync>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), HtcpError> {
    loop {
        let frame = tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    tracing::debug!(peer = %peer_addr, "server shutting down, closing connection");
                    return Ok(());
                }
                continue;
            }
            result = read_frame(read_half, config.max_payload_len) => result,
        };

        let frame = match frame {
            Ok(f) => f,
            Err(FrameError::Eof) => {
                tracing::debug!(peer = %peer_addr, "client closed connection");
                return Ok(());
            }
            Err(e) => {
                let err = HtcpError::from(e);
                tracing::warn!(peer = %peer_addr, error = %err, "connection-level error");
                return Err(err);
            }
        };

        let ctx = HandlerContext::new(conn_id, peer_addr, app_state.clone());

        match frame.kind {
            Kind::InfoReq => {
                handle_info_req(frame, shared, registry, config, identity).await?;
            }
            Kind::Call => {
                spawn_call(frame, shared.clone(), registry.clone(), ctx);
            }
            Kind::Subscribe => {
                spawn_subscription(frame, shared.clone(), registry.clone(), ctx).await;
            }
            Kind::Cancel => {
                handle_cancel(frame.correlation_id, shared);
            }
            other => {
                let err = HtcpError::new(ErrorKind::Protocol, format!("unexpected frame kind {other:?}"));
                let _ = shared
                    .enqueue(Frame::new(Kind::Error, frame.correlation_id, htcp_value::encode(&err.to_value())))
                    .await;
            }
        }
    }
}

async fn handle_info_req(
    frame: Frame,
    shared: &Arc<Shared>,
    registry: &Arc<Registry>,
    config: &Config,
    identity: &ServerIdentity,
) -> Result<(), HtcpError> {
    // Same ServerInfo shape WELCOME advertises, so a client can re-query it
    // mid-connection without a second handshake.
    let info = ServerInfo {
        server_name: identity.name.clone(),
        host: identity.host.clone(),
        port: identity.port,
        connected: true,
        transactions: if config.expose_transactions {
            Some(registry.transaction_codes())
        } else {
            None
        },
    };
    shared
        .enqueue(Frame::new(
            Kind::InfoRep,
            frame.correlation_id,
            htcp_value::encode(&info.to_value()),
        ))
        .await
}

fn spawn_call(frame: Frame, shared: Arc<Shared>, registry: Arc<Registry>, ctx: HandlerContext) {
    tokio::spawn(async move {
        let corr = frame.correlation_id;
        let reply = run_call(frame, &registry, &ctx).await;
        let out = match reply {
            Ok(value) => Frame::new(Kind::Reply, corr, htcp_value::encode(&value)),
            Err(e) => Frame::new(Kind::Error, corr, htcp_value::encode(&e.to_value())),
        };
        let _ = shared.enqueue(out).await;
    });
}

async fn run_call(frame: Frame, registry: &Registry, ctx: &HandlerContext) -> Result<Value, HtcpError> {
    let payload = htcp_value::decode(&frame.payload)?;
    let request = Request::from_value(payload, "transaction")?;

    let Some(bind_result) = registry.bind_transaction_args(&request.code, request.args) else {
        return Err(HtcpError::new(
            ErrorKind::UnknownEndpoint,
            format!("no transaction registered for `{}`", request.code),
        ));
    };
    let args = bind_result?;
    let handler = registry
        .transaction_handler(&request.code)
        .expect("handler must exist alongside its bound params");
    let value = handler.call(args, ctx).await?;
    Ok(value)
}

async fn spawn_subscription(frame: Frame, shared: Arc<Shared>, registry: Arc<Registry>, ctx: HandlerContext) {
    let corr = frame.correlation_id;

    let setup = async {
        let payload = htcp_value::decode(&frame.payload)?;
        let request = Request::from_value(payload, "event_type")?;
        let Some(bind_result) = registry.bind_subscription_args(&request.code, request.args) else {
            return Err(HtcpError::new(
                ErrorKind::UnknownEndpoint,
                format!("no subscription registered for `{}`", request.code),
            ));
        };
        let args = bind_result?;
        Ok::<_, HtcpError>((request.code, args))
    }
    .await;

    let (code, args) = match setup {
        Ok(v) => v,
        Err(e) => {
            let _ = shared
                .enqueue(Frame::new(Kind::Error, corr, htcp_value::encode(&e.to_value())))
                .await;
            return;
        }
    };

    let cancel = CancelSignal::new();
    let claimed = Arc::new(AtomicBool::new(false));
    let task_cancel = cancel.clone();
    let task_claimed = claimed.clone();
    let task_shared = shared.clone();
    let task_registry = registry.clone();

    let join = tokio::spawn(async move {
        run_subscription(corr, code, args, ctx, task_registry, task_shared, task_cancel, task_claimed).await;
    });
    let abort = join.abort_handle();

    shared
        .subscriptions
        .lock()
        .insert(corr, SubscriptionRun { cancel, claimed, abort });
}

#[allow(clippy::too_many_arguments)]
async fn run_subscription(
    corr: u64,
    code: String,
    args: Vec<Value>,
    ctx: HandlerContext,
    registry: Arc<Registry>,
    shared: Arc<Shared>,
    cancel: CancelSignal,
    claimed: Arc<AtomicBool>,
) {
    let factory = registry
        .subscription_factory(&code)
        .expect("factory must exist alongside its bound params");

    let mut handler = match factory.create(args, &ctx).await {
        Ok(h) => h,
        Err(e) => {
            finish(&shared, &claimed, corr, terminal_error_frame(corr, e.into())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                finish(&shared, &claimed, corr, terminal_cancelled_frame(corr)).await;
                return;
            }
            item = handler.next() => {
                match item {
                    Ok(Some(value)) => {
                        if shared.enqueue(Frame::new(Kind::Item, corr, htcp_value::encode(&value))).await.is_err() {
                            finish_silently(&shared, &claimed, corr).await;
                            return;
                        }
                    }
                    Ok(None) => {
                        finish(&shared, &claimed, corr, Frame::new(Kind::End, corr, htcp_value::encode(&Value::Null))).await;
                        return;
                    }
                    Err(e) => {
                        finish(&shared, &claimed, corr, terminal_error_frame(corr, e.into())).await;
                        return;
                    }
                }
            }
        }
    }
}

fn terminal_error_frame(corr: u64, e: HtcpError) -> Frame {
    Frame::new(Kind::Error, corr, htcp_value::encode(&e.to_value()))
}

fn terminal_cancelled_frame(corr: u64) -> Frame {
    let mut fields = htcp_value::Fields::new();
    fields.insert("reason".into(), Value::String("cancelled".into()));
    Frame::new(Kind::End, corr, htcp_value::encode(&Value::Map(fields)))
}

/// Claim the right to finish this subscription (racing the cancel watchdog);
/// if we win, remove it from the map and send the terminal frame.
async fn finish(shared: &Arc<Shared>, claimed: &Arc<AtomicBool>, corr: u64, frame: Frame) {
    if claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
        return;
    }
    shared.subscriptions.lock().remove(&corr);
    let _ = shared.enqueue(frame).await;
}

/// Like [`finish`] but used when the connection is already going away and
/// there is nowhere to send a terminal frame.
async fn finish_silently(shared: &Arc<Shared>, claimed: &Arc<AtomicBool>, corr: u64) {
    if claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
        return;
    }
    shared.subscriptions.lock().remove(&corr);
}

fn handle_cancel(corr: u64, shared: &Arc<Shared>) {
    let run = {
        let map = shared.subscriptions.lock();
        map.get(&corr).map(|r| (r.cancel.clone(), r.claimed.clone(), r.abort.clone()))
    };
    let Some((cancel, claimed, abort)) = run else {
        return;
    };
    cancel.cancel();

    let grace = shared.config.subscription_cancel_grace;
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            abort.abort();
            shared.subscriptions.lock().remove(&corr);
            let _ = shared.enqueue(terminal_cancelled_frame(corr)).await;
        }
    });
}

/// Cancel every open subscription and give producers a grace period to
/// finish, then drop the outbound sender so the writer task exits once it
/// drains what's already queued (bounded by `shutdown_drain_deadline`).
async fn shutdown(shared: &Arc<Shared>, config: &Config) {
    let runs: Vec<(u64, CancelSignal, Arc<AtomicBool>, AbortHandle)> = {
        let map = shared.subscriptions.lock();
        map.iter()
            .map(|(corr, r)| (*corr, r.cancel.clone(), r.claimed.clone(), r.abort.clone()))
            .collect()
    };
    for (_, cancel, _, _) in &runs {
        cancel.cancel();
    }
    tokio::time::sleep(short_grace(config.subscription_cancel_grace)).await;
    for (corr, _, claimed, abort) in &runs {
        if claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            abort.abort();
            let _ = shared.enqueue(terminal_cancelled_frame(*corr)).await;
        }
    }
    shared.subscriptions.lock().clear();
}

fn short_grace(grace: Duration) -> Duration {
    grace.min(Duration::from_millis(500))
}
