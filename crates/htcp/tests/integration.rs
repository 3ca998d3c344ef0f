//! End-to-end scenarios over a real TCP loopback connection: handshake,
//! transactions with scalar/binary/record arguments, a bounded subscription,
//! and a subscription torn down by a dropped connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use htcp::prelude::*;
use htcp::{
    Config, ErrorKind, HandlerError, HtcpServer, ParamDesc, SubscriptionFactory, SubscriptionHandler,
    ValueKind,
};
use htcp_value::{EncodingError, Fields, Record};

async fn spawn_server(server: HtcpServer) -> (Arc<HtcpServer>, String) {
    let server = Arc::new(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let up_server = server.clone();
    let bind_addr = addr.to_string();
    let up_addr = bind_addr.clone();
    tokio::spawn(async move {
        up_server.up(&up_addr).await.unwrap();
    });
    // Give the listener a moment to actually bind before clients connect.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, bind_addr)
}

#[tokio::test]
async fn e1_welcome() {
    let server = ServerBuilder::new("example", "127.0.0.1", 0).build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let info = client.server_info();
    assert_eq!(info.server_name, "example");
    assert_eq!(info.host, "127.0.0.1");
    assert!(info.connected);

    client.disconnect().await;
    server.down().await;
}

#[tokio::test]
async fn e2_echo_transaction() {
    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .transaction(
            "get_welcome",
            vec![ParamDesc {
                name: "client_name".into(),
                type_hint: None,
                default: None,
            }],
            |args: Vec<Value>, _ctx: &HandlerContext| {
                Box::pin(async move {
                    let Value::String(name) = &args[0] else {
                        return Err(HandlerError::from("client_name must be a string"));
                    };
                    Ok(Value::Seq(vec![
                        Value::String(format!("Welcome {name}!")),
                        Value::Int(0),
                    ]))
                }) as htcp::HandlerFuture<'static, Result<Value, HandlerError>>
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let mut args = Fields::new();
    args.insert("client_name".into(), Value::String("John".into()));
    let reply = client.call("get_welcome", args).await.unwrap();
    assert_eq!(
        reply,
        Value::Seq(vec![Value::String("Welcome John!".into()), Value::Int(0)])
    );

    client.disconnect().await;
    server.down().await;
}

#[tokio::test]
async fn e3_binary_argument() {
    let observed_len = Arc::new(AtomicUsize::new(0));
    let handler_len = observed_len.clone();

    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .transaction(
            "upload_file",
            vec![
                ParamDesc {
                    name: "file_name".into(),
                    type_hint: None,
                    default: None,
                },
                ParamDesc {
                    name: "file_body".into(),
                    type_hint: None,
                    default: None,
                },
            ],
            move |args: Vec<Value>, _ctx: &HandlerContext| {
                let handler_len = handler_len.clone();
                Box::pin(async move {
                    let Value::Bytes(body) = &args[1] else {
                        return Err(HandlerError::from("file_body must be bytes"));
                    };
                    handler_len.store(body.len(), Ordering::SeqCst);
                    Ok(Value::String("ok".into()))
                }) as htcp::HandlerFuture<'static, Result<Value, HandlerError>>
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let mut args = Fields::new();
    args.insert("file_name".into(), Value::String("example.txt".into()));
    args.insert("file_body".into(), Value::Bytes(b"Hello World!".to_vec()));
    let reply = client.call("upload_file", args).await.unwrap();
    assert_eq!(reply, Value::String("ok".into()));
    assert_eq!(observed_len.load(Ordering::SeqCst), 12);

    client.disconnect().await;
    server.down().await;
}

struct CustomData {
    text: String,
}

impl Record for CustomData {
    const TYPE_NAME: &'static str = "CustomData";

    fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("text".into(), Value::String(self.text.clone()));
        fields
    }

    fn from_fields(mut fields: Fields) -> Result<Self, EncodingError> {
        let Some(Value::String(text)) = fields.shift_remove("text") else {
            return Err(EncodingError::MissingField("text".into()));
        };
        Ok(Self { text })
    }
}

#[tokio::test]
async fn e4_record_round_trip() {
    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .transaction(
            "send_custom_data",
            vec![ParamDesc {
                name: "my_custom_data".into(),
                type_hint: None,
                default: None,
            }],
            |args: Vec<Value>, _ctx: &HandlerContext| {
                Box::pin(async move {
                    let _incoming = CustomData::from_value(args.into_iter().next().unwrap())
                        .map_err(|e| HandlerError::from(e.to_string()))?;
                    let reply = CustomData {
                        text: "message handled".into(),
                    };
                    Ok(reply.to_value())
                }) as htcp::HandlerFuture<'static, Result<Value, HandlerError>>
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let mut args = Fields::new();
    args.insert(
        "my_custom_data".into(),
        (CustomData { text: "a".into() }).to_value(),
    );
    let reply = client.call("send_custom_data", args).await.unwrap();
    let result = CustomData::from_value(reply).unwrap();
    assert_eq!(result.text, "message handled");

    client.disconnect().await;
    server.down().await;
}

struct CounterHandler {
    value: i64,
    step: i64,
    delay: Duration,
    dropped_flag: Arc<AtomicBool>,
}

impl Drop for CounterHandler {
    fn drop(&mut self) {
        self.dropped_flag.store(true, Ordering::SeqCst);
    }
}

impl SubscriptionHandler for CounterHandler {
    fn next(&mut self) -> htcp::HandlerFuture<'_, Result<Option<Value>, HandlerError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            let mut fields = Fields::new();
            fields.insert("value".into(), Value::Int(self.value));
            self.value += self.step;
            Ok(Some(Value::Map(fields)))
        })
    }
}

struct CounterFactory {
    dropped_flag: Arc<AtomicBool>,
}

impl SubscriptionFactory for CounterFactory {
    fn create<'a>(
        &'a self,
        args: Vec<Value>,
        _ctx: &'a HandlerContext,
    ) -> htcp::HandlerFuture<'a, Result<Box<dyn SubscriptionHandler>, HandlerError>> {
        Box::pin(async move {
            let start = i64::from_value(args[0].clone()).map_err(|e| HandlerError::from(e.to_string()))?;
            let step = i64::from_value(args[1].clone()).map_err(|e| HandlerError::from(e.to_string()))?;
            let delay_secs = f64::from_value(args[2].clone()).map_err(|e| HandlerError::from(e.to_string()))?;
            self.dropped_flag.store(false, Ordering::SeqCst);
            Ok(Box::new(CounterHandler {
                value: start,
                step,
                delay: Duration::from_secs_f64(delay_secs),
                dropped_flag: self.dropped_flag.clone(),
            }) as Box<dyn SubscriptionHandler>)
        })
    }
}

#[tokio::test]
async fn e5_bounded_subscription() {
    let dropped_flag = Arc::new(AtomicBool::new(false));
    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .subscription(
            "counter",
            vec![
                ParamDesc {
                    name: "start".into(),
                    type_hint: None,
                    default: None,
                },
                ParamDesc {
                    name: "step".into(),
                    type_hint: None,
                    default: None,
                },
                ParamDesc {
                    name: "delay".into(),
                    type_hint: None,
                    default: None,
                },
            ],
            CounterFactory {
                dropped_flag: dropped_flag.clone(),
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let mut args = Fields::new();
    args.insert("start".into(), Value::Int(100));
    args.insert("step".into(), Value::Int(10));
    args.insert("delay".into(), Value::Float(0.05));
    let mut subscription = client.subscribe("counter", args).await.unwrap();

    let mut values = Vec::new();
    for _ in 0..5 {
        let item = subscription.recv().await.unwrap().unwrap();
        let Value::Map(fields) = item else { panic!("expected a mapping item") };
        let Some(Value::Int(v)) = fields.get("value") else {
            panic!("missing value field")
        };
        values.push(*v);
    }
    assert_eq!(values, vec![100, 110, 120, 130, 140]);

    subscription.unsubscribe().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        dropped_flag.load(Ordering::SeqCst),
        "producer should be torn down well within 500ms of scope exit"
    );

    client.disconnect().await;
    server.down().await;
}

struct HeartbeatHandler {
    dropped_flag: Arc<AtomicBool>,
}

impl Drop for HeartbeatHandler {
    fn drop(&mut self) {
        self.dropped_flag.store(true, Ordering::SeqCst);
    }
}

impl SubscriptionHandler for HeartbeatHandler {
    fn next(&mut self) -> htcp::HandlerFuture<'_, Result<Option<Value>, HandlerError>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(Value::Null))
        })
    }
}

struct HeartbeatFactory {
    dropped_flag: Arc<AtomicBool>,
}

impl SubscriptionFactory for HeartbeatFactory {
    fn create<'a>(
        &'a self,
        _args: Vec<Value>,
        _ctx: &'a HandlerContext,
    ) -> htcp::HandlerFuture<'a, Result<Box<dyn SubscriptionHandler>, HandlerError>> {
        let dropped_flag = self.dropped_flag.clone();
        Box::pin(async move {
            dropped_flag.store(false, Ordering::SeqCst);
            Ok(Box::new(HeartbeatHandler { dropped_flag }) as Box<dyn SubscriptionHandler>)
        })
    }
}

#[tokio::test]
async fn e6_mid_subscription_disconnect() {
    let dropped_flag = Arc::new(AtomicBool::new(false));
    let mut config = Config::default();
    config.subscription_cancel_grace = Duration::from_millis(200);

    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .config(config)
        .subscription(
            "heartbeat",
            vec![],
            HeartbeatFactory {
                dropped_flag: dropped_flag.clone(),
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let _subscription = client.subscribe("heartbeat", Fields::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Abandon the connection without sending CANCEL.
    drop(client);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        dropped_flag.load(Ordering::SeqCst),
        "server should tear down the subscription once the socket disappears"
    );

    server.down().await;
}

#[tokio::test]
async fn e7_server_shutdown_closes_open_subscription() {
    let dropped_flag = Arc::new(AtomicBool::new(false));
    let mut config = Config::default();
    config.subscription_cancel_grace = Duration::from_millis(50);

    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .config(config)
        .subscription(
            "heartbeat",
            vec![],
            HeartbeatFactory {
                dropped_flag: dropped_flag.clone(),
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let mut subscription = client.subscribe("heartbeat", Fields::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Signal shutdown while the client connection is still open and the
    // subscription is still pending its first item — the connection's own
    // reader loop must notice and run its teardown rather than blocking
    // forever on a read that will never come.
    server.down().await;

    let terminal = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("server shutdown should close the subscription promptly")
        .expect("subscription should see a terminal frame, not a silent drop");
    assert_eq!(terminal.unwrap_err().kind, ErrorKind::Cancelled);
    assert!(dropped_flag.load(Ordering::SeqCst));

    client.disconnect().await;
}

#[tokio::test]
async fn e8_info_req_matches_welcome() {
    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .transaction("ping", vec![], |_args: Vec<Value>, _ctx: &HandlerContext| {
            Box::pin(async move { Ok(Value::Null) }) as htcp::HandlerFuture<'static, Result<Value, HandlerError>>
        })
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let welcome = client.server_info();
    let info = client.info().await.unwrap();
    assert_eq!(info, welcome);

    client.disconnect().await;
    server.down().await;
}

#[tokio::test]
async fn mistyped_argument_is_bad_request_not_handler_error() {
    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .transaction(
            "double",
            vec![ParamDesc {
                name: "n".into(),
                type_hint: Some(ValueKind::Int),
                default: None,
            }],
            |args: Vec<Value>, _ctx: &HandlerContext| {
                Box::pin(async move {
                    let Value::Int(n) = args[0] else {
                        unreachable!("bind_args enforces the n type hint");
                    };
                    Ok(Value::Int(n * 2))
                }) as htcp::HandlerFuture<'static, Result<Value, HandlerError>>
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();
    let mut args = Fields::new();
    args.insert("n".into(), Value::String("not a number".into()));
    let err = client.call("double", args).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadRequest);

    client.disconnect().await;
    server.down().await;
}

#[tokio::test]
async fn bad_request_does_not_poison_the_connection() {
    let server = ServerBuilder::new("example", "127.0.0.1", 0)
        .transaction(
            "echo",
            vec![ParamDesc {
                name: "message".into(),
                type_hint: None,
                default: None,
            }],
            |args: Vec<Value>, _ctx: &HandlerContext| {
                Box::pin(async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) })
                    as htcp::HandlerFuture<'static, Result<Value, HandlerError>>
            },
        )
        .build();
    let (server, addr) = spawn_server(server).await;

    let client = HtcpClient::connect_tcp(&addr).await.unwrap();

    let mut bad_args = Fields::new();
    bad_args.insert("message".into(), Value::String("hi".into()));
    bad_args.insert("extra".into(), Value::Null);
    let err = client.call("echo", bad_args).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadRequest);

    let mut good_args = Fields::new();
    good_args.insert("message".into(), Value::String("hi".into()));
    let reply = client.call("echo", good_args).await.unwrap();
    assert_eq!(reply, Value::String("hi".into()));

    client.disconnect().await;
    server.down().await;
}
