//! HTCP echo server demo.
//!
//! Registers a `get_welcome` transaction and a `counter` subscription, then
//! serves them over TCP until Ctrl-C.
//!
//! ```text
//! cargo run -p echo-server
//! ```

use std::sync::Arc;
use std::time::Duration;

use htcp::prelude::*;
use htcp::{HandlerFuture, ParamDesc, SubscriptionFactory, SubscriptionHandler, ValueKind};

struct CounterHandler {
    value: i64,
    step: i64,
    delay: Duration,
}

impl SubscriptionHandler for CounterHandler {
    fn next(&mut self) -> HandlerFuture<'_, Result<Option<Value>, HandlerError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            let mut fields = Fields::new();
            fields.insert("value".into(), Value::Int(self.value));
            self.value += self.step;
            Ok(Some(Value::Map(fields)))
        })
    }
}

struct CounterFactory;

impl SubscriptionFactory for CounterFactory {
    fn create<'a>(
        &'a self,
        args: Vec<Value>,
        _ctx: &'a HandlerContext,
    ) -> HandlerFuture<'a, Result<Box<dyn SubscriptionHandler>, HandlerError>> {
        Box::pin(async move {
            let start = i64::from_value(args[0].clone()).map_err(|e| HandlerError::from(e.to_string()))?;
            let step = i64::from_value(args[1].clone()).map_err(|e| HandlerError::from(e.to_string()))?;
            let delay_secs =
                f64::from_value(args[2].clone()).map_err(|e| HandlerError::from(e.to_string()))?;
            Ok(Box::new(CounterHandler {
                value: start,
                step,
                delay: Duration::from_secs_f64(delay_secs),
            }) as Box<dyn SubscriptionHandler>)
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr = "127.0.0.1:9000";
    let server = ServerBuilder::new("echo-demo", "127.0.0.1", 9000)
        .transaction(
            "get_welcome",
            vec![ParamDesc {
                name: "client_name".into(),
                type_hint: Some(ValueKind::String),
                default: None,
            }],
            |args: Vec<Value>, _ctx: &HandlerContext| {
                Box::pin(async move {
                    let Value::String(name) = &args[0] else {
                        unreachable!("bind_args enforces the client_name type hint");
                    };
                    Ok(Value::Seq(vec![Value::String(format!("Welcome {name}!")), Value::Int(0)]))
                }) as HandlerFuture<'static, Result<Value, HandlerError>>
            },
        )
        .subscription(
            "counter",
            vec![
                ParamDesc {
                    name: "start".into(),
                    type_hint: Some(ValueKind::Int),
                    default: Some(Value::Int(0)),
                },
                ParamDesc {
                    name: "step".into(),
                    type_hint: Some(ValueKind::Int),
                    default: Some(Value::Int(1)),
                },
                ParamDesc {
                    name: "delay".into(),
                    type_hint: Some(ValueKind::Float),
                    default: Some(Value::Float(1.0)),
                },
            ],
            CounterFactory,
        )
        .build();
    let server = Arc::new(server);

    tracing::info!(addr, "starting htcp echo server");
    let serving = {
        let server = server.clone();
        let addr = addr.to_string();
        tokio::spawn(async move { server.up(&addr).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.down().await;
    serving.await??;

    Ok(())
}
