//! HTCP echo client demo.
//!
//! Connects to the `echo-server` demo, calls `get_welcome`, then opens the
//! `counter` subscription and prints five items before unsubscribing.
//!
//! ```text
//! cargo run -p echo-server &
//! cargo run -p echo-client
//! ```

use htcp::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr = "127.0.0.1:9000";
    println!("connecting to {addr}...");
    let client = HtcpClient::connect_tcp(addr).await?;
    println!("connected: {:?}", client.server_info());

    let mut args = Fields::new();
    args.insert("client_name".into(), Value::String("John".into()));
    let reply = client.call("get_welcome", args).await?;
    println!("get_welcome -> {reply:?}");

    let mut sub_args = Fields::new();
    sub_args.insert("start".into(), Value::Int(100));
    sub_args.insert("step".into(), Value::Int(10));
    sub_args.insert("delay".into(), Value::Float(0.2));
    let mut subscription = client.subscribe("counter", sub_args).await?;

    print!("counter items: ");
    for _ in 0..5 {
        match subscription.recv().await {
            Some(Ok(item)) => print!("{item:?} "),
            Some(Err(e)) => {
                eprintln!("subscription error: {e}");
                break;
            }
            None => break,
        }
    }
    println!();

    subscription.unsubscribe().await;
    client.disconnect().await;
    Ok(())
}
