//! Connect to a push endpoint and print every payload the server delivers.
//!
//! ```sh
//! cargo run --example push --features tracing -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use ws_push_client::{Client, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let client = Client::new(&target, Config::default(), |payload: String| {
        println!("push: {payload}");
    })?;

    client.connect();

    let mut state = client.state_receiver();
    while !state.borrow_and_update().is_connected() {
        state.changed().await?;
    }
    println!("connected to {target}");

    client.send("hello from ws-push-client")?;

    tokio::time::sleep(Duration::from_secs(30)).await;
    client.disconnect();
    Ok(())
}
