#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use ws_push_client::{Client, Config};

/// Mock push server.
struct MockPushServer {
    addr: SocketAddr,
    /// Broadcast payloads to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Text frames received from clients
    received_rx: mpsc::UnboundedReceiver<String>,
    /// Close codes observed from clients
    close_rx: mpsc::UnboundedReceiver<Option<u16>>,
    /// Request paths (with query) seen during handshakes
    path_rx: mpsc::UnboundedReceiver<String>,
    /// Completed handshakes so far
    connections: Arc<AtomicUsize>,
    /// While set, every live connection is dropped without a close handshake
    kick: Arc<AtomicBool>,
}

impl MockPushServer {
    /// Start a mock push server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();
        let (close_tx, close_rx) = mpsc::unbounded_channel::<Option<u16>>();
        let (path_tx, path_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicUsize::new(0));
        let kick = Arc::new(AtomicBool::new(false));

        let broadcast_tx = message_tx.clone();
        let connection_count = Arc::clone(&connections);
        let kick_signal = Arc::clone(&kick);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let handshake_path_tx = path_tx.clone();
                let callback = move |req: &Request,
                                     response: Response|
                      -> Result<Response, ErrorResponse> {
                    drop(handshake_path_tx.send(req.uri().to_string()));
                    Ok(response)
                };

                let Ok(ws_stream) =
                    tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let received = received_tx.clone();
                let closes = close_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let kicked = Arc::clone(&kick_signal);

                connection_count.fetch_add(1, Ordering::SeqCst);

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            // Handle incoming frames from the client
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(received.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        drop(closes.send(frame.map(|f| u16::from(f.code))));
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            // Handle outgoing pushes to the client
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            // Dropping the halves severs TCP with no close frame
                            () = sleep(Duration::from_millis(20)) => {
                                if kicked.load(Ordering::SeqCst) {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            received_rx,
            close_rx,
            path_rx,
            connections,
            kick,
        }
    }

    fn origin(&self) -> url::Url {
        format!("http://{}", self.addr).parse().unwrap()
    }

    /// Push a payload to all connected clients.
    fn push(&self, payload: &str) {
        drop(self.message_tx.send(payload.to_owned()));
    }

    /// Receive the next text frame a client sent.
    async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next frame that is not a heartbeat.
    async fn recv_payload(&mut self) -> Option<String> {
        loop {
            let frame = self.recv().await?;
            if frame != r#"{"type":"heartbeat"}"# {
                return Some(frame);
            }
        }
    }

    /// Receive the next close code a client sent.
    async fn recv_close(&mut self) -> Option<Option<u16>> {
        timeout(Duration::from_secs(2), self.close_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next handshake path.
    async fn recv_path(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.path_rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn wait_connections(&self, n: usize) {
        timeout(Duration::from_secs(2), async {
            while self.connections() < n {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server should see the expected connections");
    }

    fn drop_connections(&self) {
        self.kick.store(true, Ordering::SeqCst);
    }

    fn allow_reconnect(&self) {
        self.kick.store(false, Ordering::SeqCst);
    }
}

fn config(server: &MockPushServer) -> Config {
    let mut config = Config::builder().origin(server.origin()).build();
    config.heartbeat_interval = Duration::from_millis(100);
    config.reconnect.delay_unit = Duration::from_millis(50);
    config
}

fn client_for(
    server: &MockPushServer,
    target: &str,
) -> (Client, mpsc::UnboundedReceiver<String>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let client = Client::new(target, config(server), move |payload: String| {
        drop(seen_tx.send(payload));
    })
    .unwrap();

    (client, seen_rx)
}

async fn wait_connected(client: &Client) {
    let mut state = client.state_receiver();
    timeout(Duration::from_secs(2), async {
        while !state.borrow_and_update().is_connected() {
            state.changed().await.expect("driver should stay alive");
        }
    })
    .await
    .expect("client should connect in time");
}

async fn wait_disconnected(client: &Client) {
    let mut state = client.state_receiver();
    timeout(Duration::from_secs(2), async {
        while state.borrow_and_update().is_connected() {
            state.changed().await.expect("driver should stay alive");
        }
    })
    .await
    .expect("client should observe the disconnect in time");
}

#[tokio::test]
async fn delivers_pushed_messages() {
    let server = MockPushServer::start().await;
    let (client, mut seen) = client_for(&server, "/push");

    client.connect();
    wait_connected(&client).await;
    server.wait_connections(1).await;

    server.push("live update");

    let payload = timeout(Duration::from_secs(2), seen.recv()).await;
    assert_eq!(payload.unwrap().as_deref(), Some("live update"));
}

#[tokio::test]
async fn forwards_sent_payloads_to_the_server() {
    let mut server = MockPushServer::start().await;
    let (client, _seen) = client_for(&server, "/push");

    client.connect();
    wait_connected(&client).await;

    client.send("hello push").unwrap();

    assert_eq!(server.recv_payload().await.as_deref(), Some("hello push"));
}

#[tokio::test]
async fn heartbeat_frames_reach_the_server() {
    let mut server = MockPushServer::start().await;
    let (client, _seen) = client_for(&server, "/push");

    client.connect();
    wait_connected(&client).await;

    // Nothing else is sent, so the next two frames are heartbeats.
    assert_eq!(server.recv().await.as_deref(), Some(r#"{"type":"heartbeat"}"#));
    assert_eq!(server.recv().await.as_deref(), Some(r#"{"type":"heartbeat"}"#));
}

#[tokio::test]
async fn disconnect_sends_a_normal_close() {
    let mut server = MockPushServer::start().await;
    let (client, _seen) = client_for(&server, "/push");

    client.connect();
    wait_connected(&client).await;

    client.disconnect();
    wait_disconnected(&client).await;

    assert_eq!(server.recv_close().await, Some(Some(1000)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn send_while_disconnected_is_rejected() {
    let server = MockPushServer::start().await;
    let (client, _seen) = client_for(&server, "/push");

    let err = client.send("dropped").unwrap_err();
    assert!(err.to_string().contains("not connected"));

    client.connect();
    wait_connected(&client).await;
    client.disconnect();
    wait_disconnected(&client).await;

    let err = client.send("dropped").unwrap_err();
    assert!(err.to_string().contains("not connected"));
}

#[tokio::test]
async fn reconnects_after_the_server_drops_the_connection() {
    let server = MockPushServer::start().await;
    let (client, mut seen) = client_for(&server, "/push");

    client.connect();
    wait_connected(&client).await;
    server.wait_connections(1).await;

    // Sever the connection without a close handshake.
    server.drop_connections();
    wait_disconnected(&client).await;
    server.allow_reconnect();

    wait_connected(&client).await;
    server.wait_connections(2).await;

    // The replacement socket delivers pushes like the first one did.
    server.push("after reconnect");
    let payload = timeout(Duration::from_secs(2), seen.recv()).await;
    assert_eq!(payload.unwrap().as_deref(), Some("after reconnect"));
}

#[tokio::test]
async fn resolves_relative_targets_against_the_origin() {
    let mut server = MockPushServer::start().await;
    let (client, _seen) = client_for(&server, "/push?room=7&ticket=a%20b");

    client.connect();
    wait_connected(&client).await;

    assert_eq!(
        server.recv_path().await.as_deref(),
        Some("/push?room=7&ticket=a%20b")
    );
}

#[tokio::test]
async fn absolute_targets_skip_resolution() {
    let mut server = MockPushServer::start().await;

    let (seen_tx, _seen_rx) = mpsc::unbounded_channel::<String>();
    let target = format!("ws://{}/direct", server.addr);
    let client = Client::new(&target, Config::default(), move |payload: String| {
        drop(seen_tx.send(payload));
    })
    .unwrap();

    client.connect();
    wait_connected(&client).await;

    assert_eq!(server.recv_path().await.as_deref(), Some("/direct"));
}
