#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::Result;
use crate::config::Config;
use crate::endpoint;
use crate::error::Error;
use crate::traits::MessageHandler;
use crate::transport::{
    Connect, NORMAL_CLOSURE, NetConnector, SocketEvent, SocketSink, SocketStream,
};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live socket
    Disconnected,
    /// Open socket with an active heartbeat
    Connected,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Fixed keep-alive frame sent while connected.
#[derive(Serialize)]
struct Heartbeat {
    #[serde(rename = "type")]
    kind: &'static str,
}

fn heartbeat_frame() -> String {
    serde_json::to_string(&Heartbeat { kind: "heartbeat" }).expect("heartbeat frame serializes")
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Connect,
    Disconnect,
}

/// How a connected session ended.
enum SessionEnd {
    /// A local `disconnect()` closed the socket; nothing is rescheduled.
    Intentional,
    /// The transport closed on its own; a reconnect gets scheduled.
    Abnormal,
    /// Every client handle is gone.
    Shutdown,
}

/// Manages a WebSocket push channel: lifecycle, reconnection, and heartbeat.
///
/// The handle is cheap to clone; all socket and timer state lives in a single
/// driver task spawned at construction, so at most one live socket, one
/// heartbeat timer, and one pending reconnect timer exist at any instant.
///
/// `connect` and `disconnect` return immediately: the open and close outcomes
/// arrive later through the state watch channel, never synchronously.
///
/// # Example
///
/// ```ignore
/// let client = Client::new("/live?room=7", config, |payload: String| {
///     println!("push: {payload}");
/// })?;
///
/// client.connect();
/// ```
#[derive(Clone)]
pub struct Client {
    /// Lifecycle commands for the driver task
    command_tx: mpsc::UnboundedSender<Command>,
    /// Outbound payloads for the live socket
    outbound_tx: mpsc::UnboundedSender<String>,
    /// Watch channel receiver for state changes
    state_rx: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Create a client for `target` using the production transport.
    ///
    /// `target` is either an absolute `ws://`/`wss://` URL or a path
    /// (optionally with a query string) resolved against `config.origin`.
    /// The driver task starts immediately but stays idle until
    /// [`connect`](Self::connect) is called.
    pub fn new<H>(target: &str, config: Config, handler: H) -> Result<Self>
    where
        H: MessageHandler,
    {
        Self::with_connector(target, config, handler, NetConnector)
    }

    /// Create a client over a custom [`Connect`] implementation.
    pub fn with_connector<H, C>(
        target: &str,
        config: Config,
        handler: H,
        connector: C,
    ) -> Result<Self>
    where
        H: MessageHandler,
        C: Connect,
    {
        // Fail fast so per-attempt resolution inside the driver cannot.
        endpoint::resolve(config.origin.as_ref(), target)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            target: target.to_owned(),
            config,
            connector: Arc::new(connector),
            handler: Arc::new(handler),
            command_rx,
            outbound_rx,
            state_tx,
            attempts: 0,
        };

        tokio::spawn(driver.run());

        Ok(Self {
            command_tx,
            outbound_tx,
            state_rx,
        })
    }

    /// Open the push channel.
    ///
    /// Returns immediately; observe the open through
    /// [`state_receiver`](Self::state_receiver). Idempotent in intent: calling it while
    /// connected is a no-op, and calling it while a reconnect delay is
    /// pending collapses the delay into an immediate attempt.
    pub fn connect(&self) {
        _ = self.command_tx.send(Command::Connect);
    }

    /// Close the push channel with a normal-closure code.
    ///
    /// Cancels any pending heartbeat and reconnect timers in the same turn of
    /// the driver's event loop; the closure is marked intentional so no
    /// reconnect is scheduled.
    pub fn disconnect(&self) {
        _ = self.command_tx.send(Command::Disconnect);
    }

    /// Transmit `payload` verbatim over the live socket.
    ///
    /// Fails synchronously with a "not connected" error while the channel is
    /// down; nothing is queued or retried.
    pub fn send(&self, payload: &str) -> Result<()> {
        if !self.state_rx.borrow().is_connected() {
            return Err(Error::not_connected());
        }
        self.outbound_tx
            .send(payload.to_owned())
            .map_err(|_e| Error::not_connected())?;
        Ok(())
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Check if the channel is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection state changes.
    ///
    /// Returns a receiver that notifies on every transition, for UI layers or
    /// anything else that reacts to connectivity.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

struct Driver {
    target: String,
    config: Config,
    connector: Arc<dyn Connect>,
    handler: Arc<dyn MessageHandler>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    state_tx: watch::Sender<ConnectionState>,
    /// Consecutive abnormal closures since the last successful open
    attempts: u32,
}

impl Driver {
    /// Idle loop: wait for a connect command, run sessions until an
    /// intentional disconnect sends us back here.
    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                Command::Connect => {
                    if self.session_loop().await.is_break() {
                        return;
                    }
                }
                Command::Disconnect => {
                    // Already disconnected.
                }
            }
        }
    }

    /// Dial, drive the socket, and keep retrying on abnormal closure until a
    /// local disconnect (`Continue`) or the last handle drops (`Break`).
    async fn session_loop(&mut self) -> ControlFlow<()> {
        loop {
            match endpoint::resolve(self.config.origin.as_ref(), &self.target) {
                Ok(url) => match self.connector.connect(&url).await {
                    Ok((sink, stream)) => {
                        self.attempts = 0;
                        _ = self.state_tx.send(ConnectionState::Connected);

                        let end = self.drive(sink, stream).await;
                        _ = self.state_tx.send(ConnectionState::Disconnected);

                        match end {
                            SessionEnd::Intentional => return ControlFlow::Continue(()),
                            SessionEnd::Shutdown => return ControlFlow::Break(()),
                            SessionEnd::Abnormal => {}
                        }
                    }
                    Err(e) => {
                        // The socket never opened; counts as an abnormal closure.
                        #[cfg(feature = "tracing")]
                        tracing::warn!("unable to connect: {e:?}");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                },
                Err(e) => {
                    // Unreachable after construction-time validation.
                    #[cfg(feature = "tracing")]
                    tracing::error!("unable to resolve target: {e:?}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }

            let delay = self.config.reconnect.delay_for_attempt(self.attempts);
            self.attempts = self.attempts.saturating_add(1);

            #[cfg(feature = "tracing")]
            tracing::debug!(?delay, attempt = self.attempts, "reconnect scheduled");

            tokio::select! {
                () = time::sleep(delay) => {}
                command = self.command_rx.recv() => match command {
                    // Collapse the pending delay into an immediate attempt.
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => return ControlFlow::Continue(()),
                    None => return ControlFlow::Break(()),
                }
            }
        }
    }

    /// Event loop for one open socket.
    async fn drive(
        &mut self,
        mut sink: Box<dyn SocketSink>,
        mut stream: Box<dyn SocketStream>,
    ) -> SessionEnd {
        // Payloads accepted for a superseded socket are not replayed.
        while self.outbound_rx.try_recv().is_ok() {}

        let period = self.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Disconnect) => {
                        if let Err(e) = sink.close(NORMAL_CLOSURE).await {
                            #[cfg(feature = "tracing")]
                            tracing::debug!("close failed: {e:?}");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                        return SessionEnd::Intentional;
                    }
                    Some(Command::Connect) => {
                        // Already connected.
                    }
                    None => {
                        _ = sink.close(NORMAL_CLOSURE).await;
                        return SessionEnd::Shutdown;
                    }
                },

                event = stream.next_event() => match event {
                    Some(SocketEvent::Message(payload)) => {
                        self.handler.on_message(payload);
                    }
                    Some(SocketEvent::Error(e)) => {
                        // An error alone never changes state; the transport
                        // always follows it with a close.
                        #[cfg(feature = "tracing")]
                        tracing::warn!("socket error: {e:?}");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                    Some(SocketEvent::Closed(code)) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(?code, "socket closed");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &code;
                        return SessionEnd::Abnormal;
                    }
                    None => return SessionEnd::Abnormal,
                },

                Some(payload) = self.outbound_rx.recv() => {
                    if let Err(e) = sink.send(payload).await {
                        // Surfaces on the read side as an error then a close.
                        #[cfg(feature = "tracing")]
                        tracing::warn!("send failed: {e:?}");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(heartbeat_frame()).await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("heartbeat failed: {e:?}");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Do not need additional syntax for setting up tests"
)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::task;
    use tokio_tungstenite::tungstenite;

    use super::*;
    use crate::error::Kind;

    const HEARTBEAT_FRAME: &str = r#"{"type":"heartbeat"}"#;

    /// Connector handing out pre-scripted in-memory sockets; dials beyond the
    /// script fail, which the driver treats as abnormal closures.
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        inner: Arc<ScriptedInner>,
    }

    #[derive(Default)]
    struct ScriptedInner {
        sessions: StdMutex<VecDeque<ScriptedSession>>,
        dialed: StdMutex<Vec<String>>,
    }

    struct ScriptedSession {
        events: mpsc::UnboundedReceiver<SocketEvent>,
        sent: mpsc::UnboundedSender<String>,
        close_code: Arc<StdMutex<Option<u16>>>,
    }

    /// Test-side handle playing the remote server for one scripted socket.
    struct RemoteControl {
        events: mpsc::UnboundedSender<SocketEvent>,
        sent: mpsc::UnboundedReceiver<String>,
        close_code: Arc<StdMutex<Option<u16>>>,
    }

    impl ScriptedConnector {
        fn push_session(&self) -> RemoteControl {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let close_code = Arc::new(StdMutex::new(None));

            self.inner
                .sessions
                .lock()
                .unwrap()
                .push_back(ScriptedSession {
                    events: event_rx,
                    sent: sent_tx,
                    close_code: Arc::clone(&close_code),
                });

            RemoteControl {
                events: event_tx,
                sent: sent_rx,
                close_code,
            }
        }

        fn dials(&self) -> usize {
            self.inner.dialed.lock().unwrap().len()
        }

        fn dialed_urls(&self) -> Vec<String> {
            self.inner.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connect for ScriptedConnector {
        async fn connect(
            &self,
            url: &str,
        ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>)> {
            self.inner.dialed.lock().unwrap().push(url.to_owned());

            match self.inner.sessions.lock().unwrap().pop_front() {
                Some(session) => Ok((
                    Box::new(ScriptedSink {
                        sent: session.sent,
                        close_code: session.close_code,
                    }),
                    Box::new(ScriptedStream {
                        events: session.events,
                    }),
                )),
                None => Err(tungstenite::Error::ConnectionClosed.into()),
            }
        }
    }

    struct ScriptedSink {
        sent: mpsc::UnboundedSender<String>,
        close_code: Arc<StdMutex<Option<u16>>>,
    }

    #[async_trait]
    impl SocketSink for ScriptedSink {
        async fn send(&mut self, text: String) -> Result<()> {
            self.sent
                .send(text)
                .map_err(|_e| Error::from(tungstenite::Error::ConnectionClosed))
        }

        async fn close(&mut self, code: u16) -> Result<()> {
            *self.close_code.lock().unwrap() = Some(code);
            Ok(())
        }
    }

    struct ScriptedStream {
        events: mpsc::UnboundedReceiver<SocketEvent>,
    }

    #[async_trait]
    impl SocketStream for ScriptedStream {
        async fn next_event(&mut self) -> Option<SocketEvent> {
            self.events.recv().await
        }
    }

    impl RemoteControl {
        fn push_text(&self, payload: &str) {
            _ = self
                .events
                .send(SocketEvent::Message(payload.to_owned()));
        }

        fn fail(&self) {
            _ = self
                .events
                .send(SocketEvent::Error(tungstenite::Error::AttackAttempt));
        }

        fn close(&self, code: u16) {
            _ = self.events.send(SocketEvent::Closed(Some(code)));
        }

        fn try_sent(&mut self) -> Option<String> {
            self.sent.try_recv().ok()
        }

        fn close_code(&self) -> Option<u16> {
            *self.close_code.lock().unwrap()
        }
    }

    /// Let the driver task process everything queued so far.
    async fn settle() {
        for _ in 0_u8..32 {
            task::yield_now().await;
        }
    }

    fn client_with(
        connector: &ScriptedConnector,
        config: Config,
    ) -> (Client, mpsc::UnboundedReceiver<String>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let client = Client::with_connector(
            "ws://push.test/live",
            config,
            move |payload: String| {
                _ = seen_tx.send(payload);
            },
            connector.clone(),
        )
        .unwrap();

        (client, seen_rx)
    }

    async fn connected_client(
        connector: &ScriptedConnector,
    ) -> (Client, RemoteControl, mpsc::UnboundedReceiver<String>) {
        let remote = connector.push_session();
        let (client, seen) = client_with(connector, Config::default());

        client.connect();
        settle().await;
        assert!(client.is_connected(), "client should connect to the script");

        (client, remote, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reports_connected_after_open() {
        let connector = ScriptedConnector::default();
        let _remote = connector.push_session();
        let (client, _seen) = client_with(&connector, Config::default());

        assert!(!client.is_connected());

        client.connect();
        settle().await;

        assert!(client.is_connected());
        assert_eq!(connector.dials(), 1, "one dial per connect");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_connected() {
        let connector = ScriptedConnector::default();
        let (client, _remote, _seen) = connected_client(&connector).await;

        client.connect();
        settle().await;

        assert!(client.is_connected());
        assert_eq!(connector.dials(), 1, "no second socket while connected");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_at_the_interval_mark_not_before() {
        let connector = ScriptedConnector::default();
        let (_client, mut remote, _seen) = connected_client(&connector).await;

        time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert!(
            remote.try_sent().is_none(),
            "nothing goes out before the 30s mark"
        );

        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(remote.try_sent().as_deref(), Some(HEARTBEAT_FRAME));
        assert!(remote.try_sent().is_none(), "exactly one frame per tick");

        time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(remote.try_sent().as_deref(), Some(HEARTBEAT_FRAME));
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_payloads_in_arrival_order() {
        let connector = ScriptedConnector::default();
        let (_client, remote, mut seen) = connected_client(&connector).await;

        remote.push_text("test data");
        settle().await;

        assert_eq!(seen.try_recv().ok().as_deref(), Some("test data"));
        assert!(seen.try_recv().is_err(), "handler runs exactly once");

        remote.push_text("a");
        remote.push_text("b");
        remote.push_text("c");
        settle().await;

        assert_eq!(seen.try_recv().ok().as_deref(), Some("a"));
        assert_eq!(seen.try_recv().ok().as_deref(), Some("b"));
        assert_eq!(seen.try_recv().ok().as_deref(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_normally_and_stays_down() {
        let connector = ScriptedConnector::default();
        let (client, remote, _seen) = connected_client(&connector).await;

        client.disconnect();
        settle().await;

        assert!(!client.is_connected());
        assert_eq!(remote.close_code(), Some(1000));

        time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(
            connector.dials(),
            1,
            "intentional disconnect never reconnects"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_a_pending_reconnect() {
        let connector = ScriptedConnector::default();
        let (client, remote, _seen) = connected_client(&connector).await;

        remote.close(1006);
        settle().await;
        assert!(!client.is_connected());

        client.disconnect();
        settle().await;

        time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(connector.dials(), 1, "the armed reconnect was cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_backs_off_linearly() {
        let connector = ScriptedConnector::default();
        let (client, remote, _seen) = connected_client(&connector).await;

        remote.close(1006);
        settle().await;
        assert!(!client.is_connected());
        assert_eq!(connector.dials(), 1);

        // First reconnect at exactly 1s.
        time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(connector.dials(), 1, "reconnect waits the full delay");
        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.dials(), 2);

        // That dial failed (script exhausted): next attempt at exactly 2s.
        time::advance(Duration::from_millis(1999)).await;
        settle().await;
        assert_eq!(connector.dials(), 2);
        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.dials(), 3);

        // And the one after that at 3s.
        time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(connector.dials(), 4);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_counter_resets_on_successful_open() {
        let connector = ScriptedConnector::default();
        let (client, remote, _seen) = connected_client(&connector).await;

        remote.close(1006);
        settle().await;
        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(connector.dials(), 2, "dial after 1s fails, script empty");

        // Second attempt (after 2s) finds a fresh session and opens.
        let remote2 = connector.push_session();
        time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(connector.dials(), 3);
        assert!(client.is_connected());

        // The counter reset on open, so the next abnormal close waits 1s again.
        remote2.close(1006);
        settle().await;
        time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(connector.dials(), 3);
        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.dials(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_alone_does_not_disconnect() {
        let connector = ScriptedConnector::default();
        let (client, remote, _seen) = connected_client(&connector).await;

        remote.fail();
        settle().await;

        assert!(client.is_connected(), "errors alone never change state");
        assert_eq!(connector.dials(), 1);

        // The close that follows the error drives recovery.
        remote.close(1006);
        settle().await;
        assert!(!client.is_connected());
        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_is_rejected() {
        let connector = ScriptedConnector::default();
        let (client, _seen) = client_with(&connector, Config::default());

        let err = client.send("dropped").unwrap_err();

        assert_eq!(err.kind(), Kind::NotConnected);
        assert!(err.to_string().contains("not connected"));
        assert_eq!(connector.dials(), 0, "nothing was transmitted");
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_after_close_is_rejected() {
        let connector = ScriptedConnector::default();
        let (client, remote, _seen) = connected_client(&connector).await;

        client.disconnect();
        settle().await;

        let err = client.send("dropped").unwrap_err();
        assert!(err.to_string().contains("not connected"));
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn send_delivers_the_exact_payload_once() {
        let connector = ScriptedConnector::default();
        let (client, mut remote, _seen) = connected_client(&connector).await;

        client.send(r#"{"op":"join","room":7}"#).unwrap();
        settle().await;

        assert_eq!(
            remote.try_sent().as_deref(),
            Some(r#"{"op":"join","room":7}"#)
        );
        assert!(remote.try_sent().is_none(), "payload goes out exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn state_receiver_observes_transitions() {
        let connector = ScriptedConnector::default();
        let remote = connector.push_session();
        let (client, _seen) = client_with(&connector, Config::default());

        let mut state = client.state_receiver();
        assert!(!state.borrow().is_connected());

        client.connect();
        settle().await;
        assert!(state.has_changed().unwrap());
        assert!(state.borrow_and_update().is_connected());

        remote.close(1006);
        settle().await;
        assert!(!state.borrow_and_update().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn relative_target_resolves_against_origin_per_dial() {
        let connector = ScriptedConnector::default();
        let _remote = connector.push_session();

        let config = Config::builder()
            .origin("http://gateway.test:9001".parse().unwrap())
            .build();
        let client =
            Client::with_connector("/live?room=7", config, |_payload: String| {}, connector.clone())
                .unwrap();

        client.connect();
        settle().await;

        assert_eq!(
            connector.dialed_urls(),
            vec!["ws://gateway.test:9001/live?room=7"]
        );
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn relative_target_without_origin_fails_construction() {
        let connector = ScriptedConnector::default();
        let result =
            Client::with_connector("/live", Config::default(), |_payload: String| {}, connector);

        let err = result.err().expect("construction should fail");
        assert_eq!(err.kind(), Kind::Validation);
    }
}
