//! Session manager: one logical connection with correlation and auto-reconnection
//!
//! The [`Session`] handle talks to a background connection task over a command
//! channel; the task exclusively owns the socket. Correlation ids are allocated
//! on the handle so `send` returns them without waiting on the task.

use crate::config::SessionConfig;
use crate::credentials::CredentialSource;
use crate::session::state::{reconnect_delay, SessionState};
use crate::session::types::{ConnectionState, CorrelatedRequest, QueuedMessage};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Commands from the handle to the connection task
#[derive(Debug)]
enum Command {
    /// Transmit an already-serialized frame
    Transmit { req_id: u64, frame: String },
    /// Close the transport and stop the task
    Close,
}

/// How a connection run ended
enum LoopExit {
    /// Explicit close or handle dropped; do not reconnect
    Shutdown,
    /// Transport error or server close; eligible for reconnection
    Disconnected,
}

/// Outcome of a submit decision
#[derive(Debug, PartialEq, Eq)]
enum SubmitPath {
    Transmitted,
    Queued,
}

struct Shared {
    state: Mutex<SessionState>,
    next_req_id: AtomicU64,
    ready_tx: watch::Sender<bool>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl Shared {
    // Lock order: state before command_tx, everywhere
    fn state_lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state lock poisoned")
    }

    fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Handle to one logical session with the trading-data server
#[derive(Clone)]
pub struct Session {
    config: SessionConfig,
    credentials: Arc<dyn CredentialSource>,
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(config: SessionConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        let (ready_tx, _ready_rx) = watch::channel(false);
        Self {
            config,
            credentials,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::new()),
                next_req_id: AtomicU64::new(0),
                ready_tx,
                command_tx: Mutex::new(None),
            }),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state_lock().state()
    }

    /// Establish the transport. Idempotent: a no-op while a connection task is
    /// already running (open or still connecting). After reconnection attempts
    /// are exhausted, or after [`Session::close`], calling this again starts a
    /// fresh transport.
    pub fn connect(&self) -> Result<(), SessionError> {
        let url = self.config.url()?;

        let command_rx = {
            let mut st = self.shared.state_lock();
            let mut slot = self
                .shared
                .command_tx
                .lock()
                .expect("command channel lock poisoned");
            if let Some(tx) = slot.as_ref() {
                if !tx.is_closed() {
                    debug!("connect() ignored, connection task already running");
                    return Ok(());
                }
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *slot = Some(tx);
            st.set_state(ConnectionState::Connecting);
            st.reset_attempts();
            rx
        };

        let config = self.config.clone();
        let credentials = Arc::clone(&self.credentials);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            connection_task(url, config, credentials, shared, command_rx).await;
        });
        Ok(())
    }

    /// Submit a fire-and-forget request; returns its correlation id
    pub async fn send(&self, payload: Value) -> u64 {
        self.submit(payload, None, false).await
    }

    /// Submit a one-shot request; the response arrives on the returned receiver
    /// at most once
    pub async fn request(&self, payload: Value) -> (u64, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let req_id = self
            .submit(payload, Some(CorrelatedRequest::OneShot(tx)), false)
            .await;
        (req_id, rx)
    }

    /// Submit a subscription request; every response carrying its id arrives on
    /// the returned receiver until [`Session::unsubscribe`] is called or the
    /// receiver is dropped
    pub async fn subscribe(&self, payload: Value) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let req_id = self
            .submit(payload, Some(CorrelatedRequest::Subscription(tx)), true)
            .await;
        (req_id, rx)
    }

    /// Remove a registered handler; returns whether one was present
    pub fn unsubscribe(&self, req_id: u64) -> bool {
        self.shared.state_lock().remove(req_id)
    }

    /// Install (replacing any previous) the sink for inbound messages with no
    /// matching correlation id
    pub fn global_messages(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state_lock().set_global(tx);
        rx
    }

    /// Terminal close: stops keepalive, cancels any scheduled reconnect, closes
    /// the transport, and drops pending requests, queued messages, and the
    /// global sink. A later [`Session::connect`] is required to resume.
    pub async fn close(&self) {
        let tx = self
            .shared
            .command_tx
            .lock()
            .expect("command channel lock poisoned")
            .take();
        self.shared.state_lock().set_state(ConnectionState::Closing);
        if let Some(tx) = tx {
            let _ = tx.send(Command::Close);
        }
        self.shared.ready_tx.send_replace(false);
        self.shared.state_lock().clear_all();
        info!("Session closed");
    }

    /// Allocate an id, inject correlation fields, then transmit or queue.
    /// Never fails: a frame submitted while not open is queued immediately,
    /// under the same lock that checks openness, and the id is returned after
    /// a bounded readiness wait.
    async fn submit(
        &self,
        mut payload: Value,
        request: Option<CorrelatedRequest>,
        subscribe: bool,
    ) -> u64 {
        let req_id = self.shared.next_req_id();
        if let Value::Object(map) = &mut payload {
            map.insert("req_id".to_string(), json!(req_id));
            if subscribe {
                map.insert("subscribe".to_string(), json!(true));
            }
        } else {
            warn!(req_id, "Payload is not a JSON object, sending without correlation fields");
        }
        let frame = payload.to_string();

        if self.transmit_or_queue(req_id, frame, request) == SubmitPath::Queued {
            // The frame is already safely queued; this wait only suspends the
            // caller until the session opens or the window elapses
            let mut ready = self.shared.ready_tx.subscribe();
            let wait = Duration::from_millis(self.config.connect_wait_timeout_ms);
            if timeout(wait, ready.wait_for(|open| *open)).await.is_err() {
                debug!(req_id, "Session did not open within wait window, frame stays queued");
            }
        }
        req_id
    }

    /// One locked decision: transmit while open, queue otherwise. Queueing
    /// shares the state lock with the openness check, so a frame can never
    /// land in the queue after the open transition has already drained it,
    /// and concurrent submissions queue in lock-acquisition order.
    fn transmit_or_queue(
        &self,
        req_id: u64,
        frame: String,
        request: Option<CorrelatedRequest>,
    ) -> SubmitPath {
        let mut st = self.shared.state_lock();
        let (frame, request) = if st.is_open() {
            let slot = self
                .shared
                .command_tx
                .lock()
                .expect("command channel lock poisoned");
            match slot.as_ref().filter(|tx| !tx.is_closed()) {
                Some(tx) => match tx.send(Command::Transmit { req_id, frame }) {
                    Ok(()) => {
                        // Registering under the same state lock keeps the
                        // response from racing ahead of the handler
                        if let Some(req) = request {
                            st.register(req_id, req);
                        }
                        return SubmitPath::Transmitted;
                    }
                    Err(err) => {
                        let mpsc::error::SendError(cmd) = err;
                        let Command::Transmit { frame, .. } = cmd else {
                            unreachable!("transmit send returned a close command")
                        };
                        (frame, request)
                    }
                },
                None => (frame, request),
            }
        } else {
            (frame, request)
        };
        st.enqueue(QueuedMessage {
            req_id,
            frame,
            request,
        });
        SubmitPath::Queued
    }
}

/// Connection lifecycle loop: connect, run, and reconnect with bounded retries
async fn connection_task(
    url: Url,
    config: SessionConfig,
    credentials: Arc<dyn CredentialSource>,
    shared: Arc<Shared>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        if shared.state_lock().state() == ConnectionState::Closed {
            return;
        }

        info!(endpoint = %url, "Connecting to trading-data server");
        match connect_async(url.as_str()).await {
            Ok((stream, response)) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                match run_connection(stream, &config, &credentials, &shared, &mut command_rx).await
                {
                    LoopExit::Shutdown => return,
                    LoopExit::Disconnected => {}
                }
            }
            Err(e) => {
                let state = shared.state_lock().state();
                error!(error = %e, endpoint = %url, state = ?state, "WebSocket connection failed");
            }
        }
        shared.ready_tx.send_replace(false);

        // Reconnection policy: bounded attempts, linear delay capped
        let delay = {
            let mut st = shared.state_lock();
            if st.state() == ConnectionState::Closed {
                return;
            }
            st.clear_pending();
            st.set_state(ConnectionState::Connecting);
            if st.attempts() >= config.max_reconnect_attempts {
                error!(
                    attempts = st.attempts(),
                    endpoint = %url,
                    "Reconnection attempts exhausted, giving up"
                );
                st.set_state(ConnectionState::Closed);
                return;
            }
            let attempt = st.bump_attempts();
            reconnect_delay(
                config.reconnect_base_delay_ms,
                config.reconnect_max_delay_ms,
                attempt,
            )
        };
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Transmit { req_id, frame }) => {
                        // A transmit raced the disconnect; hold it for the next open
                        shared.state_lock().enqueue(QueuedMessage {
                            req_id,
                            frame,
                            request: None,
                        });
                    }
                    Some(Command::Close) | None => {
                        info!("Session closed during reconnect backoff");
                        return;
                    }
                },
            }
        }
    }
}

/// Drive one open connection: authorization, queue drain, then the main loop
async fn run_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &SessionConfig,
    credentials: &Arc<dyn CredentialSource>,
    shared: &Arc<Shared>,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> LoopExit {
    let (mut write, mut read) = stream.split();

    // Authorization handshake goes out before anything else
    match credentials.load().await {
        Ok(accounts) => {
            if let Some(first) = accounts.first() {
                let req_id = shared.next_req_id();
                let frame = json!({ "authorize": first.token, "req_id": req_id }).to_string();
                info!(account = %first.account, req_id, "Sending authorization request");
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    error!(error = %e, "Failed to send authorization request");
                    return LoopExit::Disconnected;
                }
            } else {
                debug!("No stored credentials, skipping authorization");
            }
        }
        Err(e) => warn!(error = %e, "Credential source failed, continuing unauthorized"),
    }

    // Mark open and take the queue; readiness flips only after the drain so no
    // new submission can overtake a queued frame
    let mut drained: VecDeque<(u64, String)> = VecDeque::new();
    {
        let mut st = shared.state_lock();
        if matches!(
            st.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return LoopExit::Shutdown;
        }
        st.set_state(ConnectionState::Open);
        st.reset_attempts();
        for queued in st.take_queue() {
            if let Some(request) = queued.request {
                st.register(queued.req_id, request);
            }
            drained.push_back((queued.req_id, queued.frame));
        }
    }

    let drained_count = drained.len();
    while let Some((req_id, frame)) = drained.pop_front() {
        debug!(req_id, "Draining queued frame");
        if let Err(e) = write.send(Message::Text(frame.clone().into())).await {
            error!(error = %e, req_id, "Failed to drain queued frame");
            let mut rest = vec![QueuedMessage {
                req_id,
                frame,
                request: None,
            }];
            rest.extend(drained.drain(..).map(|(req_id, frame)| QueuedMessage {
                req_id,
                frame,
                request: None,
            }));
            shared.state_lock().requeue_front(rest);
            return LoopExit::Disconnected;
        }
    }
    if drained_count > 0 {
        info!(count = drained_count, "Drained queued messages");
    }

    shared.ready_tx.send_replace(true);
    info!("Session open");

    let mut keepalive = interval(Duration::from_millis(config.keepalive_interval_ms));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => shared.state_lock().dispatch(value),
                        Err(e) => warn!(error = %e, "Dropping unparseable frame"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        return LoopExit::Disconnected;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Server closed connection");
                    return LoopExit::Disconnected;
                }
                Some(Ok(_)) => {} // binary and pong frames are not part of the protocol
                Some(Err(e)) => {
                    let state = shared.state_lock().state();
                    error!(error = %e, state = ?state, "WebSocket transport error");
                    return LoopExit::Disconnected;
                }
                None => {
                    warn!("WebSocket stream ended");
                    return LoopExit::Disconnected;
                }
            },
            cmd = command_rx.recv() => match cmd {
                Some(Command::Transmit { req_id, frame }) => {
                    debug!(req_id, "Transmitting frame");
                    if let Err(e) = write.send(Message::Text(frame.clone().into())).await {
                        error!(error = %e, req_id, "Failed to transmit frame, requeueing");
                        shared.state_lock().enqueue(QueuedMessage {
                            req_id,
                            frame,
                            request: None,
                        });
                        return LoopExit::Disconnected;
                    }
                }
                Some(Command::Close) | None => {
                    info!("Closing transport");
                    let _ = write.send(Message::Close(None)).await;
                    return LoopExit::Shutdown;
                }
            },
            _ = keepalive.tick() => {
                let req_id = shared.next_req_id();
                let frame = json!({ "ping": 1, "req_id": req_id }).to_string();
                debug!(req_id, "Sending keepalive");
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    error!(error = %e, "Failed to send keepalive");
                    return LoopExit::Disconnected;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentials;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct MockServer {
        addr: SocketAddr,
        /// Frames received, in order, across all connections
        received: mpsc::UnboundedReceiver<Value>,
        /// Frames to push to the currently connected client
        push: mpsc::UnboundedSender<Value>,
        /// Drops the current connection without a close handshake
        kick: mpsc::UnboundedSender<()>,
    }

    /// One-connection-at-a-time WebSocket server. With `echo` set it answers
    /// every inbound frame carrying a req_id with `{"req_id": id, "echo": true}`.
    async fn spawn_server(echo: bool) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<Value>();
        let (kick, mut kick_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                let (mut write, mut read) = ws.split();
                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let value: Value = serde_json::from_str(&text).unwrap();
                                if echo {
                                    if let Some(id) = value.get("req_id").and_then(Value::as_u64) {
                                        let reply = json!({ "req_id": id, "echo": true });
                                        let _ = write
                                            .send(Message::Text(reply.to_string().into()))
                                            .await;
                                    }
                                }
                                let _ = received_tx.send(value);
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        frame = push_rx.recv() => match frame {
                            Some(v) => {
                                let _ = write.send(Message::Text(v.to_string().into())).await;
                            }
                            None => break,
                        },
                        _ = kick_rx.recv() => break,
                    }
                }
            }
        });

        MockServer {
            addr,
            received,
            push,
            kick,
        }
    }

    fn test_session(addr: SocketAddr, connect_wait_ms: u64) -> Session {
        let config = SessionConfig {
            endpoint: format!("ws://{}/ws", addr),
            app_id: "test".to_string(),
            connect_wait_timeout_ms: connect_wait_ms,
            ..Default::default()
        };
        Session::new(config, Arc::new(MemoryCredentials::single("ACC-1", "tok-1")))
    }

    async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for server frame")
            .expect("server channel closed")
    }

    async fn wait_open(session: &Session) {
        let mut ready = session.shared.ready_tx.subscribe();
        timeout(Duration::from_secs(5), ready.wait_for(|open| *open))
            .await
            .expect("timed out waiting for open")
            .expect("readiness channel closed");
    }

    #[tokio::test]
    async fn test_sends_while_disconnected_queue_then_drain_fifo() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 50);

        let id1 = session.send(json!({"op": "first"})).await;
        let id2 = session.send(json!({"op": "second"})).await;
        assert_eq!((id1, id2), (1, 2));
        assert_eq!(session.shared.state_lock().queued_ids(), vec![1, 2]);

        session.connect().unwrap();

        let auth = recv_frame(&mut server.received).await;
        assert_eq!(auth["authorize"], json!("tok-1"));

        let first = recv_frame(&mut server.received).await;
        assert_eq!(first["op"], json!("first"));
        assert_eq!(first["req_id"], json!(id1));
        let second = recv_frame(&mut server.received).await;
        assert_eq!(second["op"], json!("second"));
        assert_eq!(second["req_id"], json!(id2));
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let mut server = spawn_server(true).await;
        let session = test_session(server.addr, 2_000);
        session.connect().unwrap();

        let (req_id, rx) = session.request(json!({"op": "quote"})).await;
        let response = timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out")
            .expect("response channel dropped");
        assert_eq!(response["req_id"], json!(req_id));
        assert_eq!(response["echo"], json!(true));
        assert_eq!(session.shared.state_lock().pending_len(), 0);

        // Same logical request again gets a fresh id
        let (second_id, _rx) = session.request(json!({"op": "quote"})).await;
        assert!(second_id > req_id);
        let _ = recv_frame(&mut server.received).await;
    }

    #[tokio::test]
    async fn test_one_shot_duplicate_response_goes_to_global() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 2_000);
        let mut global = session.global_messages();
        session.connect().unwrap();

        let (req_id, rx) = session.request(json!({"op": "order"})).await;
        // Wait until the server holds the frame before replying
        let _auth = recv_frame(&mut server.received).await;
        let _frame = recv_frame(&mut server.received).await;

        server.push.send(json!({"req_id": req_id, "n": 1})).unwrap();
        server.push.send(json!({"req_id": req_id, "n": 2})).unwrap();

        let first = timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out")
            .expect("response channel dropped");
        assert_eq!(first["n"], json!(1));

        // The duplicate no longer matches a pending request
        let stray = recv_frame(&mut global).await;
        assert_eq!(stray["n"], json!(2));
    }

    #[tokio::test]
    async fn test_subscription_receives_stream_of_responses() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 2_000);
        session.connect().unwrap();

        let (req_id, mut rx) = session.subscribe(json!({"symbol": "ES"})).await;
        let _auth = recv_frame(&mut server.received).await;
        let sub = recv_frame(&mut server.received).await;
        assert_eq!(sub["subscribe"], json!(true));
        assert_eq!(sub["req_id"], json!(req_id));

        for seq in 0..3 {
            server
                .push
                .send(json!({"req_id": req_id, "seq": seq}))
                .unwrap();
        }
        for seq in 0..3 {
            let update = recv_frame(&mut rx).await;
            assert_eq!(update["seq"], json!(seq));
        }

        assert!(session.unsubscribe(req_id));
        assert!(!session.unsubscribe(req_id));
    }

    #[tokio::test]
    async fn test_unmatched_frame_without_global_is_ignored() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 2_000);
        session.connect().unwrap();
        wait_open(&session).await;

        server.push.send(json!({"notice": "maintenance"})).unwrap();

        // The session keeps working after the drop
        let (req_id, rx) = session.request(json!({"op": "status"})).await;
        let _auth = recv_frame(&mut server.received).await;
        let _frame = recv_frame(&mut server.received).await;
        server.push.send(json!({"req_id": req_id, "ok": true})).unwrap();
        let response = timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out")
            .expect("response channel dropped");
        assert_eq!(response["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_close_then_send_queues_until_reconnect() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 50);
        session.connect().unwrap();
        wait_open(&session).await;
        let _auth = recv_frame(&mut server.received).await;

        session.close().await;
        assert_eq!(session.state(), ConnectionState::Closed);

        let req_id = session.send(json!({"op": "late"})).await;
        assert_eq!(session.shared.state_lock().queued_ids(), vec![req_id]);

        session.connect().unwrap();
        let auth = recv_frame(&mut server.received).await;
        assert_eq!(auth["authorize"], json!("tok-1"));
        let late = recv_frame(&mut server.received).await;
        assert_eq!(late["op"], json!("late"));
        assert_eq!(late["req_id"], json!(req_id));
    }

    #[tokio::test]
    async fn test_keepalive_is_sent_while_open() {
        let mut server = spawn_server(false).await;
        let config = SessionConfig {
            endpoint: format!("ws://{}/ws", server.addr),
            keepalive_interval_ms: 100,
            ..Default::default()
        };
        let session = Session::new(config, Arc::new(MemoryCredentials::default()));
        session.connect().unwrap();

        // No credentials stored, so the first frame is already the keepalive
        let ping = recv_frame(&mut server.received).await;
        assert_eq!(ping["ping"], json!(1));
        assert!(ping.get("req_id").is_some());
    }

    #[tokio::test]
    async fn test_send_after_open_never_queues() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 2_000);
        session.connect().unwrap();
        wait_open(&session).await;
        let _auth = recv_frame(&mut server.received).await;

        let req_id = session.send(json!({"op": "direct"})).await;
        let frame = recv_frame(&mut server.received).await;
        assert_eq!(frame["req_id"], json!(req_id));
        // Transmitted on the spot, never parked in the queue
        assert_eq!(session.shared.state_lock().queue_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_while_disconnected_all_delivered() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 50);

        let mut handles = Vec::new();
        for n in 0..3 {
            let session = session.clone();
            handles.push(tokio::spawn(
                async move { session.send(json!({ "n": n })).await },
            ));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert_eq!(session.shared.state_lock().queue_len(), 3);

        session.connect().unwrap();
        let _auth = recv_frame(&mut server.received).await;

        // Every queued frame is delivered exactly once
        let mut seen: Vec<u64> = Vec::new();
        for _ in 0..3 {
            let frame = recv_frame(&mut server.received).await;
            seen.push(frame["req_id"].as_u64().unwrap());
        }
        ids.sort_unstable();
        seen.sort_unstable();
        assert_eq!(seen, ids);
        assert_eq!(session.shared.state_lock().queue_len(), 0);
    }

    #[tokio::test]
    async fn test_transport_drop_clears_pending_and_reconnects() {
        let mut server = spawn_server(false).await;
        let config = SessionConfig {
            endpoint: format!("ws://{}/ws", server.addr),
            app_id: "test".to_string(),
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 100,
            connect_wait_timeout_ms: 2_000,
            ..Default::default()
        };
        let session = Session::new(config, Arc::new(MemoryCredentials::single("ACC-1", "tok-1")));
        session.connect().unwrap();
        wait_open(&session).await;
        let _auth = recv_frame(&mut server.received).await;

        let (_req_id, rx) = session.request(json!({"op": "orders"})).await;
        let _frame = recv_frame(&mut server.received).await;
        assert_eq!(session.shared.state_lock().pending_len(), 1);

        server.kick.send(()).unwrap();

        // The dropped transport clears the pending request; no late delivery
        let late = timeout(Duration::from_secs(5), rx).await.expect("timed out");
        assert!(late.is_err());

        // First reconnect attempt re-opens and re-authorizes
        let auth = recv_frame(&mut server.received).await;
        assert_eq!(auth["authorize"], json!("tok-1"));
        wait_open(&session).await;
        assert_eq!(session.shared.state_lock().pending_len(), 0);
        assert_eq!(session.shared.state_lock().attempts(), 0);

        let req_id = session.send(json!({"op": "after-reconnect"})).await;
        let frame = recv_frame(&mut server.received).await;
        assert_eq!(frame["req_id"], json!(req_id));
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        // Grab a port with no listener behind it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = SessionConfig {
            endpoint: format!("ws://{}/ws", addr),
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 20,
            max_reconnect_attempts: 2,
            ..Default::default()
        };
        let session = Session::new(config, Arc::new(MemoryCredentials::default()));
        session.connect().unwrap();

        timeout(Duration::from_secs(5), async {
            while session.state() != ConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never reached Closed after exhausting reconnects");
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_endpoint() {
        let config = SessionConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        };
        let session = Session::new(config, Arc::new(MemoryCredentials::default()));
        assert!(matches!(session.connect(), Err(SessionError::UrlParse(_))));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_open() {
        let mut server = spawn_server(false).await;
        let session = test_session(server.addr, 2_000);
        session.connect().unwrap();
        wait_open(&session).await;
        let _auth = recv_frame(&mut server.received).await;

        // A second connect must not open a new transport or re-authorize
        session.connect().unwrap();
        assert_eq!(session.state(), ConnectionState::Open);

        let req_id = session.send(json!({"op": "still-alive"})).await;
        let frame = recv_frame(&mut server.received).await;
        assert_eq!(frame["req_id"], json!(req_id));
    }
}
