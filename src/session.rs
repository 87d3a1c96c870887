//! One authenticated connection and the three tasks that drive it
//!
//! A session is opened (dial, greeting, login) and then run: a reader task
//! routes replies to the correlator, a writer task drains the shared action
//! queue onto the socket, and a heartbeat task pings the server. The first
//! task to fail ends the session; the other two are cancelled and joined
//! before [`run`] returns.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::AmiConfig,
    constants::{HEARTBEAT_ACTION_ID, SOCKET_BUF_SIZE},
    correlator::Correlator,
    error::{AmiError, AmiResult},
    protocol::AmiParser,
    record::Record,
    transport::Transport,
};

/// Lifecycle of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SessionState {
    /// Dialing and waiting for the greeting.
    Opening,
    /// Login sent, waiting for its reply.
    Authenticating,
    /// Reader, writer and heartbeat are running; actions flow.
    Running,
    /// No session. Either between reconnect attempts or shut down.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Opening => "opening",
            SessionState::Authenticating => "authenticating",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a running session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Too many consecutive heartbeat pings went unanswered.
    HeartbeatExpired,
    /// Socket read or write failed (io::Error is not Clone, so we store the message).
    IoError(String),
    /// Clean EOF from the server.
    ConnectionClosed,
    /// The byte stream could not be parsed.
    ProtocolError(String),
    /// The owner shut the client down.
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::HeartbeatExpired => write!(f, "heartbeat expired"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::Shutdown => write!(f, "shut down"),
        }
    }
}

/// State that outlives individual sessions.
///
/// The action queue is not part of it: each session brings its own and
/// publishes the sending half here while it runs.
pub(crate) struct SessionShared {
    pub(crate) correlator: Correlator,
    state_tx: watch::Sender<SessionState>,
    queue_size: usize,
    /// Sender into the running session's queue.
    action_tx: Mutex<Option<mpsc::Sender<Record>>>,
    last_disconnect: watch::Sender<Option<DisconnectReason>>,
}

impl SessionShared {
    pub(crate) fn new(queue_size: usize) -> Self {
        Self {
            correlator: Correlator::new(),
            state_tx: watch::channel(SessionState::Closed).0,
            queue_size: queue_size.max(1),
            action_tx: Mutex::new(None),
            last_disconnect: watch::channel(None).0,
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Record>>> {
        self.action_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self
            .state_tx
            .send_replace(state);
        if previous != state {
            trace!("Session state {} -> {}", previous, state);
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self
            .state_tx
            .borrow()
    }

    pub(crate) fn online(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx
            .subscribe()
    }

    pub(crate) fn record_disconnect(&self, reason: DisconnectReason) {
        self.last_disconnect
            .send_replace(Some(reason));
    }

    pub(crate) fn last_disconnect(&self) -> Option<DisconnectReason> {
        self.last_disconnect
            .borrow()
            .clone()
    }

    /// Queue an action for the running session's writer. Waits while the
    /// queue is full.
    ///
    /// `NotConnected` if no session is published, or if it ends before the
    /// action is accepted.
    pub(crate) async fn enqueue(&self, action: Record) -> AmiResult<()> {
        let action_tx = self
            .queue()
            .clone()
            .ok_or(AmiError::NotConnected)?;
        action_tx
            .send(action)
            .await
            .map_err(|_| AmiError::NotConnected)
    }
}

/// An authenticated stream, not yet running.
pub(crate) struct Session<S> {
    stream: S,
    /// Holds whatever arrived after the login reply.
    parser: AmiParser,
    action_tx: mpsc::Sender<Record>,
    action_rx: mpsc::Receiver<Record>,
}

impl<S> Session<S> {
    /// Open this session's queue to callers and mark it online.
    pub(crate) fn publish(&self, shared: &SessionShared) {
        *shared.queue() = Some(
            self.action_tx
                .clone(),
        );
        shared.set_state(SessionState::Running);
    }
}

/// Read records until one is complete.
///
/// Returns `ConnectionClosed` on EOF.
async fn recv_record<S>(
    stream: &mut S,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
) -> AmiResult<Record>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(record) = parser.parse_record()? {
            trace!("[RECV] Parsed record from buffer");
            return Ok(record);
        }

        let bytes_read = stream
            .read(read_buffer)
            .await?;
        trace!("[RECV] Read {} bytes from socket", bytes_read);
        if bytes_read == 0 {
            return Err(AmiError::ConnectionClosed);
        }
        parser.add_data(&read_buffer[..bytes_read])?;
    }
}

/// Consume the banner with a single read of at most `greeting_len` bytes.
async fn read_greeting<S>(stream: &mut S, config: &AmiConfig) -> AmiResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut greeting = vec![0u8; config.greeting_len.max(1)];
    let bytes_read = match timeout(config.dial_timeout, stream.read(&mut greeting)).await {
        Ok(read) => read?,
        Err(_) => {
            warn!("[CONNECT] No greeting within {:?}", config.dial_timeout);
            return Err(AmiError::Timeout {
                timeout_ms: config.dial_timeout.as_millis() as u64,
            });
        }
    };
    if bytes_read == 0 {
        return Err(AmiError::ConnectionClosed);
    }

    debug!(
        "[CONNECT] Greeting: {}",
        String::from_utf8_lossy(&greeting[..bytes_read]).trim_end()
    );
    Ok(())
}

async fn login<S>(
    stream: &mut S,
    config: &AmiConfig,
    parser: &mut AmiParser,
) -> AmiResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let action = Record::login(&config.username, &config.password);
    debug!("[AUTH] Sending Login for user {}", config.username);
    stream
        .write_all(
            action
                .to_wire_format()
                .as_bytes(),
        )
        .await?;
    stream
        .flush()
        .await?;

    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];
    let reply = match timeout(
        config.dial_timeout,
        recv_record(stream, parser, &mut read_buffer),
    )
    .await
    {
        Ok(reply) => reply?,
        Err(_) => {
            warn!("[AUTH] No login reply within {:?}", config.dial_timeout);
            return Err(AmiError::Timeout {
                timeout_ms: config.dial_timeout.as_millis() as u64,
            });
        }
    };

    if !reply.is_auth_accepted() {
        return Err(AmiError::auth_failed(
            reply
                .message()
                .unwrap_or("Authentication failed"),
        ));
    }

    debug!("[AUTH] Authentication accepted");
    Ok(())
}

/// Dial, read the greeting and log in.
pub(crate) async fn open<T: Transport>(
    transport: &T,
    config: &AmiConfig,
    shared: &SessionShared,
) -> AmiResult<Session<T::Stream>> {
    shared.set_state(SessionState::Opening);
    let mut stream = transport
        .dial(&config.address, config.dial_timeout)
        .await?;

    read_greeting(&mut stream, config).await?;

    shared.set_state(SessionState::Authenticating);
    let mut parser = AmiParser::new();
    login(&mut stream, config, &mut parser).await?;

    let (action_tx, action_rx) = mpsc::channel(shared.queue_size);
    Ok(Session {
        stream,
        parser,
        action_tx,
        action_rx,
    })
}

/// Heartbeat timing, copied out of the config.
#[derive(Debug, Clone, Copy)]
struct HeartbeatSettings {
    interval: Duration,
    ping_timeout: Duration,
    failures: u32,
}

impl From<&AmiConfig> for HeartbeatSettings {
    fn from(config: &AmiConfig) -> Self {
        Self {
            interval: config.keepalive_interval,
            ping_timeout: config.ping_timeout,
            failures: config.ping_failures,
        }
    }
}

/// Run a task, turning a panic into a failure report.
///
/// Each task reports at most once, so the send never waits.
async fn guarded<F>(name: &'static str, task: F, fail_tx: mpsc::Sender<DisconnectReason>)
where
    F: Future<Output = Option<DisconnectReason>>,
{
    let outcome = match AssertUnwindSafe(task)
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("{} task panicked", name);
            Some(DisconnectReason::IoError(format!("{} task panicked", name)))
        }
    };
    if let Some(reason) = outcome {
        debug!("{} task failed: {}", name, reason);
        let _ = fail_tx.try_send(reason);
    }
}

/// Drive an opened session until it fails or `token` is cancelled.
///
/// Returns once all three tasks have stopped. The state is `Closed` by then,
/// and actions still queued are dropped with the session.
pub(crate) async fn run<S>(
    session: Session<S>,
    shared: Arc<SessionShared>,
    config: &AmiConfig,
    token: CancellationToken,
) -> DisconnectReason
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    session.publish(&shared);
    let Session {
        stream,
        parser,
        action_rx,
        ..
    } = session;
    let (reader, writer) = tokio::io::split(stream);
    let (fail_tx, mut fail_rx) = mpsc::channel(3);
    let (ack_tx, ack_rx) = mpsc::channel(1);

    info!("[CONNECT] Session running with {}", config.address);

    let reader_task = tokio::spawn(guarded(
        "reader",
        reader_loop(reader, parser, shared.clone(), ack_tx, token.clone()),
        fail_tx.clone(),
    ));
    let writer_task = tokio::spawn(guarded(
        "writer",
        writer_loop(writer, action_rx, shared.clone(), token.clone()),
        fail_tx.clone(),
    ));
    let heartbeat_task = tokio::spawn(guarded(
        "heartbeat",
        heartbeat_loop(
            shared.clone(),
            ack_rx,
            HeartbeatSettings::from(config),
            token.clone(),
        ),
        fail_tx,
    ));

    let reason = tokio::select! {
        _ = token.cancelled() => DisconnectReason::Shutdown,
        reason = fail_rx.recv() => reason.unwrap_or(DisconnectReason::ConnectionClosed),
    };

    shared
        .queue()
        .take();
    shared.set_state(SessionState::Closed);
    token.cancel();
    let _ = tokio::join!(reader_task, writer_task, heartbeat_task);

    info!("[CONNECT] Session with {} ended: {}", config.address, reason);
    reason
}

/// Route one inbound record.
fn dispatch(record: Record, shared: &SessionShared, ack_tx: &mpsc::Sender<()>) {
    match record
        .action_id()
        .map(str::to_owned)
    {
        Some(action_id) if action_id == HEARTBEAT_ACTION_ID => {
            trace!(response = ?record, "[RECV] Heartbeat reply");
            let _ = ack_tx.try_send(());
        }
        Some(action_id) => {
            if shared
                .correlator
                .resolve(&action_id, record)
            {
                debug!(action_id, "[RECV] Reply delivered");
            }
        }
        None => {
            trace!(data = ?record, "[RECV] Unsolicited record");
        }
    }
}

async fn reader_loop<R>(
    mut reader: R,
    mut parser: AmiParser,
    shared: Arc<SessionShared>,
    ack_tx: mpsc::Sender<()>,
    token: CancellationToken,
) -> Option<DisconnectReason>
where
    R: AsyncRead + Unpin,
{
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

    loop {
        loop {
            match parser.parse_record() {
                Ok(Some(record)) => dispatch(record, &shared, &ack_tx),
                Ok(None) => break,
                Err(e) => {
                    warn!("[RECV] Parser error: {}", e);
                    return Some(DisconnectReason::ProtocolError(e.to_string()));
                }
            }
        }

        let read = tokio::select! {
            _ = token.cancelled() => return None,
            read = reader.read(&mut read_buffer) => read,
        };

        match read {
            Ok(0) => {
                if let Some(partial) = parser.finish() {
                    debug!(data = ?partial, "[RECV] Discarding unterminated record");
                }
                info!("[RECV] Connection closed (EOF)");
                return Some(DisconnectReason::ConnectionClosed);
            }
            Ok(n) => {
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("[RECV] Buffer error: {}", e);
                    return Some(DisconnectReason::ProtocolError(e.to_string()));
                }
            }
            Err(e) => {
                warn!("[RECV] Read error: {}", e);
                return Some(DisconnectReason::IoError(e.to_string()));
            }
        }
    }
}

async fn writer_loop<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Record>,
    shared: Arc<SessionShared>,
    token: CancellationToken,
) -> Option<DisconnectReason>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let action = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = writer.shutdown().await;
                return None;
            }
            action = queue.recv() => action,
        };
        let Some(action) = action else {
            return Some(DisconnectReason::ConnectionClosed);
        };
        if let Some(action_id) = action.action_id() {
            if action_id != HEARTBEAT_ACTION_ID
                && !shared
                    .correlator
                    .contains(action_id)
            {
                debug!(action_id, "Skipping action nobody is waiting for");
                continue;
            }
        }

        trace!(request = ?action, "Writing action");
        let written = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            written = write_action(&mut writer, &action) => written,
        };
        if let Err(e) = written {
            warn!("Write error: {}", e);
            return Some(DisconnectReason::IoError(e.to_string()));
        }
    }
}

async fn write_action<W>(writer: &mut W, action: &Record) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(
            action
                .to_wire_format()
                .as_bytes(),
        )
        .await?;
    writer
        .flush()
        .await
}

async fn heartbeat_loop(
    shared: Arc<SessionShared>,
    mut ack_rx: mpsc::Receiver<()>,
    settings: HeartbeatSettings,
    token: CancellationToken,
) -> Option<DisconnectReason> {
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let threshold = settings
        .failures
        .max(1);
    let mut misses = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = ticker.tick() => {}
        }
        if !shared.online() {
            return None;
        }

        // a late reply to an earlier ping must not count for this one
        while ack_rx
            .try_recv()
            .is_ok()
        {}

        // a writer stuck on a peer that stopped reading backs the queue up
        let enqueued = tokio::select! {
            _ = token.cancelled() => return None,
            enqueued = timeout(settings.ping_timeout, shared.enqueue(Record::heartbeat())) => enqueued,
        };

        let answered = match enqueued {
            Ok(Ok(())) => tokio::select! {
                _ = token.cancelled() => return None,
                ack = ack_rx.recv() => match ack {
                    Some(()) => true,
                    None => return None,
                },
                _ = sleep(settings.ping_timeout) => false,
            },
            Ok(Err(_)) => return None,
            Err(_) => {
                warn!("Heartbeat ping could not be queued within {:?}", settings.ping_timeout);
                false
            }
        };

        if answered {
            misses = 0;
            continue;
        }

        misses += 1;
        warn!(attempt = misses, "Heartbeat ping unanswered");
        if misses >= threshold {
            warn!("Heartbeat expired after {} missed pings", misses);
            return Some(DisconnectReason::HeartbeatExpired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{accept_all, success_reply, MockPeer, PeerReply};
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    fn test_config() -> AmiConfig {
        let mut config = AmiConfig::new("in-memory", "admin", "secret");
        config.dial_timeout = Duration::from_secs(1);
        config.keepalive_interval = Duration::from_secs(5);
        config.ping_timeout = Duration::from_secs(2);
        config.ping_failures = 3;
        config
    }

    /// Hands out one pre-made stream.
    struct OneShot(std::sync::Mutex<Option<DuplexStream>>);

    #[async_trait]
    impl Transport for OneShot {
        type Stream = DuplexStream;

        async fn dial(&self, _address: &str, _timeout: Duration) -> AmiResult<DuplexStream> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or(AmiError::ConnectionClosed)
        }
    }

    fn one_shot() -> (OneShot, DuplexStream) {
        one_shot_with_capacity(64 * 1024)
    }

    fn one_shot_with_capacity(capacity: usize) -> (OneShot, DuplexStream) {
        let (client, server) = tokio::io::duplex(capacity);
        (OneShot(std::sync::Mutex::new(Some(client))), server)
    }

    /// Send a greeting, accept the login, and hand back the server end.
    async fn accept_login(mut server: DuplexStream) -> DuplexStream {
        server
            .write_all(b"Asterisk Call Manager/5.0.1\r\n")
            .await
            .unwrap();
        let mut parser = AmiParser::new();
        let mut buf = [0u8; 1024];
        let login = recv_record(&mut server, &mut parser, &mut buf)
            .await
            .unwrap();
        let reply = Record::new()
            .with("ActionID", login.action_id().unwrap())
            .with("Response", "Success")
            .with("Message", "Authentication accepted");
        server
            .write_all(
                reply
                    .to_wire_format()
                    .as_bytes(),
            )
            .await
            .unwrap();
        server
    }

    fn mute_pings(action: &Record) -> PeerReply {
        if action.action_id() == Some(HEARTBEAT_ACTION_ID) {
            PeerReply::Silent
        } else {
            success_reply(action)
        }
    }

    #[tokio::test]
    async fn open_logs_in() {
        let peer = MockPeer::in_memory(accept_all());
        let shared = SessionShared::new(16);

        let session = open(&peer.transport(), &test_config(), &shared)
            .await
            .unwrap();
        assert!(!session
            .parser
            .has_partial());
        assert_eq!(shared.state(), SessionState::Authenticating);

        let logins = peer.received_actions("Login");
        assert_eq!(logins.len(), 1);
        assert_eq!(logins[0].get("Username"), Some("admin"));
        assert_eq!(logins[0].get("Secret"), Some("secret"));
        assert!(logins[0]
            .action_id()
            .is_some());
    }

    #[tokio::test]
    async fn open_rejected_login() {
        let peer = MockPeer::in_memory(Arc::new(|action: &Record| {
            PeerReply::Reply(
                Record::new()
                    .with("ActionID", action.action_id().unwrap_or(""))
                    .with("Response", "Error")
                    .with("Message", "Authentication failed"),
            )
        }));
        let shared = SessionShared::new(16);

        let err = open(&peer.transport(), &test_config(), &shared)
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, AmiError::AuthFailed { ref reason } if reason == "Authentication failed"),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn open_accepts_message_without_success() {
        let peer = MockPeer::in_memory(Arc::new(|_: &Record| {
            PeerReply::Reply(
                Record::new()
                    .with("Response", "Goodbye")
                    .with("Message", "Authentication accepted"),
            )
        }));
        let shared = SessionShared::new(16);
        assert!(open(&peer.transport(), &test_config(), &shared)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn open_times_out_without_greeting() {
        let (transport, _server) = one_shot();
        let shared = SessionShared::new(16);

        let err = open(&transport, &test_config(), &shared)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AmiError::Timeout { timeout_ms: 1000 }), "got {:?}", err);
    }

    #[tokio::test]
    async fn open_fails_on_immediate_hangup() {
        let (transport, server) = one_shot();
        drop(server);
        let shared = SessionShared::new(16);

        let err = open(&transport, &test_config(), &shared)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AmiError::ConnectionClosed), "got {:?}", err);
    }

    #[tokio::test]
    async fn short_greeting_accepted() {
        let (transport, server) = one_shot();
        let shared = SessionShared::new(16);
        let script = tokio::spawn(accept_login(server));

        open(&transport, &test_config(), &shared)
            .await
            .unwrap();
        drop(script.await);
    }

    #[tokio::test]
    async fn enqueue_needs_a_published_session() {
        let peer = MockPeer::in_memory(accept_all());
        let shared = SessionShared::new(16);

        assert!(matches!(
            shared
                .enqueue(Record::action("Ping"))
                .await,
            Err(AmiError::NotConnected)
        ));

        let session = open(&peer.transport(), &test_config(), &shared)
            .await
            .unwrap();
        assert!(matches!(
            shared
                .enqueue(Record::action("Ping"))
                .await,
            Err(AmiError::NotConnected)
        ));

        session.publish(&shared);
        assert!(shared.online());
        assert!(shared
            .enqueue(Record::action("Ping"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn run_routes_replies_and_ignores_events() {
        let peer = MockPeer::in_memory(Arc::new(|action: &Record| {
            if action.action_name() == Some("CoreStatus") {
                PeerReply::Delayed(
                    Duration::from_millis(5),
                    Record::new()
                        .with("ActionID", action.action_id().unwrap_or(""))
                        .with("Response", "Success")
                        .with("CoreCurrentCalls", "0"),
                )
            } else {
                success_reply(action)
            }
        }));
        let config = test_config();
        let shared = Arc::new(SessionShared::new(16));
        let session = open(&peer.transport(), &config, &shared)
            .await
            .unwrap();
        session.publish(&shared);

        let token = CancellationToken::new();
        let runner = {
            let shared = shared.clone();
            let config = config.clone();
            let token = token.clone();
            tokio::spawn(async move { run(session, shared, &config, token).await })
        };

        let rx = shared
            .correlator
            .register("status-1")
            .unwrap();
        shared
            .enqueue(Record::action("CoreStatus").with("ActionID", "status-1"))
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.get("CoreCurrentCalls"), Some("0"));
        assert!(shared.online());

        token.cancel();
        assert_eq!(runner.await.unwrap(), DisconnectReason::Shutdown);
        assert_eq!(shared.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn dispatch_routes_by_action_id() {
        let shared = SessionShared::new(16);
        let (ack_tx, mut ack_rx) = mpsc::channel(1);
        let rx = shared
            .correlator
            .register("r-1")
            .unwrap();

        dispatch(
            Record::new()
                .with("Event", "PeerStatus")
                .with("Peer", "SIP/100"),
            &shared,
            &ack_tx,
        );
        dispatch(Record::new().with("ActionID", HEARTBEAT_ACTION_ID), &shared, &ack_tx);
        assert!(shared
            .correlator
            .contains("r-1"));
        assert!(ack_rx
            .try_recv()
            .is_ok());

        dispatch(
            Record::new()
                .with("ActionID", "r-1")
                .with("Response", "Success"),
            &shared,
            &ack_tx,
        );
        assert_eq!(
            rx.await
                .unwrap()
                .response(),
            Some("Success")
        );

        // a second heartbeat reply with the ack slot full is dropped, not queued
        dispatch(Record::new().with("ActionID", HEARTBEAT_ACTION_ID), &shared, &ack_tx);
        dispatch(Record::new().with("ActionID", HEARTBEAT_ACTION_ID), &shared, &ack_tx);
        assert!(ack_rx
            .try_recv()
            .is_ok());
        assert!(ack_rx
            .try_recv()
            .is_err());
    }

    #[tokio::test]
    async fn run_ends_on_peer_hangup() {
        let peer = MockPeer::in_memory(accept_all());
        let config = test_config();
        let shared = Arc::new(SessionShared::new(16));
        let session = open(&peer.transport(), &config, &shared)
            .await
            .unwrap();

        let runner = {
            let shared = shared.clone();
            let config = config.clone();
            tokio::spawn(async move { run(session, shared, &config, CancellationToken::new()).await })
        };

        peer.drop_connections();
        let reason = timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::ConnectionClosed);
        assert!(!shared.online());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_heartbeats_keep_session_alive() {
        let peer = MockPeer::in_memory(accept_all());
        let config = test_config();
        let shared = Arc::new(SessionShared::new(16));
        let session = open(&peer.transport(), &config, &shared)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let runner = {
            let shared = shared.clone();
            let config = config.clone();
            let token = token.clone();
            tokio::spawn(async move { run(session, shared, &config, token).await })
        };

        sleep(Duration::from_secs(60)).await;
        assert!(shared.online());
        assert!(peer.received_actions("Ping").len() >= 10);
        assert!(peer
            .received_actions("Ping")
            .iter()
            .all(|ping| ping.action_id() == Some(HEARTBEAT_ACTION_ID)));

        token.cancel();
        assert_eq!(runner.await.unwrap(), DisconnectReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_heartbeats_end_session() {
        let peer = MockPeer::in_memory(Arc::new(mute_pings));
        let config = test_config();
        let shared = Arc::new(SessionShared::new(16));
        let session = open(&peer.transport(), &config, &shared)
            .await
            .unwrap();

        let started = Instant::now();
        let reason = run(session, shared.clone(), &config, CancellationToken::new()).await;

        assert_eq!(reason, DisconnectReason::HeartbeatExpired);
        assert_eq!(peer.received_actions("Ping").len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(3 * 5));
        assert_eq!(shared.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn one_answer_resets_the_miss_count() {
        let peer = MockPeer::in_memory(Arc::new(mute_pings));
        let mut config = test_config();
        config.ping_failures = 2;
        let shared = Arc::new(SessionShared::new(16));
        let session = open(&peer.transport(), &config, &shared)
            .await
            .unwrap();

        let runner = {
            let shared = shared.clone();
            let config = config.clone();
            tokio::spawn(async move { run(session, shared, &config, CancellationToken::new()).await })
        };

        // first ping at 5s goes unanswered; answer the second at 10s
        sleep(Duration::from_secs(8)).await;
        peer.set_handler(accept_all());
        sleep(Duration::from_secs(4)).await;
        peer.set_handler(Arc::new(mute_pings));
        sleep(Duration::from_secs(6)).await;
        assert!(shared.online(), "a single miss after an answer must not expire");

        let reason = runner.await.unwrap();
        assert_eq!(reason, DisconnectReason::HeartbeatExpired);
        assert_eq!(peer.received_actions("Ping").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_stops_reading_expires_heartbeat() {
        let (transport, server) = one_shot_with_capacity(256);
        let config = test_config();
        let shared = Arc::new(SessionShared::new(4));
        let script = tokio::spawn(accept_login(server));
        let session = open(&transport, &config, &shared)
            .await
            .unwrap();
        // keep the server end open but never read from it again
        let _server = script
            .await
            .unwrap();
        session.publish(&shared);

        let runner = {
            let shared = shared.clone();
            let config = config.clone();
            tokio::spawn(async move { run(session, shared, &config, CancellationToken::new()).await })
        };

        let mut producers = Vec::new();
        for n in 0..30 {
            let shared = shared.clone();
            producers.push(tokio::spawn(async move {
                let action_id = format!("fill-{}", n);
                let _rx = shared
                    .correlator
                    .register(&action_id)
                    .unwrap();
                shared
                    .enqueue(
                        Record::action("Originate")
                            .with("ActionID", action_id)
                            .with("Variable", "x".repeat(200)),
                    )
                    .await
            }));
        }

        let reason = timeout(Duration::from_secs(60), runner)
            .await
            .expect("session must not hang on a full queue")
            .unwrap();
        assert_eq!(reason, DisconnectReason::HeartbeatExpired);
        assert!(!shared.online());

        // producers stuck on the full queue are released with NotConnected
        let mut refused = 0;
        for producer in producers {
            if let Err(e) = producer
                .await
                .unwrap()
            {
                assert!(matches!(e, AmiError::NotConnected));
                refused += 1;
            }
        }
        assert!(refused > 0);
    }

    #[tokio::test]
    async fn abandoned_actions_are_not_written() {
        let peer = MockPeer::in_memory(accept_all());
        let config = test_config();
        let shared = Arc::new(SessionShared::new(16));
        let session = open(&peer.transport(), &config, &shared)
            .await
            .unwrap();
        session.publish(&shared);

        let token = CancellationToken::new();
        let runner = {
            let shared = shared.clone();
            let config = config.clone();
            let token = token.clone();
            tokio::spawn(async move { run(session, shared, &config, token).await })
        };

        // nobody is registered for this one any more
        shared
            .enqueue(Record::action("Originate").with("ActionID", "given-up"))
            .await
            .unwrap();
        let rx = shared
            .correlator
            .register("live")
            .unwrap();
        shared
            .enqueue(Record::action("CoreStatus").with("ActionID", "live"))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(peer
            .received_actions("Originate")
            .is_empty());
        assert_eq!(peer.received_actions("CoreStatus").len(), 1);

        token.cancel();
        assert_eq!(runner.await.unwrap(), DisconnectReason::Shutdown);
    }

    #[tokio::test]
    async fn queued_actions_are_dropped_with_the_session() {
        let peer = MockPeer::in_memory(accept_all());
        let config = test_config();
        let shared = Arc::new(SessionShared::new(16));
        let session = open(&peer.transport(), &config, &shared)
            .await
            .unwrap();
        session.publish(&shared);

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            run(session, shared.clone(), &config, token).await,
            DisconnectReason::Shutdown
        );
        assert!(matches!(
            shared
                .enqueue(Record::action("Originate"))
                .await,
            Err(AmiError::NotConnected)
        ));
    }

    #[test]
    fn display() {
        assert_eq!(SessionState::Running.to_string(), "running");
        assert_eq!(
            DisconnectReason::IoError("broken pipe".into()).to_string(),
            "I/O error: broken pipe"
        );
        assert_eq!(DisconnectReason::HeartbeatExpired.to_string(), "heartbeat expired");
    }
}
