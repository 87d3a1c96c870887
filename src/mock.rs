//! Scriptable AMI server for tests
//!
//! [`MockPeer`] speaks just enough of the manager protocol to drive the client:
//! it sends a 100-byte greeting, then answers every action it receives through
//! a pluggable [`PeerHandler`]. The default handler accepts everything.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), asterisk_ami_tokio::AmiError> {
//! use asterisk_ami_tokio::{AmiConfig, AmiConnection, MockPeer};
//!
//! let peer = MockPeer::start().await?;
//! let connection = AmiConnection::connect(AmiConfig::new(peer.address(), "admin", "secret")).await?;
//! assert!(connection.online());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    constants::{
        GREETING_LEN, MAX_ACTION_QUEUE_SIZE, MESSAGE_AUTH_ACCEPTED, RESPONSE_SUCCESS,
        SOCKET_BUF_SIZE,
    },
    error::{AmiError, AmiResult},
    headers::AmiHeader,
    protocol::AmiParser,
    record::Record,
    transport::Transport,
};

const BANNER: &str = "Asterisk Call Manager/9.0.0 (mock)";

/// What the peer does with one received action.
#[derive(Debug, Clone)]
pub enum PeerReply {
    /// Send this record back immediately.
    Reply(Record),
    /// Send this record back after a pause, without holding up later actions.
    Delayed(Duration, Record),
    /// Send nothing.
    Silent,
    /// Hang up the connection.
    Close,
}

/// Decides the reply to each action the peer receives.
pub type PeerHandler = Arc<dyn Fn(&Record) -> PeerReply + Send + Sync>;

/// `{ActionID, Response: Success, Message: Authentication accepted}` echoing
/// the action's `ActionID`, or silence if it carries none.
pub fn success_reply(action: &Record) -> PeerReply {
    match action.action_id() {
        Some(action_id) => PeerReply::Reply(
            Record::new()
                .with(AmiHeader::ActionId, action_id)
                .with(AmiHeader::Message, MESSAGE_AUTH_ACCEPTED)
                .with(AmiHeader::Response, RESPONSE_SUCCESS),
        ),
        None => PeerReply::Silent,
    }
}

/// Handler answering every action with [`success_reply`].
pub fn accept_all() -> PeerHandler {
    Arc::new(success_reply)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn greeting() -> Vec<u8> {
    let mut banner = format!("{:<width$}", BANNER, width = GREETING_LEN - 2).into_bytes();
    banner.extend_from_slice(b"\r\n");
    banner
}

struct PeerState {
    handler: RwLock<PeerHandler>,
    received: Mutex<Vec<Record>>,
    connections: AtomicUsize,
    /// Parent of every live connection; replaced by `drop_connections`.
    generation: Mutex<CancellationToken>,
    root: CancellationToken,
}

impl PeerState {
    fn handler(&self) -> PeerHandler {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attach<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let count = self
            .connections
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let token = lock(&self.generation).child_token();
        debug!("[MOCK] Connection #{} accepted", count);
        tokio::spawn(serve_connection(stream, self.clone(), token));
    }
}

async fn serve_connection<S>(stream: S, state: Arc<PeerState>, token: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    if writer
        .write_all(&greeting())
        .await
        .is_err()
    {
        return;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Record>(MAX_ACTION_QUEUE_SIZE);
    let write_token = token.child_token();
    let writer_token = write_token.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let record = tokio::select! {
                _ = writer_token.cancelled() => break,
                record = out_rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };
            if writer
                .write_all(
                    record
                        .to_wire_format()
                        .as_bytes(),
                )
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = writer
            .shutdown()
            .await;
    });

    let mut parser = AmiParser::new();
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

    'connection: loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut read_buffer) => read,
        };
        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if parser
            .add_data(&read_buffer[..n])
            .is_err()
        {
            break;
        }

        loop {
            let action = match parser.parse_record() {
                Ok(Some(action)) => action,
                Ok(None) => break,
                Err(e) => {
                    warn!("[MOCK] Unparseable input: {}", e);
                    break 'connection;
                }
            };
            trace!(?action, "[MOCK] Received action");
            lock(&state.received).push(action.clone());

            let handler = state.handler();
            match handler(&action) {
                PeerReply::Reply(reply) => {
                    let _ = out_tx
                        .send(reply)
                        .await;
                }
                PeerReply::Delayed(delay, reply) => {
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = out_tx
                            .send(reply)
                            .await;
                    });
                }
                PeerReply::Silent => {}
                PeerReply::Close => {
                    debug!("[MOCK] Handler closed the connection");
                    break 'connection;
                }
            }
        }
    }

    write_token.cancel();
    let _ = writer_task.await;
}

async fn accept_loop(listener: TcpListener, state: Arc<PeerState>) {
    loop {
        let accepted = tokio::select! {
            _ = state.root.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                trace!("[MOCK] Accepted {}", addr);
                let _ = stream.set_nodelay(true);
                state.attach(stream);
            }
            Err(e) => {
                warn!("[MOCK] Accept failed: {}", e);
                return;
            }
        }
    }
}

/// In-process AMI server.
///
/// Dropping the peer closes the listener and every live connection.
pub struct MockPeer {
    state: Arc<PeerState>,
    address: Option<SocketAddr>,
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer")
            .field("address", &self.address)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl MockPeer {
    fn new(handler: PeerHandler, address: Option<SocketAddr>) -> Self {
        let root = CancellationToken::new();
        Self {
            state: Arc::new(PeerState {
                handler: RwLock::new(handler),
                received: Mutex::new(Vec::new()),
                connections: AtomicUsize::new(0),
                generation: Mutex::new(root.child_token()),
                root,
            }),
            address,
        }
    }

    /// Listen on an ephemeral loopback port, accepting every action.
    pub async fn start() -> AmiResult<Self> {
        Self::with_handler(accept_all()).await
    }

    /// Listen on an ephemeral loopback port with a custom handler.
    pub async fn with_handler(handler: PeerHandler) -> AmiResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let peer = Self::new(handler, Some(address));
        tokio::spawn(accept_loop(listener, peer.state.clone()));
        info!("[MOCK] Listening on {}", address);
        Ok(peer)
    }

    /// Peer reachable only through [`transport`](Self::transport), over
    /// in-memory pipes. Works under a paused test clock.
    pub fn in_memory(handler: PeerHandler) -> Self {
        Self::new(handler, None)
    }

    /// `host:port` to dial, or `"in-memory"` for an in-memory peer.
    pub fn address(&self) -> String {
        match self.address {
            Some(address) => address.to_string(),
            None => "in-memory".to_string(),
        }
    }

    /// Transport whose every dial opens a fresh in-memory connection to
    /// this peer.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            state: self
                .state
                .clone(),
        }
    }

    /// Replace the handler. Applies to actions received from now on, on
    /// every connection.
    pub fn set_handler(&self, handler: PeerHandler) {
        *self
            .state
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state
            .connections
            .load(Ordering::SeqCst)
    }

    /// Every action received so far, across all connections, in arrival order.
    pub fn received(&self) -> Vec<Record> {
        lock(&self.state.received).clone()
    }

    /// Received actions with the given `Action` name.
    pub fn received_actions(&self, action: &str) -> Vec<Record> {
        lock(&self.state.received)
            .iter()
            .filter(|record| record.action_name() == Some(action))
            .cloned()
            .collect()
    }

    /// Hang up every live connection. The peer keeps accepting new ones.
    pub fn drop_connections(&self) {
        let mut generation = lock(&self.state.generation);
        let old = std::mem::replace(
            &mut *generation,
            self.state
                .root
                .child_token(),
        );
        old.cancel();
        debug!("[MOCK] Dropped live connections");
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.state
            .root
            .cancel();
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.state
            .root
            .cancel();
    }
}

/// [`Transport`] into a [`MockPeer`] without touching the network.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<PeerState>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Stream = DuplexStream;

    async fn dial(&self, address: &str, _dial_timeout: Duration) -> AmiResult<DuplexStream> {
        if self
            .state
            .root
            .is_cancelled()
        {
            return Err(AmiError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("mock peer {} is shut down", address),
            )));
        }
        let (client, server) = tokio::io::duplex(SOCKET_BUF_SIZE * 4);
        self.state
            .attach(server);
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_record(stream: &mut DuplexStream, parser: &mut AmiParser) -> Option<Record> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(record) = parser
                .parse_record()
                .unwrap()
            {
                return Some(record);
            }
            let n = stream
                .read(&mut buf)
                .await
                .unwrap();
            if n == 0 {
                return None;
            }
            parser
                .add_data(&buf[..n])
                .unwrap();
        }
    }

    async fn dial(peer: &MockPeer) -> DuplexStream {
        let mut stream = peer
            .transport()
            .dial("in-memory", Duration::from_secs(1))
            .await
            .unwrap();
        let mut banner = [0u8; GREETING_LEN];
        stream
            .read_exact(&mut banner)
            .await
            .unwrap();
        assert!(banner.starts_with(BANNER.as_bytes()));
        assert!(banner.ends_with(b"\r\n"));
        stream
    }

    #[test]
    fn greeting_is_exactly_one_read() {
        assert_eq!(greeting().len(), GREETING_LEN);
    }

    #[tokio::test]
    async fn answers_with_success_and_records_actions() {
        let peer = MockPeer::in_memory(accept_all());
        let mut stream = dial(&peer).await;

        let action = Record::action("Login")
            .with("ActionID", "m-1")
            .with("Username", "admin");
        stream
            .write_all(
                action
                    .to_wire_format()
                    .as_bytes(),
            )
            .await
            .unwrap();

        let mut parser = AmiParser::new();
        let reply = read_record(&mut stream, &mut parser)
            .await
            .unwrap();
        assert_eq!(reply.action_id(), Some("m-1"));
        assert_eq!(reply.response(), Some("Success"));
        assert_eq!(reply.message(), Some("Authentication accepted"));

        assert_eq!(peer.connection_count(), 1);
        assert_eq!(peer.received_actions("Login").len(), 1);
        assert_eq!(peer.received()[0].get("Username"), Some("admin"));
    }

    #[tokio::test]
    async fn close_reply_hangs_up() {
        let peer = MockPeer::in_memory(Arc::new(|_: &Record| PeerReply::Close));
        let mut stream = dial(&peer).await;
        stream
            .write_all(
                Record::action("Ping")
                    .with("ActionID", "x")
                    .to_wire_format()
                    .as_bytes(),
            )
            .await
            .unwrap();

        let mut parser = AmiParser::new();
        assert!(read_record(&mut stream, &mut parser)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn drop_connections_closes_live_streams() {
        let peer = MockPeer::in_memory(accept_all());
        let mut first = dial(&peer).await;

        peer.drop_connections();
        let mut parser = AmiParser::new();
        assert!(read_record(&mut first, &mut parser)
            .await
            .is_none());

        let _second = dial(&peer).await;
        assert_eq!(peer.connection_count(), 2);
    }

    #[tokio::test]
    async fn shut_down_peer_refuses_dials() {
        let peer = MockPeer::in_memory(accept_all());
        peer.shutdown();
        let err = peer
            .transport()
            .dial("in-memory", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AmiError::Io(_)));
    }

    #[tokio::test]
    async fn tcp_peer_accepts_connections() {
        let peer = MockPeer::start()
            .await
            .unwrap();
        let mut stream = tokio::net::TcpStream::connect(peer.address())
            .await
            .unwrap();
        let mut banner = [0u8; GREETING_LEN];
        stream
            .read_exact(&mut banner)
            .await
            .unwrap();
        assert!(banner.starts_with(b"Asterisk Call Manager"));
    }
}
