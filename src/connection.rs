//! Connection management: connect with retry, supervise, reconnect

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::AmiConfig,
    constants::HEARTBEAT_ACTION_ID,
    correlator::PendingGuard,
    error::{AmiError, AmiResult},
    record::Record,
    session::{self, DisconnectReason, Session, SessionShared, SessionState},
    transport::{TcpTransport, Transport},
};

/// Run connect attempts until one succeeds, the budget is spent, or `token`
/// is cancelled. Sleeps `connect_delay` between attempts.
async fn connect_with_retry<T: Transport>(
    transport: &T,
    config: &AmiConfig,
    shared: &SessionShared,
    token: &CancellationToken,
) -> AmiResult<Session<T::Stream>> {
    let attempts = config
        .connect_attempts
        .max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(config.connect_delay) => {}
            }
        }

        let opened = tokio::select! {
            _ = token.cancelled() => break,
            opened = session::open(transport, config, shared) => opened,
        };

        match opened {
            Ok(session) => {
                info!(
                    attempt,
                    "[CONNECT] Connected and authenticated to {}", config.address
                );
                return Ok(session);
            }
            Err(e) => {
                shared.set_state(SessionState::Closed);
                warn!(
                    attempt,
                    "[CONNECT] Attempt {}/{} to {} failed: {}", attempt, attempts, config.address, e
                );
                last_err = Some(e);
            }
        }
    }

    shared.set_state(SessionState::Closed);
    Err(last_err.unwrap_or(AmiError::NotConnected))
}

/// Keep a session running until the scope is cancelled.
///
/// Each lost session is followed by connect rounds, `connect_delay` apart,
/// for as long as it takes.
async fn supervise<T: Transport>(
    mut session: Session<T::Stream>,
    transport: Arc<T>,
    config: Arc<AmiConfig>,
    shared: Arc<SessionShared>,
    token: CancellationToken,
) {
    loop {
        let reason = session::run(session, shared.clone(), &config, token.child_token()).await;
        shared.record_disconnect(reason.clone());
        if token.is_cancelled() {
            break;
        }

        info!(
            "[CONNECT] Lost session with {} ({}), reconnecting",
            config.address, reason
        );
        session = loop {
            match connect_with_retry(&*transport, &config, &shared, &token).await {
                Ok(session) => break session,
                Err(e) => {
                    if token.is_cancelled() {
                        shared.set_state(SessionState::Closed);
                        return;
                    }
                    error!("[CONNECT] Reconnect to {} failed: {}", config.address, e);
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = sleep(config.connect_delay) => {}
                    }
                }
            }
        };
    }

    shared.set_state(SessionState::Closed);
    debug!("Supervisor for {} stopped", config.address);
}

/// Reconnecting AMI connection.
///
/// Owns the pending-request table and a supervisor task that keeps a
/// session running. Cheap to share behind an `Arc`; every
/// method takes `&self`.
///
/// ```rust,no_run
/// # async fn example() -> Result<(), asterisk_ami_tokio::AmiError> {
/// use asterisk_ami_tokio::{AmiConfig, AmiConnection, Record};
/// use std::time::Duration;
///
/// let connection = AmiConnection::connect(AmiConfig::new("127.0.0.1:5038", "admin", "amp111")).await?;
/// let reply = connection
///     .execute(Record::action("CoreStatus"), Duration::from_secs(2))
///     .await?;
/// if reply.is_timeout() {
///     println!("no answer");
/// }
/// # Ok(())
/// # }
/// ```
pub struct AmiConnection {
    shared: Arc<SessionShared>,
    config: Arc<AmiConfig>,
    token: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AmiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiConnection")
            .field("address", &self.config.address)
            .field("enabled", &self.config.enabled)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl AmiConnection {
    /// Connect over TCP.
    ///
    /// Returns once the first session is authenticated, or with the last
    /// error after `connect_attempts` failures. A disabled configuration
    /// returns an inert connection without dialing.
    pub async fn connect(config: AmiConfig) -> AmiResult<Self> {
        Self::connect_with(config, TcpTransport, CancellationToken::new()).await
    }

    /// Connect over any [`Transport`], inside the scope of `parent`.
    ///
    /// Cancelling `parent` shuts the connection down like
    /// [`shutdown`](Self::shutdown) does, without waiting for it.
    pub async fn connect_with<T: Transport>(
        config: AmiConfig,
        transport: T,
        parent: CancellationToken,
    ) -> AmiResult<Self> {
        config.validate()?;

        let token = parent.child_token();
        let shared = Arc::new(SessionShared::new(config.queue_size));
        let config = Arc::new(config);

        if !config.enabled {
            info!("AMI client disabled, not connecting to {}", config.address);
            return Ok(Self {
                shared,
                config,
                token,
                supervisor: Mutex::new(None),
            });
        }

        info!("Connecting to Asterisk at {}", config.address);
        let transport = Arc::new(transport);
        let session = connect_with_retry(&*transport, &config, &shared, &token).await?;

        // online from the moment connect returns, before the supervisor is scheduled
        session.publish(&shared);
        let supervisor = tokio::spawn(supervise(
            session,
            transport,
            config.clone(),
            shared.clone(),
            token.clone(),
        ));

        Ok(Self {
            shared,
            config,
            token,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Send `action` and wait up to `timeout` for the reply with its `ActionID`.
    ///
    /// An `ActionID` is generated if the action has none. When the time runs
    /// out the result is a synthetic `Response: Error` / `Message: Timeout`
    /// record (see [`Record::is_synthetic`]) rather than an error; a late
    /// reply is then discarded, and an action still queued at that point is
    /// never written. The errors are for actions that cannot be sent at all:
    /// invalid fields, a reserved or already pending `ActionID`, or no
    /// running session ([`AmiError::NotConnected`]).
    pub async fn execute(&self, mut action: Record, timeout: Duration) -> AmiResult<Record> {
        if !self.config.enabled {
            return Err(AmiError::NotConnected);
        }
        action.validate()?;
        let action_id = action.ensure_action_id();
        if action_id == HEARTBEAT_ACTION_ID {
            return Err(AmiError::InvalidHeader {
                header: format!("ActionID {} is reserved", HEARTBEAT_ACTION_ID),
            });
        }

        let correlator = &self
            .shared
            .correlator;
        let mut rx = correlator.register(&action_id)?;
        let mut guard = PendingGuard::new(correlator, &action_id);
        debug!(
            action_id,
            "Executing {}",
            action
                .action_name()
                .unwrap_or("<no action>")
        );

        let waited = tokio::time::timeout(timeout, async {
            self.shared
                .enqueue(action)
                .await?;
            (&mut rx)
                .await
                .map_err(|_| AmiError::ConnectionClosed)
        })
        .await;

        let reply = match waited {
            Ok(reply) => reply?,
            Err(_) => {
                // if the reader got there first its reply is already in the channel
                correlator.expire(&action_id, Record::timeout(&action_id));
                rx.await
                    .map_err(|_| AmiError::ConnectionClosed)?
            }
        };
        guard.disarm();

        Ok(reply)
    }

    /// A session is running.
    pub fn online(&self) -> bool {
        self.shared
            .online()
    }

    /// The configuration has the client enabled.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared
            .state()
    }

    /// Watch session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared
            .subscribe_state()
    }

    /// Why the most recent session ended, if one has.
    pub fn last_disconnect(&self) -> Option<DisconnectReason> {
        self.shared
            .last_disconnect()
    }

    /// Requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared
            .correlator
            .len()
    }

    pub fn config(&self) -> &AmiConfig {
        &self.config
    }

    /// Stop reconnecting, end the running session and wait for its tasks.
    ///
    /// Pending requests are not cancelled; they run into their timeouts.
    pub async fn shutdown(&self) {
        info!("Client requested shutdown");
        if !self
            .shared
            .correlator
            .is_empty()
        {
            debug!(
                pending = self.pending_count(),
                "Shutting down with requests still pending"
            );
        }
        self.token
            .cancel();
        let supervisor = self
            .supervisor
            .lock()
            .await
            .take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                error!("Supervisor task failed: {}", e);
            }
        }
        self.shared
            .set_state(SessionState::Closed);
    }
}

impl Drop for AmiConnection {
    fn drop(&mut self) {
        self.token
            .cancel();
    }
}
