//! Caller-facing facade over a connection

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::AmiConfig,
    connection::AmiConnection,
    constants::ACTION_PING,
    error::{AmiError, AmiResult},
    record::Record,
    transport::Transport,
};

/// Something that can send an action and wait for its reply.
///
/// [`AmiConnection`] is the real implementation.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    /// Send `action` and wait at most `timeout` for its reply. A missed
    /// deadline yields a timeout record, not an error.
    async fn execute(&self, action: Record, timeout: Duration) -> AmiResult<Record>;

    /// A session is running.
    fn online(&self) -> bool;

    /// The client is configured to connect at all.
    fn enabled(&self) -> bool;
}

#[async_trait]
impl ActionExecutor for AmiConnection {
    async fn execute(&self, action: Record, timeout: Duration) -> AmiResult<Record> {
        AmiConnection::execute(self, action, timeout).await
    }

    fn online(&self) -> bool {
        AmiConnection::online(self)
    }

    fn enabled(&self) -> bool {
        AmiConnection::enabled(self)
    }
}

/// AMI client handle (Clone + Send).
///
/// Turns the connection's record-level answers into `Result`s:
///
/// | Situation | Result |
/// |-----------|--------|
/// | no session running (or client disabled) | [`AmiError::NotConnected`] |
/// | `Response: Error`, `Message: Timeout` | [`AmiError::Timeout`] |
/// | any other `Response: Error` | [`AmiError::ActionFailed`] |
/// | anything else | `Ok(record)` |
///
/// ```rust,no_run
/// # async fn example() -> Result<(), asterisk_ami_tokio::AmiError> {
/// use asterisk_ami_tokio::{AmiClient, AmiConfig, Record};
/// use std::time::Duration;
///
/// let client = AmiClient::connect(AmiConfig::from_env()?).await?;
/// let reply = client
///     .execute(
///         Record::action("Setvar").with("Variable", "NIGHT_MODE").with("Value", "1"),
///         Duration::from_secs(2),
///     )
///     .await?;
/// println!("{:?}", reply.message());
/// # Ok(())
/// # }
/// ```
pub struct AmiClient<E = AmiConnection> {
    inner: Arc<E>,
}

impl<E> Clone for AmiClient<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self
                .inner
                .clone(),
        }
    }
}

impl<E: ActionExecutor> std::fmt::Debug for AmiClient<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient")
            .field("online", &self.online())
            .field("enabled", &self.enabled())
            .finish()
    }
}

impl AmiClient<AmiConnection> {
    /// Connect over TCP. See [`AmiConnection::connect`].
    pub async fn connect(config: AmiConfig) -> AmiResult<Self> {
        Ok(Self::new(AmiConnection::connect(config).await?))
    }

    /// Connect over `transport` within `parent`'s scope. See
    /// [`AmiConnection::connect_with`].
    pub async fn connect_with<T: Transport>(
        config: AmiConfig,
        transport: T,
        parent: CancellationToken,
    ) -> AmiResult<Self> {
        Ok(Self::new(
            AmiConnection::connect_with(config, transport, parent).await?,
        ))
    }

    /// The underlying connection, for state inspection.
    pub fn connection(&self) -> &AmiConnection {
        &self.inner
    }

    /// Shut the connection down. Affects every clone of this handle.
    pub async fn shutdown(&self) {
        self.inner
            .shutdown()
            .await
    }
}

impl<E: ActionExecutor> AmiClient<E> {
    pub fn new(executor: E) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub fn online(&self) -> bool {
        self.inner
            .online()
    }

    pub fn enabled(&self) -> bool {
        self.inner
            .enabled()
    }

    /// Send an action and classify the reply.
    pub async fn execute(&self, action: Record, timeout: Duration) -> AmiResult<Record> {
        if !self.online() {
            return Err(AmiError::NotConnected);
        }

        let reply = self
            .inner
            .execute(action, timeout)
            .await?;
        if reply.is_timeout() {
            debug!(action_id = reply.action_id(), "Action timed out");
            return Err(AmiError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        reply.into_result()
    }

    /// `Action: Ping`.
    pub async fn ping(&self, timeout: Duration) -> AmiResult<Record> {
        self.execute(Record::action(ACTION_PING), timeout)
            .await
    }

    /// Run a CLI command and return its output.
    ///
    /// Multi-line output (`Response: Follows`) comes back joined with `\n`;
    /// otherwise the first `Output` line is returned. Empty if the server
    /// sent neither.
    pub async fn command(&self, cli: &str, timeout: Duration) -> AmiResult<String> {
        let reply = self
            .execute(
                Record::action("Command").with("Command", cli),
                timeout,
            )
            .await?;
        Ok(reply
            .command_response()
            .or_else(|| reply.real_output())
            .unwrap_or("")
            .to_string())
    }
}
