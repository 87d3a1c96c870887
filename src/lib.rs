//! Asterisk Manager Interface (AMI) client for Rust
//!
//! This crate provides an async client for Asterisk's manager protocol: log in,
//! send actions, and get each reply back matched by `ActionID`. The connection
//! pings the server on a fixed period and reconnects on its own when the link
//! dies.
//!
//! # Architecture
//!
//! - [`AmiClient`] (Clone + Send) turns replies into `Result`s
//! - [`AmiConnection`] owns the pending-request table and a supervisor task
//!   that keeps a session running
//! - each session runs a reader, a writer and a heartbeat task; the first one
//!   to fail ends the session and the supervisor reconnects
//!
//! Each session has its own action queue; actions are refused while no
//! session is up, and those still queued when a session ends are dropped
//! with it. Requests that outlive their timeout resolve to a synthetic `Response: Error` /
//! `Message: Timeout` record, which the facade reports as
//! [`AmiError::Timeout`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiClient, AmiConfig, AmiError, Record};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let client = AmiClient::connect(AmiConfig::new("127.0.0.1:5038", "admin", "amp111")).await?;
//!
//!     let output = client.command("core show uptime", Duration::from_secs(2)).await?;
//!     println!("{}", output);
//!
//!     let reply = client
//!         .execute(
//!             Record::action("Originate")
//!                 .with("Channel", "PJSIP/100")
//!                 .with("Exten", "200")
//!                 .with("Context", "default")
//!                 .with("Priority", "1"),
//!             Duration::from_secs(5),
//!         )
//!         .await?;
//!     println!("{:?}", reply.message());
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing against a mock server
//!
//! [`MockPeer`] accepts every login and action by default; swap its handler
//! to script rejections, silence or hang-ups.
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiConfig, AmiConnection, MockPeer, PeerReply, Record};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), asterisk_ami_tokio::AmiError> {
//! let peer = MockPeer::start().await?;
//! let connection = AmiConnection::connect(AmiConfig::new(peer.address(), "admin", "secret")).await?;
//!
//! peer.set_handler(Arc::new(|_: &Record| PeerReply::Silent));
//! peer.drop_connections();
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod headers;
pub mod mock;
pub mod record;
pub mod session;
pub mod transport;

pub(crate) mod buffer;
pub mod constants;
pub(crate) mod correlator;
pub(crate) mod protocol;

pub use client::{ActionExecutor, AmiClient};
pub use config::AmiConfig;
pub use connection::AmiConnection;
pub use constants::DEFAULT_AMI_PORT;
pub use error::{AmiError, AmiResult};
pub use headers::{AmiHeader, ParseAmiHeaderError};
pub use mock::{accept_all, success_reply, MemoryTransport, MockPeer, PeerHandler, PeerReply};
pub use protocol::AmiParser;
pub use record::{Record, ResponseStatus};
pub use session::{DisconnectReason, SessionState};
pub use transport::{TcpTransport, Transport};
