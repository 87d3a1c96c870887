//! Protocol constants and configuration values

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from the TCP stream (16KB)
pub const SOCKET_BUF_SIZE: usize = 16 * 1024;

/// Maximum buffered bytes without a line terminator (1MB).
/// AMI lines are short; a line this long means the stream is desynchronized.
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Maximum total buffer size (4MB) - safety limit to prevent runaway memory
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Line terminator written on the wire
pub const LINE_TERMINATOR: &str = "\r\n";

/// Separator between field name and value when serializing
pub const FIELD_SEPARATOR: &str = ": ";

/// Size of the greeting banner sent by the server before the first record.
pub const GREETING_LEN: usize = 100;

/// Sentinel closing the body of a `Response: Follows` record.
pub const END_COMMAND: &str = "--END COMMAND--";

/// Reserved `ActionID` for heartbeat pings. Replies carrying it never reach
/// the correlation table.
pub const HEARTBEAT_ACTION_ID: &str = "AmiTokioHeartbeat";

/// `Response` / `Message` values with protocol meaning.
pub const RESPONSE_SUCCESS: &str = "Success";
pub const RESPONSE_ERROR: &str = "Error";
pub const RESPONSE_FOLLOWS: &str = "Follows";
pub const MESSAGE_TIMEOUT: &str = "Timeout";
pub const MESSAGE_AUTH_ACCEPTED: &str = "Authentication accepted";

/// Action names used by the client itself.
pub const ACTION_LOGIN: &str = "Login";
pub const ACTION_PING: &str = "Ping";

/// Capacity of the outbound action queue. Producers block once it is full.
pub const MAX_ACTION_QUEUE_SIZE: usize = 1000;

/// Dial timeout in milliseconds
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 2000;

/// Heartbeat period in milliseconds (also the TCP keep-alive interval)
pub const DEFAULT_KEEPALIVE_MS: u64 = 5000;

/// Heartbeat reply timeout in milliseconds
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 2000;

/// Consecutive missed heartbeats before the session is declared dead
pub const DEFAULT_PING_FAILURES: u32 = 3;

/// Connect attempts per connect sequence
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Delay between connect attempts in milliseconds
pub const DEFAULT_CONNECT_DELAY_MS: u64 = 1000;
