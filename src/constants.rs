//! Protocol constants and configuration values

/// Default Asterisk manager port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Default manager host
pub const DEFAULT_AMI_HOST: &str = "localhost";

/// Socket buffer size for reading from TCP stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Initial codec buffer allocation (16KB). AMI frames are small header blocks.
pub const BUF_CHUNK: usize = 16 * 1024;

/// Maximum length of a single unterminated line (1MB).
/// A longer fragment without CRLF means the peer is not speaking AMI.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Protocol line separator
pub const LINE_SEPARATOR: &str = "\r\n";

/// `Response` header value of a successful reply
pub const RESPONSE_SUCCESS: &str = "Success";

/// `Event` header value of AsyncAGI sub-events
pub const EVENT_ASYNC_AGI: &str = "AsyncAGI";

/// `Event` header value of the terminal originate notification
pub const EVENT_ORIGINATE_RESPONSE: &str = "OriginateResponse";

/// `SubEvent` values of AsyncAGI
pub const SUBEVENT_START: &str = "Start";
pub const SUBEVENT_END: &str = "End";
pub const SUBEVENT_EXEC: &str = "Exec";

/// Environment blob escapes: record separator (`\n`) and key/value separator (`: `)
pub const ENV_RECORD_SEPARATOR: &str = "%0A";
pub const ENV_PAIR_SEPARATOR: &str = "%3A%20";

/// Connection timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Maximum number of queued notifications before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;
