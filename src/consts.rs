use std::time::Duration;

/// Port used when a URI or configuration does not name one.
pub const DEFAULT_PORT: u16 = 6379;

/// Backoff delay between a failed connection attempt and the next automatic
/// retry.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Consecutive failed attempts tolerated before the client enters the failed
/// state. The counts carried by `ReconnectFailed` notifications run 1..=4.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 4;

/// How long to wait for any traffic after a keepalive ping before the
/// inactivity monitor closes the connection.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Initial capacity of the read buffer.
pub const READ_BUFFER_SIZE: usize = 4 * 1024;
