use std::time::Duration;

/// Default receive buffer size for a single datagram.
/// Anything larger than this arriving on a datagram socket is truncated by the OS.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024;

/// Default idle lifetime for datagram connections.
/// A datagram connection with no traffic in either direction for this long is closed.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Read chunk size for the reliable-stream pump.
pub(crate) const STREAM_READ_BUFFER_SIZE: usize = 16 * 1024;

/// `localhost` is rewritten to the loopback literal before resolution so that
/// connections do not depend on the host database.
pub(crate) const LOCALHOST: &str = "localhost";
pub(crate) const LOCALHOST_IP: &str = "127.0.0.1";

/// Metric names exposed by the scrape surface.
pub(crate) const METRIC_OUTBOUND_COUNT: &str = "pipy_outbound_count";
pub(crate) const METRIC_OUTBOUND_IN: &str = "pipy_outbound_in";
pub(crate) const METRIC_OUTBOUND_OUT: &str = "pipy_outbound_out";
pub(crate) const METRIC_OUTBOUND_CONN_TIME: &str = "pipy_outbound_conn_time";
