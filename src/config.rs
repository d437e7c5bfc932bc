use core::time::Duration;

/// Advertised receive window for new channels.
pub const DEFAULT_WINDOW: u32 = 0x40000;

/// Largest data payload we accept in a single packet.
pub const DEFAULT_MAX_PACKET: u32 = 0x8000;

/// Local max packet is never advertised below this.
///
/// RFC4253 section 6.1 requires implementations handle 32768 byte payloads.
pub const MIN_MAX_PACKET: u32 = 0x8000;

pub const DEFAULT_MAX_CHANNELS: usize = 10;

/// Extra attempts after a refused channel open.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 0;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outstanding `want_reply` requests per channel.
pub const MAX_OUTSTANDING_REQS: usize = 8;

// Enough for longest 23 of "screen.konsole-256color" on my system
// Unsure if this is specified somewhere
pub const MAX_TERM: usize = 32;

pub const DEFAULT_TERM: &str = "xterm";

/// Channel settings for a [`Conn`](crate::Conn).
#[derive(Debug, Clone)]
pub struct ChanConfig {
    /// Initial local window, restored when it falls below half.
    pub window: u32,
    /// Advertised max packet, see [`local_max_packet()`](Self::local_max_packet).
    pub max_packet: u32,
    /// Number of times a refused open is resent.
    pub retry_attempts: u32,
    /// Concurrently open channels.
    pub max_channels: usize,
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    /// Timeout for requests with `want_reply`.
    pub request_timeout: Duration,
}

impl Default for ChanConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_packet: DEFAULT_MAX_PACKET,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            max_channels: DEFAULT_MAX_CHANNELS,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ChanConfig {
    pub fn local_max_packet(&self) -> u32 {
        self.max_packet.max(MIN_MAX_PACKET)
    }

    /// A window adjust is sent once the local window drops below this.
    pub fn low_water(&self) -> u32 {
        self.window / 2
    }
}
