use crate::error::{Result, YamuxError};
use std::time::Duration;

/// Configuration for a yamux session.
///
/// `Config` contains the tunable parameters for a session: the accept
/// backlog, keep-alive cadence, flow-control window bound and the various
/// timers.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use yamux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.accept_backlog, 256);
/// assert!(config.enable_keep_alive);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use yamux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .keep_alive_interval(Duration::from_secs(10))
///     .max_stream_window_size(1024 * 1024)
///     .build()
///     .expect("Valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Max concurrent remotely-opened streams awaiting accept.
    pub accept_backlog: usize,
    /// Emit periodic pings and tear the session down when they go
    /// unanswered.
    pub enable_keep_alive: bool,
    /// Period between keep-alive pings.
    pub keep_alive_interval: Duration,
    /// Max time for a single frame write on the pipe; exceeding it is
    /// session-fatal.
    pub connection_write_timeout: Duration,
    /// Upper bound on per-stream receive credit, in bytes.
    pub max_stream_window_size: u32,
    /// How long an opened stream may wait for the peer's ACK before the
    /// session is torn down. Zero disables the timer.
    pub stream_open_timeout: Duration,
    /// How long a half-closed stream waits for the peer's FIN before being
    /// force-reset. Zero disables the timer.
    pub stream_close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            connection_write_timeout: Duration::from_secs(10),
            max_stream_window_size: crate::header::INITIAL_STREAM_WINDOW,
            stream_open_timeout: Duration::from_secs(300),
            stream_close_timeout: Duration::from_secs(70),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.accept_backlog == 0 {
            return Err(YamuxError::Config(
                "Accept backlog cannot be 0".to_string(),
            ));
        }

        if self.enable_keep_alive && self.keep_alive_interval.is_zero() {
            return Err(YamuxError::Config(
                "Keep-alive interval cannot be 0 when keep-alive is enabled".to_string(),
            ));
        }

        if self.connection_write_timeout.is_zero() {
            return Err(YamuxError::Config(
                "Connection write timeout cannot be 0".to_string(),
            ));
        }

        if self.max_stream_window_size == 0 {
            return Err(YamuxError::Config(
                "Max stream window size cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Streams bootstrap their windows at the protocol default, capped by
    /// the configured bound so a smaller bound is honored end-to-end.
    pub(crate) fn initial_window(&self) -> u32 {
        self.max_stream_window_size
            .min(crate::header::INITIAL_STREAM_WINDOW)
    }
}

/// Builder for creating custom `Config` instances.
///
/// Starts from the defaults and allows selective overriding; `build`
/// validates the result.
///
/// # Examples
///
/// ```rust
/// use yamux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .accept_backlog(64)
///     .enable_keep_alive(false)
///     .stream_close_timeout(Duration::from_secs(5))
///     .build()
///     .expect("Valid configuration");
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn enable_keep_alive(mut self, enable: bool) -> Self {
        self.config.enable_keep_alive = enable;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn connection_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_write_timeout = timeout;
        self
    }

    pub fn max_stream_window_size(mut self, size: u32) -> Self {
        self.config.max_stream_window_size = size;
        self
    }

    pub fn stream_open_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_open_timeout = timeout;
        self
    }

    pub fn stream_close_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_close_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
