use std::io;
use thiserror::Error;

/// Convenient type alias for `Result<T, YamuxError>`.
pub type Result<T> = std::result::Result<T, YamuxError>;

/// Error types for the yamux library.
///
/// `YamuxError` covers everything from I/O failures on the underlying pipe
/// to peer protocol violations and timer-driven session teardown.
#[derive(Debug, Error)]
pub enum YamuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid protocol version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid message type: {0}")]
    InvalidMsgType(u8),

    #[error("Unexpected flag for current stream state")]
    UnexpectedFlag,

    #[error("Session shutdown")]
    SessionShutdown,

    #[error("Stream IDs exhausted")]
    StreamsExhausted,

    #[error("Duplicate SYN for stream: {0}")]
    DuplicateStream(u32),

    #[error("Receive window exceeded on stream: {0}")]
    RecvWindowExceeded(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Connection write timeout")]
    ConnectionWriteTimeout,

    #[error("Keep-alive timeout")]
    KeepAliveTimeout,

    #[error("Stream open timeout")]
    StreamOpenTimeout,

    #[error("Remote side initiated shutdown")]
    RemoteGoAway,

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl YamuxError {
    /// Whether the session survives this error. Pipe failures,
    /// session-level timeouts and violations that cannot be pinned on a
    /// single stream are fatal; failures the state machine can attribute
    /// to one stream are contained, and the dispatch path resets just that
    /// stream.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            YamuxError::Io(_)
            | YamuxError::InvalidVersion(_)
            | YamuxError::InvalidMsgType(_)
            | YamuxError::DuplicateStream(_)
            | YamuxError::InvalidStreamId(_)
            | YamuxError::FrameTooLarge { .. }
            | YamuxError::ConnectionWriteTimeout
            | YamuxError::KeepAliveTimeout
            | YamuxError::StreamOpenTimeout
            | YamuxError::SessionShutdown => true,
            YamuxError::UnexpectedFlag
            | YamuxError::RecvWindowExceeded(_)
            | YamuxError::StreamClosed
            | YamuxError::ConnectionReset
            | YamuxError::StreamsExhausted
            | YamuxError::RemoteGoAway
            | YamuxError::Config(_) => false,
        }
    }
}

impl From<YamuxError> for io::Error {
    fn from(err: YamuxError) -> io::Error {
        let kind = match &err {
            YamuxError::Io(e) => e.kind(),
            YamuxError::ConnectionReset => io::ErrorKind::ConnectionReset,
            YamuxError::StreamClosed | YamuxError::SessionShutdown => io::ErrorKind::BrokenPipe,
            YamuxError::RemoteGoAway => io::ErrorKind::ConnectionAborted,
            YamuxError::ConnectionWriteTimeout
            | YamuxError::KeepAliveTimeout
            | YamuxError::StreamOpenTimeout => io::ErrorKind::TimedOut,
            YamuxError::InvalidVersion(_)
            | YamuxError::InvalidMsgType(_)
            | YamuxError::UnexpectedFlag
            | YamuxError::DuplicateStream(_)
            | YamuxError::RecvWindowExceeded(_)
            | YamuxError::InvalidStreamId(_)
            | YamuxError::FrameTooLarge { .. } => io::ErrorKind::InvalidData,
            YamuxError::StreamsExhausted | YamuxError::Config(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
