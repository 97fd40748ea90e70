//! Error taxonomy shared by every layer of the overlay.
//!
//! Errors are grouped by where they originate:
//! - [`NetworkError`]  : transport connect/accept/send/receive failures.
//! - [`ProtocolError`] : malformed frames or control messages.
//! - [`AuthError`]     : login handshake rejections.
//! - [`DeviceError`]   : virtual network device failures.
//!
//! [`Error`] wraps all four and adds the endpoint lifecycle errors.  The
//! propagation policy is: a malformed frame is a per-connection event (log and
//! drop), a send failure to one fan-out recipient is swallowed, and only the
//! [recoverable](Error::is_recoverable) set is eligible for a supervised retry.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("bind failed: {0}")]
    BindFailed(String),
    #[error("listen failed: {0}")]
    ListenFailed(String),
    #[error("accept failed: {0}")]
    AcceptFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

impl NetworkError {
    /// Classify an I/O error raised while writing to a transport.
    pub fn from_send(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => NetworkError::ConnectionTimeout,
            _ => NetworkError::SendFailed(err.to_string()),
        }
    }

    /// Classify an I/O error raised while reading from a transport.
    ///
    /// A clean or abrupt end of stream is reported as
    /// [`NetworkError::ConnectionClosed`].
    pub fn from_receive(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetworkError::ConnectionClosed,
            io::ErrorKind::TimedOut => NetworkError::ConnectionTimeout,
            _ => NetworkError::ReceiveFailed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload too short to carry an Ethernet header.
    #[error("invalid frame: {len} bytes, need at least 14")]
    InvalidFrame { len: usize },
    #[error("invalid magic 0x{0:04X}")]
    InvalidMagic(u16),
    #[error("frame payload of {0} bytes exceeds the 65531 byte limit")]
    FrameTooLarge(usize),
    #[error("frame too small: need {needed} bytes, have {available}")]
    FrameTooSmall { needed: usize, available: usize },
    #[error("buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("control parse error: {0}")]
    ParseError(String),
    #[error("control encode error: need {required} bytes, have {available}")]
    EncodeError { required: usize, available: usize },
    #[error("decode error: {0}")]
    DecodeError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("token expired")]
    TokenExpired,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device already exists: {0}")]
    DeviceAlreadyExists(String),
    #[error("device create failed: {0}")]
    DeviceCreateFailed(String),
    #[error("device open failed: {0}")]
    DeviceOpenFailed(String),
    #[error("device close failed: {0}")]
    DeviceCloseFailed(String),
    #[error("device read failed: {0}")]
    ReadFailed(String),
    #[error("device write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("worker is already running")]
    AlreadyRunning,
    #[error("worker is disconnected; deinit() before starting again")]
    NotInitialized,
}

impl Error {
    /// `true` for the transient failures a supervising caller may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Network(
                NetworkError::ConnectionTimeout
                    | NetworkError::SendFailed(_)
                    | NetworkError::ReceiveFailed(_)
            )
        )
    }
}
