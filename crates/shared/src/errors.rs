use std::{fmt, io, net::SocketAddr};

/// Error taxonomy for the proxy's socket and session layer.
///
/// Maps loosely onto `std::io::ErrorKind`, but collapses the handful of
/// kinds the proxy actually distinguishes between and adds the
/// application-level kinds (`InvalidConfig`, `InvalidData`) that never come
/// from an `io::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidConfig,
    InvalidData,
    PermissionDenied,
    AddressInUse,
    AddressUnavailable,
    BrokenPipe,
    ConnectionReset,
    ConnectionAborted,
    Interrupted,
    TimedOut,
    Unsupported,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::InvalidConfig => "invalid configuration",
            ErrorKind::InvalidData => "invalid data",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::AddressInUse => "address in use",
            ErrorKind::AddressUnavailable => "address unavailable",
            ErrorKind::BrokenPipe => "broken pipe",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::ConnectionAborted => "connection aborted",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Classifies a `std::io::Error` surfaced through Tokio onto `ErrorKind`.
pub fn classify_io_error(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
        io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
        io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
        io::ErrorKind::Interrupted => ErrorKind::Interrupted,
        io::ErrorKind::TimedOut => ErrorKind::TimedOut,
        io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
        io::ErrorKind::AddrNotAvailable => ErrorKind::AddressUnavailable,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        io::ErrorKind::InvalidData => ErrorKind::InvalidData,
        io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
        io::ErrorKind::Unsupported => ErrorKind::Unsupported,
        _ => ErrorKind::Other,
    }
}

/// An error tagged with the peer address it concerns, for the handshake and
/// per-slot paths where logging "who" failed matters operationally.
#[derive(Debug)]
pub struct ErrorWithAddr {
    pub src_addr: Option<SocketAddr>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorWithAddr {
    pub fn new(src_addr: Option<SocketAddr>, kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorWithAddr {
            src_addr,
            kind,
            message: message.into(),
        }
    }
}

impl std::error::Error for ErrorWithAddr {}

impl fmt::Display for ErrorWithAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.src_addr {
            Some(addr) => write!(f, "{} ({}): {}", self.kind, addr, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
