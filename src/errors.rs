use std::{error, fmt, io};

// HTTP/1.1

/// Request-scoped failures the HTTP/1.1 layer can answer with a canned
/// response before closing or reusing the connection.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    HeadersTooLarge,
    TooManyHeaders,
    InvalidContentLength,
    InvalidChunk,

    BodyTooLarge,
    BadUpgrade,

    Io(IoError),
}

impl ErrorKind {
    // Bodies are short fixed phrases; lengths are written literally to keep
    // the whole response a compile-time constant.
    #[rustfmt::skip]
    pub(crate) const fn as_http(&self) -> &'static [u8] {
        macro_rules! canned {
            ($status_line:expr, $len:expr, $body:expr) => {
                concat!(
                    "HTTP/1.1 ", $status_line, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "\r\n",
                    $body
                ).as_bytes()
            };
        }

        match self {
            Self::InvalidMethod        => canned!("400 Bad Request", "14", "invalid method"),
            Self::InvalidUrl           => canned!("400 Bad Request", "11", "invalid url"),
            Self::InvalidVersion       => canned!("400 Bad Request", "15", "invalid version"),
            Self::UnsupportedVersion   => canned!("505 HTTP Version Not Supported", "19", "unsupported version"),

            Self::InvalidHeader        => canned!("400 Bad Request", "14", "invalid header"),
            Self::HeadersTooLarge      => canned!("431 Request Header Fields Too Large", "17", "headers too large"),
            Self::TooManyHeaders       => canned!("431 Request Header Fields Too Large", "16", "too many headers"),
            Self::InvalidContentLength => canned!("400 Bad Request", "22", "invalid content-length"),
            Self::InvalidChunk         => canned!("400 Bad Request", "16", "invalid chunking"),

            Self::BodyTooLarge         => canned!("413 Payload Too Large", "14", "body too large"),
            Self::BadUpgrade           => canned!("400 Bad Request", "15", "invalid upgrade"),

            Self::Io(_)                => canned!("503 Service Unavailable", "19", "service unavailable"),
        }
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

// HTTP/2

/// RFC 7540 §7 error codes, as carried by RST_STREAM and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub(crate) enum H2ErrorCode {
    NoError = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    Compression = 0x9,
    Connect = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl From<u32> for H2ErrorCode {
    fn from(value: u32) -> Self {
        match value {
            0x0 => Self::NoError,
            0x1 => Self::Protocol,
            0x2 => Self::Internal,
            0x3 => Self::FlowControl,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSize,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::Compression,
            0xa => Self::Connect,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // Unknown codes are treated as INTERNAL_ERROR per RFC 7540 §7.
            _ => Self::Internal,
        }
    }
}

/// HTTP/2 failure, scoped per RFC 7540 §5.4: stream errors reset one stream
/// and leave the connection alive; connection errors end it with GOAWAY.
#[derive(Debug)]
pub(crate) enum H2Error {
    Connection(H2ErrorCode, &'static str),
    Stream(u32, H2ErrorCode),
    Io(io::Error),
}

impl H2Error {
    #[inline]
    pub(crate) fn conn(code: H2ErrorCode, reason: &'static str) -> Self {
        H2Error::Connection(code, reason)
    }

    #[inline]
    pub(crate) fn stream(id: u32, code: H2ErrorCode) -> Self {
        H2Error::Stream(id, code)
    }
}

impl fmt::Display for H2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            H2Error::Connection(code, reason) => {
                write!(f, "connection error {:?}: {}", code, reason)
            }
            H2Error::Stream(id, code) => write!(f, "stream {} error {:?}", id, code),
            H2Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl error::Error for H2Error {}

impl From<io::Error> for H2Error {
    fn from(err: io::Error) -> Self {
        H2Error::Io(err)
    }
}

impl PartialEq for H2Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (H2Error::Connection(a, _), H2Error::Connection(b, _)) => a == b,
            (H2Error::Stream(ia, ca), H2Error::Stream(ib, cb)) => ia == ib && ca == cb,
            (H2Error::Io(a), H2Error::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

// WebSocket

/// RFC 6455 close codes the server sends when failing a connection.
pub(crate) mod ws_close {
    pub(crate) const NORMAL: u16 = 1000;
    pub(crate) const GOING_AWAY: u16 = 1001;
    pub(crate) const PROTOCOL_ERROR: u16 = 1002;
    pub(crate) const INVALID_PAYLOAD: u16 = 1007;
    pub(crate) const MESSAGE_TOO_BIG: u16 = 1009;
}

#[derive(Debug)]
pub(crate) enum WsError {
    /// Protocol violation; the connection is failed with the given close
    /// code before the transport is shut down.
    Fail(u16, &'static str),
    Io(io::Error),
}

impl PartialEq for WsError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (WsError::Fail(a, _), WsError::Fail(b, _)) => a == b,
            (WsError::Io(a), WsError::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl WsError {
    #[inline]
    pub(crate) fn fail(code: u16, reason: &'static str) -> Self {
        WsError::Fail(code, reason)
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsError::Fail(code, reason) => write!(f, "close {}: {}", code, reason),
            WsError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl error::Error for WsError {}

impl From<io::Error> for WsError {
    fn from(err: io::Error) -> Self {
        WsError::Io(err)
    }
}

// Configuration

/// Startup-time configuration failures. Always fatal: the server refuses to
/// bind with an invalid configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A cross-field or range constraint was violated.
    Invalid(&'static str),
    /// An environment override could not be parsed.
    InvalidEnv(&'static str, String),
    /// TLS key material could not be loaded.
    Tls(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
            ConfigError::InvalidEnv(name, raw) => {
                write!(f, "cannot parse {}={:?}", name, raw)
            }
            ConfigError::Tls(e) => write!(f, "tls configuration: {}", e),
        }
    }
}

impl error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Tls(err)
    }
}
