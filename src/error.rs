use thiserror::Error;

/// Faults raised by the wire-format parser. Every variant is fatal for the
/// connection it occurred on: the byte stream is desynchronized and must be
/// torn down, never resynchronized.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unknown type marker byte 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid length field: {0}")]
    BadLength(String),

    #[error("line not terminated by CRLF")]
    MissingCrlf,

    #[error("malformed value: {0}")]
    Malformed(String),

    #[error("stream ended inside a partial value")]
    Truncated,
}

/// Client-side faults. Error replies sent by the server travel to callers
/// as ordinary `RespValue::Error` data, not through this enum; the only
/// server errors consumed internally are ASK/MOVED redirects.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("received a reply with no request pending")]
    StrayResponse,

    #[error("command carries no key to route on")]
    MissingKey,

    #[error("no known node serves slot {0}")]
    UnroutableSlot(u16),

    #[error("transaction keys hash to more than one slot")]
    CrossSlot,

    #[error("redirect limit exceeded for slot {0}")]
    TooManyRedirects(u16),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("invalid command line: {0}")]
    CommandLine(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
