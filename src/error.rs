use crate::message::Message;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("connection terminated: {0}")]
    ConnectionTerminated(String),

    // Framing errors
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    // API misuse. Unlike the frame errors, this one points at the caller.
    #[error("bad operation: {0}")]
    BadOperation(&'static str),

    // Handshake / dispatch errors
    #[error("{source}")]
    Handshake {
        #[from]
        source: HandshakeError,
    },

    #[error("no handler for resource `{0}`")]
    Dispatch(String),

    // Multiplexing errors
    #[error("invalid multiplexed frame: {0}")]
    InvalidMuxFrame(String),

    #[error("invalid multiplexing control block: {0}")]
    InvalidMuxControlBlock(String),

    // Sender / Receiver facade errors
    #[error("{source}")]
    SendError {
        #[from]
        source: SendError<Message>,
    },

    #[error("channel communication error")]
    CommunicationError,
}

impl Error {
    /// Whether the caller may keep reading frames after seeing this error.
    /// Everything except an unsupported frame ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::UnsupportedFrame(_))
    }
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("method is not GET")]
    MethodNotGet,

    #[error("HTTP version is older than 1.1")]
    VersionTooOld,

    #[error("incomplete HTTP request")]
    IncompleteRequest,

    #[error("request headers too large")]
    RequestTooLarge,

    #[error("{source}")]
    HttpParse {
        #[from]
        source: httparse::Error,
    },

    #[error("header {0} is not defined")]
    MissingHeader(&'static str),

    #[error("header {0} appears more than once")]
    DuplicateHeader(&'static str),

    #[error("illegal value for header {header}: {value}")]
    IllegalHeaderValue { header: &'static str, value: String },

    #[error("unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedVersion(String),

    #[error("hixie75 request received but hixie75 support is disabled")]
    Hixie75Disabled,

    #[error("invalid subprotocol token: {0:?}")]
    InvalidSubprotocol(String),

    #[error("no subprotocol was selected from the requested ones")]
    SubprotocolNotSelected,

    #[error("a subprotocol was selected but none was requested")]
    SubprotocolNotRequested,

    #[error("invalid extension header: {0}")]
    InvalidExtension(String),

    #[error("invalid port number in Host header")]
    InvalidHostPort,

    #[error("handler rejected the connection: {0}")]
    Rejected(String),
}
