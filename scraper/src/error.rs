use shared::wire::WireError;
use thiserror::Error;

/// Failures while exchanging or decoding a UDP status query
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Response header mismatch")]
    BadHeader,

    #[error("Unexpected reply code {actual:#04x}, expected {expected:#04x}")]
    UnexpectedReply { expected: u8, actual: u8 },

    #[error("Unexpected response name: expected {expected}, got {actual}")]
    BadResponseName { expected: String, actual: String },

    #[error("Challenge echoed by server does not match")]
    ChallengeMismatch,

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Failures on the RCON connection
#[derive(Debug, Error)]
pub enum RconError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Server sent a {0}-byte key, expected 10")]
    ShortKey(usize),

    #[error("Login rejected by server (reply {0})")]
    LoginFailed(u8),

    #[error("Response length {0} is invalid")]
    BadLength(i32),

    #[error("Timed out waiting for server")]
    Timeout,
}

/// Records the data manager refuses to merge
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("Player record has neither id nor name")]
    UnresolvablePlayer,

    #[error("No player named '{0}' in the current round")]
    PlayerNotFound(String),
}

/// Failures building an update sink from configuration
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Unknown sink '{0}'")]
    UnknownSink(String),

    #[error("Invalid sink setup '{setup}': {message}")]
    BadSetup { setup: String, message: String },

    #[error("Sink requires a running tokio runtime")]
    NoRuntime,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryError {
    /// True for errors caused by the payload rather than the transport
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, QueryError::Io(_))
    }
}
