//! Error type shared by the client, its connections and their operations.
//!
//! Every error is `Clone`: one connection failure fans out to the client's
//! subscribers, the reconnection logic and every operation waiting on that
//! connection.

use std::sync::Arc;

use crate::connection::ConnectionId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid channel name {0:?}")]
    InvalidChannelName(String),

    #[error("raw command must not contain line breaks: {0:?}")]
    InvalidRawCommand(String),

    #[error("invalid chat color {0:?}")]
    InvalidColor(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The service answered a command with a failure notice.
    #[error("{command} {target} rejected by server: {reason}")]
    Rejected {
        command: &'static str,
        target: String,
        /// Server `msg-id` (or notice text when no id was sent).
        reason: String,
    },

    #[error("timed out waiting for {command} {target}")]
    Timeout {
        command: &'static str,
        target: String,
    },

    #[error("connection {connection_id} closed{}", cause_suffix(.cause))]
    ConnectionClosed {
        connection_id: ConnectionId,
        cause: Option<Box<Error>>,
    },

    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    #[error("server requested reconnect")]
    ReconnectRequested,

    #[error("no response from server within ping timeout")]
    PingTimeout,

    #[error("login failed: {0}")]
    Login(String),

    /// Caller-supplied terminal error, e.g. passed to `ChatClient::destroy`.
    #[error("{0}")]
    Fatal(String),

    #[error("client is closed")]
    ClientClosed,
}

fn cause_suffix(cause: &Option<Box<Error>>) -> String {
    match cause {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(Arc::new(e))
    }
}

/// Coarse classification used at the connection/client boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input; rejected before any connection is touched.
    Input,
    /// The service refused or never answered one command.
    Protocol,
    /// One connection failed; the client recovers by rejoining elsewhere.
    Connection,
    /// Affects the whole client; every connection is torn down.
    Client,
}

/// Classify an error. See [`Error::is_client_fatal`].
pub fn classify(err: &Error) -> ErrorKind {
    match err {
        Error::InvalidChannelName(_) | Error::InvalidRawCommand(_) | Error::InvalidColor(_) => {
            ErrorKind::Input
        }
        Error::Rejected { .. } | Error::Timeout { .. } => ErrorKind::Protocol,
        Error::ConnectionClosed { .. }
        | Error::Transport(_)
        | Error::ReconnectRequested
        | Error::PingTimeout => ErrorKind::Connection,
        Error::InvalidConfig(_) | Error::Login(_) | Error::Fatal(_) | Error::ClientClosed => {
            ErrorKind::Client
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        classify(self)
    }

    /// Whether this error, surfaced by any connection, must tear down the client.
    pub fn is_client_fatal(&self) -> bool {
        self.kind() == ErrorKind::Client
    }

    pub(crate) fn closed(connection_id: ConnectionId, cause: Option<Error>) -> Self {
        Error::ConnectionClosed {
            connection_id,
            cause: cause.map(Box::new),
        }
    }
}
