//! # Client Errors
//!
//! Purpose: Define the error taxonomy shared by the plain transport, the
//! protocol commands and the retrying connection.
//!
//! ## Design Principles
//! 1. **Structured Classification**: `ClientError::class` decides retry policy,
//!    callers never match on message text.
//! 2. **Lossless Propagation**: Errors cross layers unmodified so the caller
//!    sees exactly what the server or socket reported.

use std::fmt;

use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Prefix the server uses while it is still loading its dataset.
const LOADING_PREFIX: &[u8] = b"LOADING";

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while dialing, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// No live inner connection is available.
    #[error("not connected")]
    NotConnected,
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply.
    #[error("server error: {0}")]
    Server(ServerError),
    /// Response type did not match the expected receiver.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Address could not be parsed into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Network family is not one the dialer knows.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    /// The connection was closed by the caller.
    #[error("connection closed")]
    Closed,
    /// The command already consumed part of a reply and cannot be sent again.
    #[error("command cannot be reused after a failed decode")]
    StaleAction,
}

/// How the retrying connection reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection-level failure: reconnect, then retry.
    Network,
    /// Server is warming its dataset: wait, then retry on the same connection.
    Loading,
    /// Anything else: hand back to the caller.
    Terminal,
}

impl ClientError {
    /// Classifies the error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Io(_) | ClientError::NotConnected => ErrorClass::Network,
            ClientError::Server(err) if err.is_loading() => ErrorClass::Loading,
            _ => ErrorClass::Terminal,
        }
    }

    /// Returns the server error payload, if this is a server reply.
    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            ClientError::Server(err) => Some(err),
            _ => None,
        }
    }
}

/// Error reply sent by the server (`-ERR ...`, `-WRONGTYPE ...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    message: Vec<u8>,
}

impl ServerError {
    pub fn new(message: impl Into<Vec<u8>>) -> Self {
        ServerError {
            message: message.into(),
        }
    }

    /// Raw message bytes without the leading `-`.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// First word of the message, e.g. `WRONGTYPE`.
    pub fn code(&self) -> &[u8] {
        let end = self
            .message
            .iter()
            .position(|b| *b == b' ')
            .unwrap_or(self.message.len());
        &self.message[..end]
    }

    /// True when the server reports it is still loading its dataset.
    pub fn is_loading(&self) -> bool {
        self.message.starts_with(LOADING_PREFIX)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.message))
    }
}
