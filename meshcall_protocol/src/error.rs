use std::fmt::Display;

use strum_macros::{Display, EnumIter, EnumString};

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString)]
pub enum ErrorKind {
    /// no instance or connection could be leased
    Acquire,
    /// the wire call itself failed
    Transport,
    /// the remote instance ran the call and reported a failure
    Remote,
    Serialization,
    Timeout,
    /// the pool or client has been shut down
    Closed,
    Client,
    Other,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new<E: Display>(kind: ErrorKind, err: E) -> Self {
        Error {
            kind,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Application-level failures are the only ones the dispatch engine
    /// does not treat as transport failures.
    pub fn is_remote(&self) -> bool {
        self.kind == ErrorKind::Remote
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error {
            kind: ErrorKind::Other,
            message,
        }
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::from(message.to_owned())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Serialization, err)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::new(ErrorKind::Serialization, err)
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::new(ErrorKind::Serialization, err)
    }
}
