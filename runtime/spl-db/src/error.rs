use serde::{Deserialize, Serialize};

/// Coarse classification of a failure, carried next to the message text so
/// callers do not have to parse strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Closed or unknown connection handle.
    ResourceState,
    /// SQL, bind, step or backup failure reported by the engine.
    Engine,
    /// A parameter could not be turned into a bind call.
    Marshal,
    /// Unknown operation or malformed arguments.
    Protocol,
    /// The execution context could not start or went away.
    Transport,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database not found")]
    NotFound,
    #[error("Database closed")]
    Closed,
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{0}")]
    Engine(#[from] rusqlite::Error),
    #[error("{0}")]
    Marshal(String),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Extension(String),
    #[error("{0}")]
    Transport(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound | Error::Closed => ErrorKind::ResourceState,
            Error::Engine(_) | Error::Io(_) | Error::Extension(_) => ErrorKind::Engine,
            Error::Marshal(_) => ErrorKind::Marshal,
            Error::UnknownFunction(_) | Error::Protocol(_) => ErrorKind::Protocol,
            Error::Transport(_) => ErrorKind::Transport,
        }
    }

    pub(crate) fn invalid_argument(operation: &str, index: usize, expected: &str) -> Self {
        Error::Protocol(format!(
            "Invalid argument {index} for '{operation}': expected {expected}"
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
